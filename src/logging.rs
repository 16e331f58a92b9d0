//! Log initialization and the SIGHUP reopen path.
//!
//! When a log file is configured, writes go through a sink that checks a
//! process-wide atomic flag on every write and reopens the file when it is
//! set. The signal handler only sets the flag; the reopen itself always
//! happens on a normal code path.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::LevelFilter;

#[derive(Debug, Default)]
pub struct ReopenFlag(AtomicBool);

impl ReopenFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

struct ReopenableFile {
    path: PathBuf,
    file: Option<File>,
    flag: Arc<ReopenFlag>,
}

impl ReopenableFile {
    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }
}

impl Write for ReopenableFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.flag.take() {
            match Self::open(&self.path) {
                Ok(f) => self.file = Some(f),
                Err(e) => eprintln!("failed to reopen log file: {e}"),
            }
        }
        match &mut self.file {
            Some(f) => f.write(buf),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(f) => f.flush(),
            None => io::stderr().flush(),
        }
    }
}

/// Initialize the logger. Returns the reopen flag to wire to SIGHUP.
pub fn init(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<Arc<ReopenFlag>> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let flag = Arc::new(ReopenFlag::default());

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);
    if let Some(path) = log_file {
        let sink = ReopenableFile {
            file: Some(ReopenableFile::open(path)?),
            path: path.to_path_buf(),
            flag: flag.clone(),
        };
        builder.target(env_logger::Target::Pipe(Box::new(sink)));
    }
    builder.init();
    Ok(flag)
}
