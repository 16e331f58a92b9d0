use clap::{Arg, Command};
use mailvet::config::Config;
use mailvet::{logging, supervisor};
use std::process;

#[tokio::main]
async fn main() {
    let matches = Command::new("mailvetd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Real-time mail classification daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/mailvet.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(path) = matches.get_one::<String>("generate-config") {
        let config = Config::default();
        match config.to_file(path) {
            Ok(()) => {
                println!("Default configuration written to: {path}");
                return;
            }
            Err(e) => {
                eprintln!("Error writing configuration: {e}");
                process::exit(1);
            }
        }
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Configuration valid.");
        println!("  scan listener: {}", config.scan_listen);
        println!("  control listener: {}", config.controller_listen);
        println!("  scan workers: {}", config.scan_workers);
        println!("  metrics: {}", config.metrics.len());
        println!("  header rules: {}", config.header_rules.len());
        return;
    }

    let reopen_log = match logging::init(matches.get_flag("verbose"), config.log_file.as_deref())
    {
        Ok(flag) => flag,
        Err(e) => {
            eprintln!("Error initializing logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = supervisor::run(config, reopen_log).await {
        log::error!("daemon failed: {e}");
        process::exit(1);
    }
}
