//! Control channel: line-based command dispatch, authorization, and the
//! learning path.
//!
//! A controller session mirrors the scanning task: it owns a memory pool
//! and drives async work (classifier updates) through an async session.
//! Commands live in a registry; external modules may register their own
//! alongside the built-ins, flagged privileged and/or message-carrying.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use crate::classifier::{self, ClassifierRegistry};
use crate::config::Config;
use crate::error::{AuthError, ClassifierError};
use crate::fuzzy::FuzzyMeta;
use crate::logging::ReopenFlag;
use crate::mempool::MemPool;
use crate::session::AsyncSession;
use crate::statfile::StatfilePool;
use crate::stats::ServerStats;
use crate::worker::Shutdown;

const END_MARKER: &str = "END\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Command,
    Learn,
    Reply,
    Quit,
    Other,
    Wait,
    Weights,
}

/// Handler for message-carrying commands outside the built-in learn and
/// weights paths; runs against the buffered message once it is read.
pub type OtherHandler = Arc<dyn Fn(&[u8], &Arc<ControllerEnv>) -> String + Send + Sync>;

/// What a command handler asks the session driver to do next.
pub enum CommandAction {
    Reply(String),
    Authorize { ok: bool },
    BeginLearn(LearnParams),
    BeginWeights { classifier: String, length: usize },
    BeginOther { length: usize, handler: OtherHandler },
    Quit,
    Shutdown,
    ReopenLogs,
}

#[derive(Debug, Clone)]
pub struct LearnParams {
    pub classifier: String,
    pub spam: bool,
    pub length: usize,
    pub symbol: String,
    pub multiplier: f64,
    pub rcpt: Option<String>,
    pub from: Option<String>,
}

/// Request snapshot handed to handlers; owned so handler futures are
/// self-contained.
pub struct CommandRequest {
    pub args: Vec<String>,
    pub authorized: bool,
    pub env: Arc<ControllerEnv>,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = CommandAction> + Send>>;
pub type CommandHandler = Arc<dyn Fn(CommandRequest) -> HandlerFuture + Send + Sync>;

struct RegisteredCommand {
    handler: CommandHandler,
    privileged: bool,
    requires_message: bool,
}

/// Command table: built-ins plus externally registered commands.
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, RegisteredCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let registry = CommandRegistry {
            commands: RwLock::new(HashMap::new()),
        };
        registry.install_builtins();
        registry
    }

    pub fn register(
        &self,
        name: &str,
        handler: CommandHandler,
        privileged: bool,
        requires_message: bool,
    ) {
        log::debug!("registered controller command {name}");
        self.commands.write().insert(
            name.to_ascii_lowercase(),
            RegisteredCommand {
                handler,
                privileged,
                requires_message,
            },
        );
    }

    fn lookup(&self, name: &str) -> Option<(CommandHandler, bool, bool)> {
        self.commands
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|c| (c.handler.clone(), c.privileged, c.requires_message))
    }

    fn install_builtins(&self) {
        self.register(
            "password",
            Arc::new(|req: CommandRequest| {
                Box::pin(async move {
                    let supplied = req.args.first().cloned().unwrap_or_default();
                    let ok = match &req.env.config.controller_password {
                        Some(expected) => &supplied == expected,
                        // No password configured: every session is trusted.
                        None => true,
                    };
                    CommandAction::Authorize { ok }
                })
            }),
            false,
            false,
        );

        self.register(
            "stat",
            Arc::new(|req: CommandRequest| {
                Box::pin(async move {
                    let s = req.env.stats.snapshot();
                    let mut out = String::new();
                    out.push_str(&format!("Messages scanned: {}\r\n", s.messages_scanned));
                    out.push_str(&format!("Messages spam: {}\r\n", s.messages_spam));
                    out.push_str(&format!("Messages ham: {}\r\n", s.messages_ham));
                    out.push_str(&format!("Messages learned: {}\r\n", s.messages_learned));
                    out.push_str(&format!("Connections: {}\r\n", s.connections_count));
                    out.push_str(&format!(
                        "Control connections: {}\r\n",
                        s.control_connections_count
                    ));
                    out.push_str(&format!("Fuzzy hashes: {}\r\n", s.fuzzy_hashes));
                    out.push_str(&format!(
                        "Fuzzy hashes expired: {}\r\n",
                        s.fuzzy_hashes_expired
                    ));
                    for (name, info) in req.env.statfiles.list() {
                        out.push_str(&format!(
                            "Statfile {name}: {} of {} records, revision {}\r\n",
                            info.used, info.capacity, info.revision
                        ));
                    }
                    CommandAction::Reply(out)
                })
            }),
            false,
            false,
        );

        self.register(
            "uptime",
            Arc::new(|req: CommandRequest| {
                Box::pin(async move {
                    let secs = req.env.started_at.elapsed().as_secs();
                    CommandAction::Reply(format!("Uptime: {secs} seconds\r\n"))
                })
            }),
            false,
            false,
        );

        self.register(
            "learn",
            Arc::new(|req: CommandRequest| {
                Box::pin(async move {
                    match parse_learn_args(&req.args) {
                        Ok(params) => CommandAction::BeginLearn(params),
                        Err(e) => CommandAction::Reply(format!("error: {e}\r\n")),
                    }
                })
            }),
            true,
            true,
        );

        self.register(
            "weights",
            Arc::new(|req: CommandRequest| {
                Box::pin(async move {
                    let classifier = req
                        .args
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "bayes".to_string());
                    match req.args.get(1).and_then(|s| s.parse::<usize>().ok()) {
                        Some(length) => CommandAction::BeginWeights { classifier, length },
                        None => {
                            CommandAction::Reply("error: weights <classifier> <length>\r\n".into())
                        }
                    }
                })
            }),
            false,
            true,
        );

        self.register(
            "fuzzy_add",
            Arc::new(|req: CommandRequest| {
                Box::pin(async move {
                    let Some(length) = req.args.first().and_then(|s| s.parse::<usize>().ok())
                    else {
                        return CommandAction::Reply(
                            "error: fuzzy_add <length> [flags] [ttl]\r\n".to_string(),
                        );
                    };
                    let flags: u32 = req.args.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
                    let ttl: Option<u64> = req.args.get(2).and_then(|s| s.parse().ok());
                    CommandAction::BeginOther {
                        length,
                        handler: Arc::new(move |buf, env| {
                            let Some(store) = env.statfiles.fuzzy() else {
                                return "error: fuzzy store not available\r\n".to_string();
                            };
                            let text = String::from_utf8_lossy(buf);
                            let hash = classifier::fuzzy_hash(&text);
                            let ttl = ttl.unwrap_or(env.config.fuzzy_ttl_secs);
                            match store.store(hash, FuzzyMeta { flags, value: 0 }, ttl) {
                                Ok(()) => {
                                    ServerStats::inc(&env.stats.fuzzy_hashes);
                                    format!("stored fuzzy hash {hash:016x}\r\n")
                                }
                                Err(e) => format!("error: {e}\r\n"),
                            }
                        }),
                    }
                })
            }),
            true,
            true,
        );

        self.register(
            "quit",
            Arc::new(|_req: CommandRequest| Box::pin(async { CommandAction::Quit })),
            false,
            false,
        );

        self.register(
            "shutdown",
            Arc::new(|_req: CommandRequest| Box::pin(async { CommandAction::Shutdown })),
            true,
            false,
        );

        self.register(
            "reload",
            Arc::new(|_req: CommandRequest| Box::pin(async { CommandAction::ReopenLogs })),
            true,
            false,
        );
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_learn_args(args: &[String]) -> Result<LearnParams, String> {
    // learn <classifier> <spam|ham> <length> [-m mult] [-r rcpt] [-f from] [-s symbol]
    if args.len() < 3 {
        return Err("learn <classifier> <spam|ham> <length>".to_string());
    }
    let classifier = args[0].clone();
    let spam = match args[1].to_ascii_lowercase().as_str() {
        "spam" => true,
        "ham" => false,
        other => return Err(format!("expected spam or ham, got {other}")),
    };
    let length: usize = args[2]
        .parse()
        .map_err(|_| format!("bad length {}", args[2]))?;

    let mut params = LearnParams {
        classifier,
        spam,
        length,
        symbol: if spam { "BAYES_SPAM" } else { "BAYES_HAM" }.to_string(),
        multiplier: 1.0,
        rcpt: None,
        from: None,
    };
    let mut it = args[3..].iter();
    while let Some(flag) = it.next() {
        let value = it.next();
        match (flag.as_str(), value) {
            ("-m", Some(v)) => {
                params.multiplier = v.parse().map_err(|_| format!("bad multiplier {v}"))?
            }
            ("-r", Some(v)) => params.rcpt = Some(v.clone()),
            ("-f", Some(v)) => params.from = Some(v.clone()),
            ("-s", Some(v)) => params.symbol = v.clone(),
            (f, _) => return Err(format!("unknown learn flag {f}")),
        }
    }
    Ok(params)
}

/// Shared dependencies for controller sessions.
pub struct ControllerEnv {
    pub config: Arc<Config>,
    pub stats: Arc<ServerStats>,
    pub statfiles: Arc<StatfilePool>,
    pub classifiers: Arc<ClassifierRegistry>,
    pub registry: Arc<CommandRegistry>,
    pub shutdown: Shutdown,
    pub reopen_log: Arc<ReopenFlag>,
    pub started_at: Instant,
}

#[derive(Debug)]
pub struct ControllerSummary {
    pub state: ControllerState,
    pub commands: u32,
}

struct ControllerSession {
    state: ControllerState,
    authorized: bool,
    pool: MemPool,
    commands: u32,
}

/// Drive one control connection.
pub async fn run_controller_session<S>(stream: S, env: Arc<ControllerEnv>) -> ControllerSummary
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ServerStats::inc(&env.stats.control_connections_count);
    let io_timeout = Duration::from_secs(env.config.io_timeout_secs);
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let mut session = ControllerSession {
        state: ControllerState::Command,
        authorized: env.config.controller_password.is_none(),
        pool: MemPool::new(),
        commands: 0,
    };
    let mut pending_reply = String::new();
    let mut pending_learn: Option<LearnParams> = None;
    let mut pending_other: Option<(usize, OtherHandler)> = None;

    loop {
        match session.state {
            ControllerState::Command => {
                let line = match read_line(&mut reader, io_timeout).await {
                    Some(l) => l,
                    None => {
                        session.state = ControllerState::Quit;
                        continue;
                    }
                };
                if line.is_empty() {
                    continue;
                }
                session.commands += 1;
                let mut words = line.split_whitespace().map(|s| s.to_string());
                let name = words.next().unwrap_or_default();
                let args: Vec<String> = words.collect();

                let Some((handler, privileged, _requires_message)) = env.registry.lookup(&name)
                else {
                    pending_reply = format!("error: unknown command {name}\r\n");
                    session.state = ControllerState::Reply;
                    continue;
                };

                if privileged && !session.authorized {
                    // The handler must not run at all.
                    log::info!("unauthorized {name} command rejected");
                    pending_reply = format!("error: {}\r\n", AuthError);
                    session.state = ControllerState::Reply;
                    continue;
                }

                let action = handler(CommandRequest {
                    args,
                    authorized: session.authorized,
                    env: env.clone(),
                })
                .await;

                match action {
                    CommandAction::Reply(text) => {
                        pending_reply = text;
                        session.state = ControllerState::Reply;
                    }
                    CommandAction::Authorize { ok } => {
                        session.authorized = ok;
                        pending_reply = if ok {
                            "password accepted\r\n".to_string()
                        } else {
                            "password rejected\r\n".to_string()
                        };
                        session.state = ControllerState::Reply;
                    }
                    CommandAction::BeginLearn(params) => {
                        pending_learn = Some(params);
                        session.state = ControllerState::Learn;
                    }
                    CommandAction::BeginOther { length, handler } => {
                        pending_other = Some((length, handler));
                        session.state = ControllerState::Other;
                    }
                    CommandAction::BeginWeights { classifier, length } => {
                        pending_reply =
                            weights_reply(&mut reader, &mut session, &env, &classifier, length, io_timeout)
                                .await;
                        session.state = ControllerState::Reply;
                    }
                    CommandAction::Quit => {
                        session.state = ControllerState::Quit;
                    }
                    CommandAction::Shutdown => {
                        log::info!("shutdown requested via control channel");
                        env.shutdown.begin();
                        pending_reply = "shutting down\r\n".to_string();
                        session.state = ControllerState::Reply;
                    }
                    CommandAction::ReopenLogs => {
                        env.reopen_log.request();
                        pending_reply = "log reopen scheduled\r\n".to_string();
                        session.state = ControllerState::Reply;
                    }
                }
            }

            ControllerState::Learn => {
                let params = pending_learn.take().expect("learn state without params");
                let buffered =
                    read_buffer(&mut reader, &mut session.pool, params.length, io_timeout).await;
                match buffered {
                    None => {
                        pending_reply = "error: learn buffer truncated\r\n".to_string();
                        session.state = ControllerState::Reply;
                    }
                    Some(handle) => {
                        // Classifier update runs off the event loop under a
                        // fresh async session; its finalize settles the
                        // learned counter exactly once.
                        let text = session.pool.get(handle).with(|b| {
                            String::from_utf8_lossy(b).into_owned()
                        });
                        session.state = ControllerState::Wait;
                        pending_reply = run_learn(&env, params, text).await;
                        session.state = ControllerState::Reply;
                    }
                }
            }

            ControllerState::Wait => {
                // Wait is entered inline by Learn/custom handlers awaiting
                // external completion; nothing to poll here.
                unreachable!("Wait is driven inline")
            }

            ControllerState::Weights => {
                unreachable!("Weights is driven inline")
            }

            ControllerState::Other => {
                let (length, handler) = pending_other.take().expect("other state without handler");
                let buffered = read_buffer(&mut reader, &mut session.pool, length, io_timeout).await;
                match buffered {
                    None => {
                        pending_reply = "error: message buffer truncated\r\n".to_string();
                    }
                    Some(handle) => {
                        pending_reply = session.pool.get(handle).with(|b| handler(b, &env));
                    }
                }
                session.state = ControllerState::Reply;
            }

            ControllerState::Reply => {
                let mut out = std::mem::take(&mut pending_reply);
                out.push_str(END_MARKER);
                if timeout(io_timeout, write_half.write_all(out.as_bytes()))
                    .await
                    .map(|r| r.is_err())
                    .unwrap_or(true)
                {
                    session.state = ControllerState::Quit;
                } else {
                    session.state = ControllerState::Command;
                }
            }

            ControllerState::Quit => {
                let _ = write_half.write_all(b"bye\r\n").await;
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }

    ControllerSummary {
        state: session.state,
        commands: session.commands,
    }
}

/// Learn path: tokenize the buffer and feed the classifier off-thread,
/// tracked by a dedicated async session whose finalize bumps the learned
/// counter.
async fn run_learn(env: &Arc<ControllerEnv>, params: LearnParams, text: String) -> String {
    let classifier = match env.classifiers.get(&params.classifier) {
        Ok(c) => c,
        Err(e) => return format!("error: {e}\r\n"),
    };

    let stats = env.stats.clone();
    let learn_session = AsyncSession::begin(Box::new(move || {
        ServerStats::inc(&stats.messages_learned);
    }));

    let tokens = classifier::tokenize(&text);
    learn_session.watch();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let sess = learn_session.clone();
    let spam = params.spam;
    let multiplier = params.multiplier;
    tokio::task::spawn_blocking(move || {
        let result = classifier.learn(&tokens, spam, multiplier);
        let _ = tx.send(result);
        sess.finish();
    });
    learn_session.dispatch_done();

    let result: Result<_, ClassifierError> = match rx.await {
        Ok(r) => r,
        Err(_) => Err(ClassifierError::Learn("learn task died".to_string())),
    };
    learn_session.wait().await;

    match result {
        Ok(summary) => {
            log::info!(
                "learned {} as {} (multiplier {}, rcpt {:?})",
                summary.tokens,
                params.symbol,
                params.multiplier,
                params.rcpt
            );
            format!(
                "learned {} tokens as {} into {}\r\n",
                summary.tokens, params.symbol, summary.statfile
            )
        }
        Err(e) => format!("error: {e}\r\n"),
    }
}

/// Weights path: show how a message's tokens hit each half of a classifier.
async fn weights_reply<R>(
    reader: &mut R,
    session: &mut ControllerSession,
    env: &Arc<ControllerEnv>,
    classifier_name: &str,
    length: usize,
    io_timeout: Duration,
) -> String
where
    R: AsyncRead + Unpin,
{
    session.state = ControllerState::Weights;
    let Some(handle) = read_buffer(reader, &mut session.pool, length, io_timeout).await else {
        return "error: weights buffer truncated\r\n".to_string();
    };
    let text = session
        .pool
        .get(handle)
        .with(|b| String::from_utf8_lossy(b).into_owned());

    let classifier = match env.classifiers.get(classifier_name) {
        Ok(c) => c,
        Err(e) => return format!("error: {e}\r\n"),
    };
    let tokens = classifier::tokenize(&text);
    let report = classifier.weights(&tokens);
    match serde_json::to_string(&report) {
        Ok(json) => format!("{json}\r\n"),
        Err(e) => format!("error: {e}\r\n"),
    }
}

async fn read_line<R>(reader: &mut R, io_timeout: Duration) -> Option<String>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    match timeout(io_timeout, reader.read_line(&mut line)).await {
        Ok(Ok(0)) | Err(_) => None,
        Ok(Ok(_)) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        Ok(Err(e)) => {
            log::debug!("control read failed: {e}");
            None
        }
    }
}

/// Read an exact-length buffer into the session pool.
async fn read_buffer<R>(
    reader: &mut R,
    pool: &mut MemPool,
    length: usize,
    io_timeout: Duration,
) -> Option<crate::mempool::PoolBytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; length];
    match timeout(io_timeout, reader.read_exact(&mut buf)).await {
        Ok(Ok(_)) => Some(pool.alloc(&buf)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::hash_token;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        _dir: tempfile::TempDir,
        env: Arc<ControllerEnv>,
    }

    fn fixture(password: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.io_timeout_secs = 5;
        config.controller_password = password.map(|s| s.to_string());
        config.statfile_dir = dir.path().to_path_buf();

        let statfiles = Arc::new(StatfilePool::new(dir.path()));
        statfiles.open_fuzzy(64 * 1024).unwrap();
        let mut classifiers = ClassifierRegistry::new();
        classifiers
            .open_bayes("bayes", &statfiles, 64 * 1024)
            .unwrap();

        let shutdown = Shutdown::new();
        let env = Arc::new(ControllerEnv {
            config: Arc::new(config),
            stats: Arc::new(ServerStats::new()),
            statfiles,
            classifiers: Arc::new(classifiers),
            registry: Arc::new(CommandRegistry::new()),
            shutdown,
            reopen_log: Arc::new(ReopenFlag::default()),
            started_at: Instant::now(),
        });
        Fixture { _dir: dir, env }
    }

    async fn converse(env: Arc<ControllerEnv>, input: &[u8]) -> (ControllerSummary, String) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle =
            tokio::spawn(async move { run_controller_session(server, env).await });
        let (mut cr, mut cw) = tokio::io::split(client);
        cw.write_all(input).await.unwrap();
        drop(cw);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut cr, &mut out)
            .await
            .unwrap();
        let summary = handle.await.unwrap();
        (summary, String::from_utf8_lossy(&out).into_owned())
    }

    #[tokio::test]
    async fn stat_and_quit() {
        let fx = fixture(None);
        let (summary, out) = converse(fx.env.clone(), b"stat\r\nquit\r\n").await;
        assert_eq!(summary.state, ControllerState::Quit);
        assert!(out.contains("Messages scanned: 0"));
        assert!(out.contains("Statfile bayes.spam:"));
        assert!(out.contains("END\r\n"));
        assert!(out.ends_with("bye\r\n"));
    }

    #[tokio::test]
    async fn unknown_command() {
        let fx = fixture(None);
        let (_, out) = converse(fx.env.clone(), b"frobnicate\r\nquit\r\n").await;
        assert!(out.contains("error: unknown command frobnicate"));
    }

    #[tokio::test]
    async fn privileged_command_requires_password() {
        let fx = fixture(Some("secret"));
        let executed = Arc::new(AtomicUsize::new(0));
        let flag = executed.clone();
        fx.env.registry.register(
            "wipe",
            Arc::new(move |_req: CommandRequest| {
                let flag = flag.clone();
                Box::pin(async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                    CommandAction::Reply("wiped\r\n".to_string())
                })
            }),
            true,
            false,
        );

        // Unauthorized: handler must never run.
        let (_, out) = converse(fx.env.clone(), b"wipe\r\nquit\r\n").await;
        assert!(out.contains("error: command requires authorization"));
        assert_eq!(executed.load(Ordering::SeqCst), 0);

        // Wrong password does not help.
        let (_, out) =
            converse(fx.env.clone(), b"password wrong\r\nwipe\r\nquit\r\n").await;
        assert!(out.contains("password rejected"));
        assert!(out.contains("error: command requires authorization"));
        assert_eq!(executed.load(Ordering::SeqCst), 0);

        // Right password unlocks it.
        let (_, out) =
            converse(fx.env.clone(), b"password secret\r\nwipe\r\nquit\r\n").await;
        assert!(out.contains("password accepted"));
        assert!(out.contains("wiped"));
        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn learn_updates_statfile() {
        let fx = fixture(None);
        let body = "cheap pills limited offer";
        let input = format!("learn bayes spam {} -m 1.0\r\n{}quit\r\n", body.len(), body);
        let (_, out) = converse(fx.env.clone(), input.as_bytes()).await;
        assert!(out.contains("learned 4 tokens as BAYES_SPAM into bayes.spam"));
        assert_eq!(fx.env.stats.snapshot().messages_learned, 1);

        // The statfile observably holds the learned token.
        let spam = fx.env.statfiles.get("bayes.spam").unwrap();
        let (count, weight) = spam.get(hash_token("pills")).unwrap();
        assert_eq!(count, 1);
        assert!((weight - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn learn_multiplier_scales_weight() {
        let fx = fixture(None);
        let body = "viagra";
        let input = format!("learn bayes spam {} -m 2.5\r\n{}quit\r\n", body.len(), body);
        let (_, out) = converse(fx.env.clone(), input.as_bytes()).await;
        assert!(out.contains("learned 1 tokens as BAYES_SPAM"));
        let spam = fx.env.statfiles.get("bayes.spam").unwrap();
        let (_, weight) = spam.get(hash_token("viagra")).unwrap();
        assert!((weight - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn learn_unknown_classifier() {
        let fx = fixture(None);
        let input = "learn nope spam 4\r\nbody quit\r\n".to_string();
        let (_, out) = converse(fx.env.clone(), input.as_bytes()).await;
        assert!(out.contains("error: unknown classifier: nope"));
    }

    #[tokio::test]
    async fn weights_reports_hits() {
        let fx = fixture(None);
        // Teach it something first.
        let body = "cheap pills";
        let learn = format!("learn bayes spam {}\r\n{}", body.len(), body);
        let probe = "cheap pills meeting";
        let weights = format!("weights bayes {}\r\n{}", probe.len(), probe);
        let input = format!("{learn}{weights}quit\r\n");
        let (_, out) = converse(fx.env.clone(), input.as_bytes()).await;
        assert!(out.contains("\"spam_hits\":2"));
        assert!(out.contains("\"ham_hits\":0"));
    }

    #[tokio::test]
    async fn fuzzy_add_stores_hash() {
        let fx = fixture(None);
        let body = "wire the funds to this account immediately or else";
        let input = format!("fuzzy_add {} 3\r\n{}quit\r\n", body.len(), body);
        let (_, out) = converse(fx.env.clone(), input.as_bytes()).await;
        assert!(out.contains("stored fuzzy hash"));
        assert_eq!(fx.env.stats.snapshot().fuzzy_hashes, 1);

        let store = fx.env.statfiles.fuzzy().unwrap();
        let hash = classifier::fuzzy_hash(body);
        let meta = store.lookup(hash).expect("hash missing after fuzzy_add");
        assert_eq!(meta.flags, 3);
    }

    #[tokio::test]
    async fn shutdown_command_begins_shutdown() {
        let fx = fixture(None);
        assert!(!fx.env.shutdown.is_active());
        let (_, out) = converse(fx.env.clone(), b"shutdown\r\nquit\r\n").await;
        assert!(out.contains("shutting down"));
        assert!(fx.env.shutdown.is_active());
    }

    #[tokio::test]
    async fn reload_sets_reopen_flag() {
        let fx = fixture(None);
        let (_, out) = converse(fx.env.clone(), b"reload\r\nquit\r\n").await;
        assert!(out.contains("log reopen scheduled"));
        assert!(fx.env.reopen_log.take());
    }
}
