//! Per-connection scanning task: the protocol FSM from first command line
//! to connection teardown.
//!
//! Read command → read headers → read message → run filters (fanning out
//! through the async session, suspending on the save point when a filter
//! needs it) → converge on exactly one finalization → write reply → close.
//! Every read is bounded by the I/O timeout and the WaitFilter state by the
//! filter watchdog, so a task always terminates.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use crate::config::Config;
use crate::error::{ProtocolError, TaskError};
use crate::filters::{advance_chain, ChainProgress, FilterRegistry, ScanContext};
use crate::mempool::MemPool;
use crate::message;
use crate::protocol::{
    self, Command, CommandLine, ProtocolVariant, ReplyData, RequestMeta, DEFAULT_VERSION,
};
use crate::savepoint::SavePoint;
use crate::session::AsyncSession;
use crate::stats::ServerStats;

/// Shared dependencies a worker hands to every task it spawns.
pub struct TaskEnv {
    pub config: Arc<Config>,
    pub stats: Arc<ServerStats>,
    pub registry: Arc<FilterRegistry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    ReadCommand,
    ReadHeader,
    ReadMessage,
    WaitFilter,
    WriteReply,
    WriteError,
    ClosingConnection,
}

/// What a finished task looked like; the worker logs it and tests assert on
/// it.
#[derive(Debug)]
pub struct TaskSummary {
    pub state: TaskState,
    pub last_error: Option<(String, u16)>,
    pub elapsed: Duration,
    pub filters_suspended: u32,
}

struct Task {
    state: TaskState,
    pool: MemPool,
    save: SavePoint,
    command: Option<CommandLine>,
    meta: RequestMeta,
    last_error: Option<(String, u16)>,
    created_at: Instant,
}

impl Task {
    fn new() -> Self {
        Task {
            state: TaskState::ReadCommand,
            pool: MemPool::new(),
            save: SavePoint::new(),
            command: None,
            meta: RequestMeta::default(),
            last_error: None,
            created_at: Instant::now(),
        }
    }

    fn fail(&mut self, err: TaskError) {
        log::info!("task failed: {err}");
        self.last_error = Some((err.to_string(), err.code()));
        // I/O failures get a hard close; everything else gets an error
        // reply first.
        self.state = match err {
            TaskError::Io(_) | TaskError::Timeout => TaskState::ClosingConnection,
            _ => TaskState::WriteError,
        };
    }

    fn variant(&self) -> ProtocolVariant {
        self.command
            .as_ref()
            .map(|c| c.variant)
            .unwrap_or(ProtocolVariant::Native)
    }

    fn version(&self) -> String {
        self.command
            .as_ref()
            .map(|c| c.version.clone())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string())
    }
}

/// Drive one scanning connection to completion.
pub async fn run_task<S>(stream: S, env: &TaskEnv) -> TaskSummary
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ServerStats::inc(&env.stats.connections_count);
    let io_timeout = Duration::from_secs(env.config.io_timeout_secs);
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let mut task = Task::new();
    let mut reply: Option<String> = None;

    loop {
        match task.state {
            TaskState::ReadCommand => {
                match read_line_bounded(&mut reader, io_timeout).await {
                    Ok(line) => match protocol::parse_command_line(&line) {
                        Ok(cl) => {
                            log::debug!("command {:?} via {:?}", cl.command, cl.variant);
                            let next = if cl.command.requires_message() {
                                TaskState::ReadHeader
                            } else {
                                // PING short-circuits straight to the reply.
                                reply = Some(protocol::format_reply(&ReplyData {
                                    variant: cl.variant,
                                    version: cl.version.clone(),
                                    command: cl.command,
                                    metrics: Default::default(),
                                    thresholds: Default::default(),
                                    queue_id: None,
                                    messages: vec![],
                                }));
                                TaskState::WriteReply
                            };
                            task.command = Some(cl);
                            task.state = next;
                        }
                        Err(e) => task.fail(e.into()),
                    },
                    Err(e) => task.fail(e),
                }
            }

            TaskState::ReadHeader => {
                let mut failed = None;
                loop {
                    match read_line_bounded(&mut reader, io_timeout).await {
                        Ok(line) if line.is_empty() => break,
                        Ok(line) => {
                            if let Err(e) = task.meta.apply_header(&line) {
                                failed = Some(TaskError::from(e));
                                break;
                            }
                        }
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
                if let Some(e) = failed {
                    task.fail(e);
                } else if task.meta.content_length.is_none() {
                    task.fail(ProtocolError::MissingContentLength.into());
                } else {
                    task.state = TaskState::ReadMessage;
                }
            }

            TaskState::ReadMessage => {
                let len = task.meta.content_length.unwrap_or(0);
                let mut body = vec![0u8; len];
                use tokio::io::AsyncReadExt;
                let received = timeout(io_timeout, reader.read_exact(&mut body)).await;
                match received {
                    Err(_) => task.fail(TaskError::Timeout),
                    Ok(Err(e)) => task.fail(TaskError::Io(e)),
                    Ok(Ok(_)) => {
                        // The raw message is a task-lifetime working buffer.
                        let raw = task.pool.alloc(&body);
                        drop(body);
                        let decoded = task.pool.get(raw).with(message::decode);
                        match decoded {
                            Err(e) => task.fail(e.into()),
                            Ok(msg) => {
                                let stats = env.stats.clone();
                                let session = AsyncSession::begin(Box::new(move || {
                                    ServerStats::inc(&stats.messages_scanned);
                                }));
                                let ctx = Arc::new(ScanContext::new(
                                    msg,
                                    std::mem::take(&mut task.meta),
                                    session,
                                ));
                                task.state = TaskState::WaitFilter;
                                let formatted =
                                    wait_filters(&mut task, &ctx, env).await;
                                reply = Some(formatted);
                                task.state = TaskState::WriteReply;
                            }
                        }
                    }
                }
            }

            // Reached only through wait_filters above; listed for clarity.
            TaskState::WaitFilter => unreachable!("WaitFilter is driven inline"),

            TaskState::WriteReply => {
                let out = reply.take().unwrap_or_default();
                // Reply passes through the pool like every other transient.
                let handle = task.pool.alloc(out.as_bytes());
                let bytes = task.pool.get(handle).to_vec();
                if let Err(e) = write_all_bounded(&mut write_half, &bytes, io_timeout).await {
                    log::info!("reply write failed: {e}");
                }
                task.state = TaskState::ClosingConnection;
            }

            TaskState::WriteError => {
                let (msg, code) = task
                    .last_error
                    .clone()
                    .unwrap_or_else(|| ("internal error".to_string(), 500));
                let out = protocol::format_error(task.variant(), &task.version(), code, &msg);
                if let Err(e) = write_all_bounded(&mut write_half, out.as_bytes(), io_timeout).await
                {
                    log::info!("error reply write failed: {e}");
                }
                task.state = TaskState::ClosingConnection;
            }

            TaskState::ClosingConnection => {
                // Soft close: let buffered output drain. The pool (and with
                // it every task allocation) dies with the task.
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }

    TaskSummary {
        state: task.state,
        last_error: task.last_error.clone(),
        elapsed: task.created_at.elapsed(),
        filters_suspended: task.save.attempts,
    }
}

/// Run the filter chain and wait for the session to drain, bounded by the
/// watchdog. Returns the formatted reply.
async fn wait_filters(task: &mut Task, ctx: &Arc<ScanContext>, env: &TaskEnv) -> String {
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(env.config.filter_timeout_secs);

    // Advance the chain, pausing at the save point whenever a filter
    // suspends. The watchdog bounds the whole phase.
    loop {
        match advance_chain(ctx, &env.registry, &mut task.save) {
            ChainProgress::Done => break,
            ChainProgress::Suspended => {
                if tokio::time::timeout_at(deadline, ctx.resume.notified())
                    .await
                    .is_err()
                {
                    log::warn!("filter chain suspended past watchdog, cancelling");
                    ctx.session.force_finalize();
                    break;
                }
            }
        }
    }

    if !ctx.session.is_complete() {
        ctx.session.dispatch_done();
        if tokio::time::timeout_at(deadline, ctx.session.wait())
            .await
            .is_err()
        {
            log::warn!("filters outstanding past watchdog, forcing finalize");
            ctx.session.force_finalize();
        }
    }

    // Aggregate under the metric thresholds and settle the verdict stats.
    let metrics = ctx.results_snapshot();
    let thresholds = env.config.thresholds();
    let default_metric = env
        .config
        .metrics
        .first()
        .map(|m| (m.name.clone(), m.threshold))
        .unwrap_or_else(|| ("default".to_string(), f64::INFINITY));
    let default_score = metrics
        .get(&default_metric.0)
        .map(|m| m.score)
        .unwrap_or(0.0);
    let mut messages = Vec::new();
    if default_score >= default_metric.1 {
        ServerStats::inc(&env.stats.messages_spam);
        // Spam verdicts carry the rewritten subject for clients that tag.
        if let Some(prefix) = env
            .config
            .metrics
            .first()
            .and_then(|m| m.subject_prefix.clone())
        {
            let original = ctx.message.subject.clone().unwrap_or_default();
            messages.push(format!("Subject: {prefix}{original}"));
        }
    } else {
        ServerStats::inc(&env.stats.messages_ham);
    }
    if ctx.session.was_cancelled() {
        messages.push("scan incomplete: filter timeout".to_string());
    }

    let cl = task.command.as_ref();
    protocol::format_reply(&ReplyData {
        variant: cl.map(|c| c.variant).unwrap_or(ProtocolVariant::Native),
        version: cl
            .map(|c| c.version.clone())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        command: cl.map(|c| c.command).unwrap_or(Command::Symbols),
        metrics,
        thresholds,
        queue_id: ctx.meta.queue_id.clone(),
        messages,
    })
}

async fn read_line_bounded<R>(reader: &mut R, io_timeout: Duration) -> Result<String, TaskError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let n = timeout(io_timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| TaskError::Timeout)??;
    if n == 0 {
        return Err(TaskError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        )));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn write_all_bounded<W>(
    writer: &mut W,
    bytes: &[u8],
    io_timeout: Duration,
) -> Result<(), TaskError>
where
    W: AsyncWrite + Unpin,
{
    timeout(io_timeout, writer.write_all(bytes))
        .await
        .map_err(|_| TaskError::Timeout)??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{Filter, FilterOutcome, FilterRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FixedScoreFilter {
        score: f64,
    }

    impl Filter for FixedScoreFilter {
        fn name(&self) -> &str {
            "fixed_score"
        }
        fn run(&self, ctx: &Arc<ScanContext>) -> FilterOutcome {
            ctx.add_symbol("default", "FIXED", self.score, None);
            FilterOutcome::Completed
        }
    }

    /// Registers with the session and never calls finish.
    struct StuckFilter {
        watches: Arc<AtomicUsize>,
    }

    impl Filter for StuckFilter {
        fn name(&self) -> &str {
            "stuck"
        }
        fn run(&self, ctx: &Arc<ScanContext>) -> FilterOutcome {
            ctx.session.watch();
            self.watches.fetch_add(1, Ordering::SeqCst);
            FilterOutcome::Pending
        }
    }

    fn test_env(registry: FilterRegistry) -> Arc<TaskEnv> {
        let mut config = Config::default();
        config.io_timeout_secs = 5;
        config.filter_timeout_secs = 1;
        Arc::new(TaskEnv {
            config: Arc::new(config),
            stats: Arc::new(ServerStats::new()),
            registry: Arc::new(registry),
        })
    }

    async fn drive(env: Arc<TaskEnv>, request: &[u8]) -> (TaskSummary, String) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let env2 = env.clone();
        let server_task =
            tokio::spawn(async move { run_task(server, &env2).await });

        let (mut cr, mut cw) = tokio::io::split(client);
        cw.write_all(request).await.unwrap();
        let mut out = Vec::new();
        cr.read_to_end(&mut out).await.unwrap();
        drop(cw);
        let summary = server_task.await.unwrap();
        (summary, String::from_utf8_lossy(&out).into_owned())
    }

    #[tokio::test]
    async fn scan_with_sync_filter_reports_score() {
        let mut reg = FilterRegistry::new();
        reg.register(Arc::new(FixedScoreFilter { score: 5.0 }));
        let env = test_env(reg);

        let body = "Subject: test\r\n\r\nhello";
        let request = format!(
            "SYMBOLS MAILVET/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let (summary, reply) = drive(env.clone(), request.as_bytes()).await;

        assert_eq!(summary.state, TaskState::ClosingConnection);
        assert!(summary.last_error.is_none());
        assert!(reply.starts_with("MAILVET/1.1 0 OK\r\n"));
        assert!(reply.contains("Metric: default; False; 5.00 / 10.00\r\n"));
        assert!(reply.contains("Symbol: FIXED(5.00)\r\n"));
        assert_eq!(env.stats.snapshot().messages_scanned, 1);
        assert_eq!(env.stats.snapshot().messages_ham, 1);
    }

    #[tokio::test]
    async fn score_over_threshold_is_spam() {
        let mut reg = FilterRegistry::new();
        reg.register(Arc::new(FixedScoreFilter { score: 15.0 }));
        let env = test_env(reg);
        let body = "Subject: x\r\n\r\nbuy now";
        let request = format!(
            "CHECK MAILVET/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let (_, reply) = drive(env.clone(), request.as_bytes()).await;
        assert!(reply.contains("Metric: default; True; 15.00 / 10.00\r\n"));
        // CHECK omits symbols.
        assert!(!reply.contains("Symbol:"));
        assert_eq!(env.stats.snapshot().messages_spam, 1);
    }

    #[tokio::test]
    async fn short_body_never_reaches_reply() {
        let env = test_env(FilterRegistry::new());
        let (client, server) = tokio::io::duplex(64 * 1024);
        let env2 = env.clone();
        let server_task = tokio::spawn(async move { run_task(server, &env2).await });

        let (mut cr, mut cw) = tokio::io::split(client);
        cw.write_all(b"SYMBOLS MAILVET/1.1\r\nContent-Length: 100\r\n\r\nonly a few bytes")
            .await
            .unwrap();
        drop(cw); // connection closed before the promised 100 bytes

        let mut out = Vec::new();
        cr.read_to_end(&mut out).await.unwrap();
        let summary = server_task.await.unwrap();

        assert_eq!(summary.state, TaskState::ClosingConnection);
        assert!(summary.last_error.is_some());
        assert!(!String::from_utf8_lossy(&out).contains("Metric:"));
        assert_eq!(env.stats.snapshot().messages_scanned, 0);
    }

    #[tokio::test]
    async fn unknown_command_gets_protocol_error() {
        let env = test_env(FilterRegistry::new());
        let (summary, reply) = drive(env, b"FROBNICATE MAILVET/1.1\r\n").await;
        assert_eq!(summary.state, TaskState::ClosingConnection);
        assert!(reply.contains("400 unknown command: FROBNICATE"));
    }

    #[tokio::test]
    async fn missing_content_length_is_rejected() {
        let env = test_env(FilterRegistry::new());
        let (_, reply) = drive(env, b"SYMBOLS MAILVET/1.1\r\nFrom: a@b\r\n\r\n").await;
        assert!(reply.contains("400 missing Content-Length header"));
    }

    #[tokio::test]
    async fn ping_pongs_without_message() {
        let env = test_env(FilterRegistry::new());
        let (summary, reply) = drive(env, b"PING MAILVET/1.1\r\n").await;
        assert_eq!(summary.state, TaskState::ClosingConnection);
        assert!(reply.starts_with("MAILVET/1.1 0 OK\r\n"));
        assert!(reply.contains("PONG\r\n"));
    }

    #[tokio::test]
    async fn stuck_filter_is_bounded_by_watchdog() {
        let watches = Arc::new(AtomicUsize::new(0));
        let mut reg = FilterRegistry::new();
        reg.register(Arc::new(FixedScoreFilter { score: 2.0 }));
        reg.register(Arc::new(StuckFilter {
            watches: watches.clone(),
        }));
        let env = test_env(reg);

        let body = "Subject: t\r\n\r\nbody";
        let request = format!(
            "SYMBOLS MAILVET/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let started = Instant::now();
        let (summary, reply) = drive(env.clone(), request.as_bytes()).await;

        // Reply arrived via force_finalize, inside the watchdog window.
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(summary.state, TaskState::ClosingConnection);
        assert_eq!(watches.load(Ordering::SeqCst), 1);
        assert!(reply.contains("Metric: default; False; 2.00 / 10.00\r\n"));
        assert!(reply.contains("Message: scan incomplete: filter timeout\r\n"));
        // Finalize still fired exactly once.
        assert_eq!(env.stats.snapshot().messages_scanned, 1);
    }

    #[tokio::test]
    async fn queue_id_is_echoed() {
        let mut reg = FilterRegistry::new();
        reg.register(Arc::new(FixedScoreFilter { score: 1.0 }));
        let env = test_env(reg);
        let body = "Subject: q\r\n\r\nbody";
        let request = format!(
            "SYMBOLS MAILVET/1.1\r\nContent-Length: {}\r\nQueue-Id: AB12CD\r\n\r\n{}",
            body.len(),
            body
        );
        let (_, reply) = drive(env, request.as_bytes()).await;
        assert!(reply.contains("Queue-ID: AB12CD\r\n"));
    }
}
