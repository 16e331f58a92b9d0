//! Main-process model: owns the shared state (stats block, statfile pool,
//! classifier and filter registries), spawns workers of each configured
//! type, respawns them on unexpected exit, and coordinates graceful
//! shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::classifier::ClassifierRegistry;
use crate::config::Config;
use crate::controller::{CommandRegistry, ControllerEnv};
use crate::filters::{BayesFilter, FilterRegistry, FuzzyFilter, HeaderRuleFilter, UrlDnsFilter};
use crate::fuzzy::unix_now;
use crate::logging::ReopenFlag;
use crate::resolver::Resolver;
use crate::statfile::StatfilePool;
use crate::stats::ServerStats;
use crate::task::TaskEnv;
use crate::worker::{run_controller_worker, run_scan_worker, Shutdown, WorkerKind};

#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub kind: WorkerKind,
    pub started: Instant,
}

/// Live workers by identity. Pure bookkeeping; the supervisor loop drives
/// it from worker-exit notifications.
#[derive(Default)]
pub struct WorkerTable {
    next_id: u64,
    workers: HashMap<u64, WorkerEntry>,
}

impl WorkerTable {
    pub fn new() -> Self {
        WorkerTable::default()
    }

    pub fn add(&mut self, kind: WorkerKind) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.workers.insert(
            id,
            WorkerEntry {
                kind,
                started: Instant::now(),
            },
        );
        id
    }

    /// Record a worker exit. Returns the kind to respawn, or None during a
    /// soft shutdown (expected exits are not respawned).
    pub fn note_exit(&mut self, id: u64, shutdown_active: bool) -> Option<WorkerKind> {
        let entry = self.workers.remove(&id)?;
        if shutdown_active {
            log::info!("{} worker {id} exited for shutdown", entry.kind);
            return None;
        }
        log::warn!(
            "{} worker {id} exited unexpectedly after {:?}, respawning",
            entry.kind,
            entry.started.elapsed()
        );
        Some(entry.kind)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn count(&self, kind: WorkerKind) -> usize {
        self.workers.values().filter(|w| w.kind == kind).count()
    }
}

/// Build the shared filter registry from configuration.
fn build_filters(
    config: &Config,
    statfiles: &StatfilePool,
    classifiers: &mut ClassifierRegistry,
) -> anyhow::Result<FilterRegistry> {
    let mut registry = FilterRegistry::new();

    if !config.header_rules.is_empty() {
        registry.register(Arc::new(HeaderRuleFilter::new(&config.header_rules)?));
    }

    match classifiers.open_bayes(&config.classifier.name, statfiles, config.statfile_size) {
        Ok(classifier) => {
            registry.register(Arc::new(BayesFilter::new(
                classifier,
                crate::config::DEFAULT_METRIC,
                config.classifier.weight,
            )));
        }
        Err(e) => {
            // Statfile trouble degrades classification, never the daemon.
            log::error!(
                "classifier {} unavailable, continuing without it: {e}",
                config.classifier.name
            );
        }
    }

    match statfiles.open_fuzzy(config.fuzzy_size) {
        Ok(store) => {
            registry.register(Arc::new(FuzzyFilter::new(
                store,
                crate::config::DEFAULT_METRIC,
                config.fuzzy_score,
            )));
        }
        Err(e) => {
            log::error!("fuzzy store unavailable, continuing without it: {e}");
        }
    }

    if let Some(dnsbl) = &config.url_dnsbl {
        registry.register(Arc::new(UrlDnsFilter::new(
            Resolver::new(),
            &dnsbl.zone,
            crate::config::DEFAULT_METRIC,
            dnsbl.score,
        )));
    }

    Ok(registry)
}

/// Run the daemon until a shutdown signal lands and the grace period ends.
pub async fn run(config: Config, reopen_log: Arc<ReopenFlag>) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let stats = Arc::new(ServerStats::new());
    let statfiles = Arc::new(StatfilePool::new(&config.statfile_dir));
    let mut classifiers = ClassifierRegistry::new();
    let filters = Arc::new(build_filters(&config, &statfiles, &mut classifiers)?);
    let classifiers = Arc::new(classifiers);
    let shutdown = Shutdown::new();

    let task_env = Arc::new(TaskEnv {
        config: config.clone(),
        stats: stats.clone(),
        registry: filters,
    });
    let controller_env = Arc::new(ControllerEnv {
        config: config.clone(),
        stats: stats.clone(),
        statfiles: statfiles.clone(),
        classifiers,
        registry: Arc::new(CommandRegistry::new()),
        shutdown: shutdown.clone(),
        reopen_log: reopen_log.clone(),
        started_at: Instant::now(),
    });

    let scan_listener = Arc::new(TcpListener::bind(&config.scan_listen).await?);
    let controller_listener = Arc::new(TcpListener::bind(&config.controller_listen).await?);
    log::info!(
        "listening on {} (scan) and {} (control)",
        config.scan_listen,
        config.controller_listen
    );

    // Workers notify their exit over this channel; the supervisor decides
    // whether to respawn.
    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<u64>();
    let mut table = WorkerTable::new();

    let spawn_worker = |table: &mut WorkerTable, kind: WorkerKind| {
        let id = table.add(kind);
        let exit_tx = exit_tx.clone();
        let shutdown = shutdown.clone();
        match kind {
            WorkerKind::Scan => {
                let listener = scan_listener.clone();
                let env = task_env.clone();
                tokio::spawn(async move {
                    run_scan_worker(id, listener, env, shutdown).await;
                    let _ = exit_tx.send(id);
                });
            }
            WorkerKind::Controller => {
                let listener = controller_listener.clone();
                let env = controller_env.clone();
                tokio::spawn(async move {
                    run_controller_worker(id, listener, env, shutdown).await;
                    let _ = exit_tx.send(id);
                });
            }
        }
        id
    };

    for _ in 0..config.scan_workers {
        spawn_worker(&mut table, WorkerKind::Scan);
    }
    spawn_worker(&mut table, WorkerKind::Controller);

    spawn_fuzzy_sweeper(&config, &statfiles, &stats, shutdown.clone());
    spawn_signal_handlers(shutdown.clone(), reopen_log);

    // Supervise until shutdown, respawning unexpected exits.
    loop {
        tokio::select! {
            Some(id) = exit_rx.recv() => {
                if let Some(kind) = table.note_exit(id, shutdown.is_active()) {
                    spawn_worker(&mut table, kind);
                }
            }
            _ = shutdown.wait() => break,
        }
    }

    // Drain: workers run their own grace period; give them that plus a
    // margin, then stop waiting.
    log::info!("soft shutdown: waiting for {} workers", table.len());
    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(config.soft_shutdown_secs + 2);
    while !table.is_empty() {
        match tokio::time::timeout_at(deadline, exit_rx.recv()).await {
            Ok(Some(id)) => {
                table.note_exit(id, true);
            }
            Ok(None) => break,
            Err(_) => {
                log::warn!("{} workers past grace period, terminating hard", table.len());
                break;
            }
        }
    }
    log::info!("shutdown complete");
    Ok(())
}

/// Periodic fuzzy-hash expiry; keeps lookups from paying for cleanup.
fn spawn_fuzzy_sweeper(
    config: &Arc<Config>,
    statfiles: &Arc<StatfilePool>,
    stats: &Arc<ServerStats>,
    shutdown: Shutdown,
) {
    let interval = Duration::from_secs(config.fuzzy_sweep_secs.max(1));
    let statfiles = statfiles.clone();
    let stats = stats.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(store) = statfiles.fuzzy() else { continue };
                    let stats = stats.clone();
                    let swept = tokio::task::spawn_blocking(move || {
                        store.expire_sweep(unix_now())
                    })
                    .await;
                    match swept {
                        Ok(Ok(n)) => ServerStats::add(&stats.fuzzy_hashes_expired, n),
                        Ok(Err(e)) => log::error!("fuzzy sweep failed: {e}"),
                        Err(e) => log::error!("fuzzy sweep task died: {e}"),
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
    });
}

fn spawn_signal_handlers(shutdown: Shutdown, reopen_log: Arc<ReopenFlag>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("cannot install SIGTERM handler: {e}");
                    return;
                }
            };
            let mut int = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("cannot install SIGINT handler: {e}");
                    return;
                }
            };
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("cannot install SIGHUP handler: {e}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = term.recv() => {
                        log::info!("SIGTERM: beginning soft shutdown");
                        shutdown.begin();
                    }
                    _ = int.recv() => {
                        log::info!("SIGINT: beginning soft shutdown");
                        shutdown.begin();
                    }
                    _ = hup.recv() => {
                        log::info!("SIGHUP: scheduling log reopen");
                        reopen_log.request();
                    }
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.begin();
            }
            let _ = reopen_log;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_table_respawns_unexpected_exits() {
        let mut table = WorkerTable::new();
        let a = table.add(WorkerKind::Scan);
        let b = table.add(WorkerKind::Scan);
        let c = table.add(WorkerKind::Controller);
        assert_eq!(table.len(), 3);
        assert_eq!(table.count(WorkerKind::Scan), 2);

        // Unexpected exit: respawn with the same kind.
        assert_eq!(table.note_exit(a, false), Some(WorkerKind::Scan));
        assert_eq!(table.note_exit(c, false), Some(WorkerKind::Controller));
        // During shutdown: expected, no respawn.
        assert_eq!(table.note_exit(b, true), None);
        assert!(table.is_empty());
        // Unknown id is a no-op.
        assert_eq!(table.note_exit(999, false), None);
    }
}
