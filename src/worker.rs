//! Worker event loops: accept connections, spawn per-connection sessions,
//! drain gracefully on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::controller::{run_controller_session, ControllerEnv};
use crate::task::{run_task, TaskEnv};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Scan,
    Controller,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Scan => write!(f, "scan"),
            WorkerKind::Controller => write!(f, "controller"),
        }
    }
}

/// Process-wide soft-shutdown switch. Cloned into every worker; flipping it
/// stops accepts everywhere and starts the drain clock.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Shutdown {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn begin(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_active(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Scanning worker: accept loop feeding per-connection tasks.
pub async fn run_scan_worker(
    id: u64,
    listener: Arc<TcpListener>,
    env: Arc<TaskEnv>,
    shutdown: Shutdown,
) {
    log::info!("scan worker {id} listening");
    let mut connections: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("scan worker {id}: connection from {peer}");
                        let env = env.clone();
                        connections.spawn(async move {
                            let summary = run_task(stream, &env).await;
                            log::debug!(
                                "task from {peer} finished in {:?} ({} suspends)",
                                summary.elapsed,
                                summary.filters_suspended
                            );
                        });
                    }
                    Err(e) => {
                        log::warn!("scan worker {id}: accept failed: {e}");
                    }
                }
            }
            _ = shutdown.wait() => break,
        }
    }
    drain(&mut connections, env.config.soft_shutdown_secs, "scan", id).await;
}

/// Controller worker: same accept loop shape over control sessions.
pub async fn run_controller_worker(
    id: u64,
    listener: Arc<TcpListener>,
    env: Arc<ControllerEnv>,
    shutdown: Shutdown,
) {
    log::info!("controller worker {id} listening");
    let mut connections: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("controller worker {id}: connection from {peer}");
                        let env = env.clone();
                        connections.spawn(async move {
                            let summary = run_controller_session(stream, env).await;
                            log::debug!(
                                "control session from {peer}: {} commands",
                                summary.commands
                            );
                        });
                    }
                    Err(e) => {
                        log::warn!("controller worker {id}: accept failed: {e}");
                    }
                }
            }
            _ = shutdown.wait() => break,
        }
    }
    drain(&mut connections, env.config.soft_shutdown_secs, "controller", id).await;
}

/// Soft close: in-flight connections get the grace period, then whatever is
/// left is dropped hard.
async fn drain(connections: &mut JoinSet<()>, grace_secs: u64, kind: &str, id: u64) {
    if connections.is_empty() {
        return;
    }
    log::info!(
        "{kind} worker {id}: draining {} connections for up to {grace_secs}s",
        connections.len()
    );
    let deadline = tokio::time::Instant::now() + Duration::from_secs(grace_secs);
    loop {
        let joined = tokio::time::timeout_at(deadline, connections.join_next()).await;
        match joined {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => {
                log::warn!(
                    "{kind} worker {id}: {} connections past grace period, closing hard",
                    connections.len()
                );
                connections.abort_all();
                break;
            }
        }
    }
}
