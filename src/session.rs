//! Fan-out/join coordinator for one task's asynchronous sub-operations.
//!
//! Filters that need a round trip (DNS, async statfile work) register with
//! the session before dispatching and report back when done. The finalize
//! callback runs exactly once: when the outstanding count drains to zero
//! after dispatch is complete, or immediately on forced finalization from
//! the watchdog. Late completions after a forced finalize are no-ops; a
//! `finish()` after normal finalization is a programming error and is
//! reported, not swallowed.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

type FinalizeFn = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Accepting watch/finish traffic.
    Active,
    /// Finalize ran because the queue drained.
    Finalized,
    /// Finalize ran via force_finalize; stray finish() calls are ignored.
    Cancelled,
}

struct Inner {
    outstanding: usize,
    /// Set once the owner has dispatched every filter; before that, a
    /// drained counter must not finalize (work may still be registered).
    dispatch_done: bool,
    state: SessionState,
    finalize: Option<FinalizeFn>,
}

pub struct AsyncSession {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl AsyncSession {
    pub fn begin(finalize: FinalizeFn) -> Arc<Self> {
        Arc::new(AsyncSession {
            inner: Mutex::new(Inner {
                outstanding: 0,
                dispatch_done: false,
                state: SessionState::Active,
                finalize: Some(finalize),
            }),
            notify: Notify::new(),
        })
    }

    /// Register one pending sub-operation. Call immediately before
    /// dispatching it.
    pub fn watch(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            debug_assert!(false, "watch() on a completed session");
            log::error!("watch() called on a completed async session");
            return;
        }
        inner.outstanding += 1;
    }

    /// Report one sub-operation complete. Finalizes when the last one
    /// finishes and dispatch is over.
    pub fn finish(&self) {
        let fin = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Cancelled => return,
                SessionState::Finalized => {
                    debug_assert!(false, "finish() after finalize");
                    log::error!("finish() called after async session finalized");
                    return;
                }
                SessionState::Active => {}
            }
            if inner.outstanding == 0 {
                debug_assert!(false, "finish() without matching watch()");
                log::error!("finish() without matching watch()");
                return;
            }
            inner.outstanding -= 1;
            if inner.outstanding == 0 && inner.dispatch_done {
                inner.state = SessionState::Finalized;
                inner.finalize.take()
            } else {
                None
            }
        };
        if let Some(f) = fin {
            f();
            self.notify.notify_waiters();
        }
    }

    /// Mark the dispatch phase over. If nothing is outstanding the session
    /// finalizes right here; otherwise the last `finish()` does it.
    pub fn dispatch_done(&self) {
        let fin = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Active {
                return;
            }
            inner.dispatch_done = true;
            if inner.outstanding == 0 {
                inner.state = SessionState::Finalized;
                inner.finalize.take()
            } else {
                None
            }
        };
        if let Some(f) = fin {
            f();
            self.notify.notify_waiters();
        }
    }

    /// Watchdog/cancellation path: finalize now, regardless of outstanding
    /// work. Late `finish()` calls become no-ops.
    pub fn force_finalize(&self) {
        let fin = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Active {
                return;
            }
            inner.state = SessionState::Cancelled;
            inner.finalize.take()
        };
        if let Some(f) = fin {
            f();
            self.notify.notify_waiters();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().state != SessionState::Active
    }

    pub fn was_cancelled(&self) -> bool {
        self.inner.lock().state == SessionState::Cancelled
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    /// Await finalization (normal or forced).
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking, so a finalize landing in between
            // still wakes us.
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_session() -> (Arc<AsyncSession>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let s = AsyncSession::begin(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        (s, fired)
    }

    #[test]
    fn finalizes_once_when_drained() {
        let (s, fired) = counting_session();
        s.watch();
        s.watch();
        s.dispatch_done();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        s.finish();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        s.finish();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_watchers_finalizes_at_dispatch_done() {
        let (s, fired) = counting_session();
        s.dispatch_done();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_before_dispatch_done_does_not_finalize_early() {
        // A sub-operation finishing while later filters are still being
        // dispatched must not trigger the reply.
        let (s, fired) = counting_session();
        s.watch();
        s.finish();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        s.watch();
        s.dispatch_done();
        s.finish();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn force_finalize_then_late_finish_is_single_fire() {
        let (s, fired) = counting_session();
        s.watch();
        s.watch();
        s.dispatch_done();
        s.force_finalize();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Late completions arrive after cancellation.
        s.finish();
        s.finish();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(s.was_cancelled());
    }

    #[test]
    fn double_force_finalize_is_single_fire() {
        let (s, fired) = counting_session();
        s.watch();
        s.force_finalize();
        s.force_finalize();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_returns_after_finalize() {
        let (s, fired) = counting_session();
        s.watch();
        s.dispatch_done();
        let s2 = s.clone();
        let waiter = tokio::spawn(async move { s2.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        s.finish();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait() hung")
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_returns_when_already_complete() {
        let (s, _) = counting_session();
        s.dispatch_done();
        tokio::time::timeout(Duration::from_millis(100), s.wait())
            .await
            .expect("wait() hung on completed session");
    }
}
