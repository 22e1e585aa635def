use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{Notify, watch};

/// Observable state of the service under test on one slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
    /// Sticky: a failed start or stop is never retried.
    Failed,
}

/// One-shot cancellation flag handed to an in-progress start.
#[derive(Debug, Default)]
pub struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
struct Guarded {
    state: ServiceState,
    start_cancel: Option<Arc<CancelSignal>>,
}

enum Decision<T> {
    Proceed(T),
    Refuse,
    Wait,
}

/// Serializes start/stop of the service under test.
///
/// All transitions go through one `watch` channel: `send_if_modified` is the critical section and
/// waiters block on `wait_for` until the transient state they are waiting out has passed. A stop
/// requested while a start is in progress waits for the start to finish; with `interrupt` the
/// start's [`CancelSignal`] is raised first.
#[derive(Debug)]
pub struct ServiceLifecycle {
    tx: watch::Sender<Guarded>,
}

impl Default for ServiceLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceLifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Guarded {
            state: ServiceState::Stopped,
            start_cancel: None,
        });
        Self { tx }
    }

    pub fn state(&self) -> ServiceState {
        self.tx.borrow().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Started
    }

    /// Moves STOPPED -> STARTING. Waits out a concurrent stop; returns `false` when the service
    /// is already starting or running, or has failed.
    pub async fn begin_start(&self) -> bool {
        self.try_begin_start().await.is_some()
    }

    /// Moves STARTED -> STOPPING. Waits out a concurrent start (cancelling it when `interrupt`
    /// is set); returns `false` when there is nothing to stop.
    pub async fn begin_stop(&self, interrupt: bool) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            let mut decision = Decision::Wait;
            self.tx.send_if_modified(|g| {
                if interrupt && let Some(cancel) = &g.start_cancel {
                    tracing::info!("interrupting service start");
                    cancel.cancel();
                }
                match g.state {
                    ServiceState::Started => {
                        g.state = ServiceState::Stopping;
                        decision = Decision::Proceed(());
                        true
                    }
                    ServiceState::Starting => false,
                    ServiceState::Failed => {
                        tracing::info!("service failed earlier, nothing to stop");
                        decision = Decision::Refuse;
                        false
                    }
                    ServiceState::Stopping => {
                        tracing::warn!("service is already stopping");
                        decision = Decision::Refuse;
                        false
                    }
                    ServiceState::Stopped => {
                        tracing::warn!("service is already stopped");
                        decision = Decision::Refuse;
                        false
                    }
                }
            });

            match decision {
                Decision::Proceed(()) => return true,
                Decision::Refuse => return false,
                Decision::Wait => {
                    tracing::info!("waiting for service start to finish before stopping");
                    if rx
                        .wait_for(|g| g.state != ServiceState::Starting)
                        .await
                        .is_err()
                    {
                        return false;
                    }
                }
            }
        }
    }

    /// Runs `body` as the service start. Returns `Ok(false)` when the start was refused; an
    /// error from `body` (or dropping the future mid-start) leaves the service FAILED.
    pub async fn start<F, Fut, E>(&self, body: F) -> Result<bool, E>
    where
        F: FnOnce(Arc<CancelSignal>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let Some(cancel) = self.try_begin_start().await else {
            return Ok(false);
        };

        let guard = FailOnDrop::new(self);
        let outcome = body(cancel).await;
        guard.disarm();

        match outcome {
            Ok(()) => {
                self.finish(ServiceState::Started);
                Ok(true)
            }
            Err(err) => {
                self.finish(ServiceState::Failed);
                Err(err)
            }
        }
    }

    /// Runs `body` as the service stop; same contract as [`start`](Self::start).
    pub async fn stop<F, Fut, E>(&self, interrupt: bool, body: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if !self.begin_stop(interrupt).await {
            return Ok(false);
        }

        let guard = FailOnDrop::new(self);
        let outcome = body().await;
        guard.disarm();

        match outcome {
            Ok(()) => {
                self.finish(ServiceState::Stopped);
                Ok(true)
            }
            Err(err) => {
                self.finish(ServiceState::Failed);
                Err(err)
            }
        }
    }

    async fn try_begin_start(&self) -> Option<Arc<CancelSignal>> {
        let mut rx = self.tx.subscribe();
        loop {
            let mut decision = Decision::Wait;
            self.tx.send_if_modified(|g| match g.state {
                ServiceState::Stopped => {
                    let cancel = Arc::new(CancelSignal::new());
                    g.state = ServiceState::Starting;
                    g.start_cancel = Some(cancel.clone());
                    decision = Decision::Proceed(cancel);
                    true
                }
                ServiceState::Stopping => false,
                ServiceState::Failed => {
                    tracing::warn!("service failed earlier and will not be started again");
                    decision = Decision::Refuse;
                    false
                }
                ServiceState::Starting => {
                    tracing::info!("service is already starting");
                    decision = Decision::Refuse;
                    false
                }
                ServiceState::Started => {
                    tracing::info!("service is already running");
                    decision = Decision::Refuse;
                    false
                }
            });

            match decision {
                Decision::Proceed(cancel) => return Some(cancel),
                Decision::Refuse => return None,
                Decision::Wait => {
                    tracing::info!("waiting for service stop to finish before starting");
                    rx.wait_for(|g| g.state != ServiceState::Stopping)
                        .await
                        .ok()?;
                }
            }
        }
    }

    fn finish(&self, state: ServiceState) {
        self.tx.send_modify(|g| {
            g.state = state;
            g.start_cancel = None;
        });
    }
}

struct FailOnDrop<'a> {
    lifecycle: &'a ServiceLifecycle,
    armed: bool,
}

impl<'a> FailOnDrop<'a> {
    fn new(lifecycle: &'a ServiceLifecycle) -> Self {
        Self {
            lifecycle,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FailOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!("service transition abandoned, marking the service failed");
            self.lifecycle.finish(ServiceState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn ok() -> Result<(), String> {
        Ok(())
    }

    #[tokio::test]
    async fn start_then_stop() {
        let lc = ServiceLifecycle::new();
        assert_eq!(lc.state(), ServiceState::Stopped);

        assert_eq!(lc.start(|_| ok()).await, Ok(true));
        assert_eq!(lc.state(), ServiceState::Started);
        // A second start is refused without touching the state.
        assert_eq!(lc.start(|_| ok()).await, Ok(false));

        assert_eq!(lc.stop(false, ok).await, Ok(true));
        assert_eq!(lc.state(), ServiceState::Stopped);
        assert_eq!(lc.stop(false, ok).await, Ok(false));
    }

    #[tokio::test]
    async fn failure_is_sticky() {
        let lc = ServiceLifecycle::new();
        let res = lc.start(|_| async { Err::<(), _>("boom".to_string()) }).await;
        assert_eq!(res, Err("boom".to_string()));
        assert_eq!(lc.state(), ServiceState::Failed);

        assert!(!lc.begin_start().await);
        assert!(!lc.begin_stop(true).await);
        assert_eq!(lc.state(), ServiceState::Failed);
    }

    #[tokio::test]
    async fn interrupting_stop_cancels_start_and_waits_for_it() {
        let lc = Arc::new(ServiceLifecycle::new());

        let starter = {
            let lc = lc.clone();
            tokio::spawn(async move {
                lc.start(|cancel| async move {
                    cancel.cancelled().await;
                    Ok::<(), String>(())
                })
                .await
            })
        };

        // Let the start reach STARTING.
        tokio::time::timeout(Duration::from_secs(5), async {
            while lc.state() != ServiceState::Starting {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("start never began"));

        let stopped = tokio::time::timeout(Duration::from_secs(5), lc.stop(true, ok))
            .await
            .unwrap_or_else(|_| panic!("stop did not finish"));
        assert_eq!(stopped, Ok(true));
        assert_eq!(lc.state(), ServiceState::Stopped);

        let started = starter.await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(started, Ok(true));
    }

    #[tokio::test]
    async fn start_waits_for_stop_in_progress() {
        let lc = Arc::new(ServiceLifecycle::new());
        assert_eq!(lc.start(|_| ok()).await, Ok(true));
        assert!(lc.begin_stop(false).await);
        assert_eq!(lc.state(), ServiceState::Stopping);

        let starter = {
            let lc = lc.clone();
            tokio::spawn(async move { lc.begin_start().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(lc.state(), ServiceState::Stopping);

        lc.finish(ServiceState::Stopped);
        let began = starter.await.unwrap_or_else(|e| panic!("{e}"));
        assert!(began);
        assert_eq!(lc.state(), ServiceState::Starting);
    }

    #[tokio::test]
    async fn dropped_start_marks_failed() {
        let lc = ServiceLifecycle::new();
        let res = tokio::time::timeout(
            Duration::from_millis(20),
            lc.start(|_| std::future::pending::<Result<(), String>>()),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(lc.state(), ServiceState::Failed);
    }

    #[tokio::test]
    async fn cancel_signal_wakes_waiters() {
        let signal = Arc::new(CancelSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        signal.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap_or_else(|_| panic!("waiter not woken"))
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(signal.is_cancelled());
    }
}
