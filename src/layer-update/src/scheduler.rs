//! Periodic checks and coalesced wake signals.
//!
//! Cycles run one at a time on the scheduler task. Wakes that arrive while a
//! cycle runs collapse into a single pending reason, so any burst of signals
//! costs at most one extra cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::UpdateResult;
use crate::orchestrator::{CycleOutcome, UpdateOrchestrator, WakeReason};

/// What the scheduler drives.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, reason: WakeReason) -> CycleOutcome;

    /// Pending retry time recorded before the scheduler started.
    async fn next_attempt_at(&self) -> Option<DateTime<Utc>>;

    /// Must not block.
    fn cancel_transfer(&self);

    async fn shutdown(&self) -> UpdateResult<()>;
}

#[async_trait]
impl CycleRunner for UpdateOrchestrator {
    async fn run_cycle(&self, reason: WakeReason) -> CycleOutcome {
        UpdateOrchestrator::run_cycle(self, reason).await
    }

    async fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        UpdateOrchestrator::next_attempt_at(self).await
    }

    fn cancel_transfer(&self) {
        UpdateOrchestrator::cancel_transfer(self)
    }

    async fn shutdown(&self) -> UpdateResult<()> {
        UpdateOrchestrator::shutdown(self).await
    }
}

#[derive(Default)]
struct WakeState {
    pending: Mutex<Option<WakeReason>>,
    notify: Notify,
}

impl WakeState {
    fn push(&self, reason: WakeReason) {
        {
            let mut pending = self.pending.lock();
            *pending = Some(match *pending {
                Some(current) => current.merge(reason),
                None => reason,
            });
        }
        self.notify.notify_one();
    }

    fn take(&self) -> Option<WakeReason> {
        self.pending.lock().take()
    }
}

/// Cloneable handle for delivering signals to a running [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    wake: Arc<WakeState>,
    runner: Arc<dyn CycleRunner>,
    shutdown: CancellationToken,
}

impl SchedulerHandle {
    /// Request a cycle. Returns immediately.
    pub fn wake(&self, reason: WakeReason) {
        debug!(reason = %reason, "Wake requested");
        self.wake.push(reason);
    }

    /// Connectivity went away: abort the running transfer, keeping flushed
    /// progress.
    pub fn network_lost(&self) {
        info!("Network lost, cancelling transfer");
        self.runner.cancel_transfer();
    }

    /// Stop the scheduler after cancelling the running transfer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.runner.cancel_transfer();
    }
}

/// Runs update cycles on a timer and on request.
pub struct Scheduler {
    runner: Arc<dyn CycleRunner>,
    interval: Duration,
    wake: Arc<WakeState>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn CycleRunner>, interval: Duration) -> Self {
        Self {
            runner,
            interval,
            wake: Arc::new(WakeState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            wake: self.wake.clone(),
            runner: self.runner.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run until [`SchedulerHandle::shutdown`], then flush the state.
    pub async fn run(self) -> UpdateResult<()> {
        let mut next_periodic = Instant::now() + self.interval;
        let mut retry_at = self.runner.next_attempt_at().await;

        info!(interval_secs = self.interval.as_secs(), "Scheduler started");

        while !self.shutdown.is_cancelled() {
            if let Some(reason) = self.wake.take() {
                let outcome = self.runner.run_cycle(reason).await;
                retry_at = outcome.retry_at();
                continue;
            }

            let retry_deadline = retry_at.map(instant_at);
            let deadline = retry_deadline.map_or(next_periodic, |at| at.min(next_periodic));

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if Instant::now() >= next_periodic {
                        next_periodic = Instant::now() + self.interval;
                        self.wake.push(WakeReason::Periodic);
                    } else {
                        retry_at = None;
                        self.wake.push(WakeReason::Retry);
                    }
                }
            }
        }

        info!("Scheduler stopping");
        if let Err(e) = self.runner.shutdown().await {
            error!(error = %e, "Failed to flush update state on shutdown");
            return Err(e);
        }
        Ok(())
    }
}

/// Monotonic instant corresponding to a wall-clock time.
fn instant_at(at: DateTime<Utc>) -> Instant {
    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::state::Phase;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Semaphore, mpsc};

    /// Records wakes; each cycle waits for a permit before finishing.
    struct GatedRunner {
        calls: Mutex<Vec<WakeReason>>,
        started: mpsc::UnboundedSender<WakeReason>,
        gate: Semaphore,
        cancels: AtomicUsize,
        flushes: AtomicUsize,
        retry_in: Option<chrono::Duration>,
    }

    impl GatedRunner {
        fn new(permits: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<WakeReason>) {
            let (started, rx) = mpsc::unbounded_channel();
            let runner = Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                started,
                gate: Semaphore::new(permits),
                cancels: AtomicUsize::new(0),
                flushes: AtomicUsize::new(0),
                retry_in: None,
            });
            (runner, rx)
        }
    }

    #[async_trait]
    impl CycleRunner for GatedRunner {
        async fn run_cycle(&self, reason: WakeReason) -> CycleOutcome {
            let first = {
                let mut calls = self.calls.lock();
                calls.push(reason);
                calls.len() == 1
            };
            let _ = self.started.send(reason);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            match self.retry_in {
                Some(delay) if first => CycleOutcome::RetryScheduled {
                    phase: Phase::Downloading,
                    error: ErrorKind::NetworkError,
                    at: Utc::now() + delay,
                },
                _ => CycleOutcome::Skipped { phase: Phase::Idle },
            }
        }

        async fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
            None
        }

        fn cancel_transfer(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&self) -> UpdateResult<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overlapping_wakes_run_one_extra_cycle() {
        let (runner, mut started) = GatedRunner::new(0);
        let scheduler = Scheduler::new(runner.clone(), Duration::from_secs(3600));
        let handle = scheduler.handle();
        let task = tokio::spawn(scheduler.run());

        handle.wake(WakeReason::Boot);
        assert_eq!(started.recv().await, Some(WakeReason::Boot));

        handle.wake(WakeReason::Periodic);
        handle.wake(WakeReason::NetworkAvailable);
        runner.gate.add_permits(10);

        assert_eq!(started.recv().await, Some(WakeReason::NetworkAvailable));
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.shutdown();
        task.await.unwrap().unwrap();

        assert_eq!(
            *runner.calls.lock(),
            vec![WakeReason::Boot, WakeReason::NetworkAvailable]
        );
        assert_eq!(runner.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_deadline_wakes_scheduler() {
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let runner = Arc::new(GatedRunner {
            calls: Mutex::new(Vec::new()),
            started: started_tx,
            gate: Semaphore::new(10),
            cancels: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            retry_in: Some(chrono::Duration::milliseconds(100)),
        });
        let scheduler = Scheduler::new(runner.clone(), Duration::from_secs(3600));
        let handle = scheduler.handle();
        let task = tokio::spawn(scheduler.run());

        handle.wake(WakeReason::Manual);
        assert_eq!(started.recv().await, Some(WakeReason::Manual));
        let next = tokio::time::timeout(Duration::from_secs(5), started.recv())
            .await
            .unwrap();
        assert_eq!(next, Some(WakeReason::Retry));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_and_network_loss_cancel_transfer() {
        let (runner, _started) = GatedRunner::new(0);
        let scheduler = Scheduler::new(runner.clone(), Duration::from_secs(3600));
        let handle = scheduler.handle();
        let task = tokio::spawn(scheduler.run());

        handle.network_lost();
        handle.shutdown();
        task.await.unwrap().unwrap();

        assert_eq!(runner.cancels.load(Ordering::SeqCst), 2);
        assert_eq!(runner.flushes.load(Ordering::SeqCst), 1);
        assert!(runner.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_wake() {
        let (runner, mut started) = GatedRunner::new(10);
        let scheduler = Scheduler::new(runner.clone(), Duration::from_secs(600));
        let handle = scheduler.handle();
        let task = tokio::spawn(scheduler.run());

        assert_eq!(started.recv().await, Some(WakeReason::Periodic));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }
}
