//! Fixed-interval detection scheduler
//!
//! One tick per interval. A tick starts a cycle only when the runner is ready
//! and no earlier cycle is still in flight; otherwise it is dropped, never
//! queued, so cycles cannot pipeline or reorder.

use crate::error::VisionError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for an in-flight cycle before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Scheduler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Stopped, or model/stream not ready; ticks are no-ops
    Idle,
    /// Ready; the next tick starts a cycle
    Armed,
    /// A cycle is in flight
    Running,
}

/// Handed to each cycle so it can notice teardown.
#[derive(Debug, Clone)]
pub struct CycleToken {
    sequence: u64,
    cancel: watch::Receiver<bool>,
}

impl CycleToken {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// The work done on each active tick.
#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    /// Model loaded and stream ready
    fn is_ready(&self) -> bool;

    async fn run_cycle(&self, token: &CycleToken) -> Result<(), VisionError>;
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    idle_ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    cycles_started: AtomicU64,
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
}

/// Snapshot of scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    /// Ticks dropped because the runner was not ready
    pub idle_ticks: u64,
    /// Ticks dropped because a cycle was still in flight
    pub skipped_ticks: u64,
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
}

/// Resets the in-flight flag however the cycle task ends.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State shared between the scheduler handle and its tick loop.
struct Shared {
    runner: Arc<dyn CycleRunner>,
    in_flight: Arc<AtomicBool>,
    counters: Arc<Counters>,
    cycle_task: Mutex<Option<JoinHandle<()>>>,
}

/// Drives a [`CycleRunner`] at a fixed interval.
pub struct Scheduler {
    interval: Duration,
    shared: Arc<Shared>,
    stopped: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start ticking. Must be called inside a tokio runtime.
    pub fn start(interval: Duration, runner: Arc<dyn CycleRunner>) -> Result<Self, VisionError> {
        if interval.is_zero() {
            return Err(VisionError::Config("Scheduler interval must be > 0".to_string()));
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            runner,
            in_flight: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            cycle_task: Mutex::new(None),
        });

        let handle = tokio::spawn(run_loop(shared.clone(), interval, cancel_rx));
        info!("Scheduler started ({:?} interval)", interval);
        Ok(Self {
            interval,
            shared,
            stopped: AtomicBool::new(false),
            cancel_tx,
            tick_task: Mutex::new(Some(handle)),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SchedulerState {
        if self.stopped.load(Ordering::Acquire) {
            SchedulerState::Idle
        } else if self.shared.in_flight.load(Ordering::Acquire) {
            SchedulerState::Running
        } else if self.shared.runner.is_ready() {
            SchedulerState::Armed
        } else {
            SchedulerState::Idle
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            ticks: c.ticks.load(Ordering::Acquire),
            idle_ticks: c.idle_ticks.load(Ordering::Acquire),
            skipped_ticks: c.skipped_ticks.load(Ordering::Acquire),
            cycles_started: c.cycles_started.load(Ordering::Acquire),
            cycles_completed: c.cycles_completed.load(Ordering::Acquire),
            cycles_failed: c.cycles_failed.load(Ordering::Acquire),
        }
    }

    /// Stop ticking and wind down any in-flight cycle. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.cancel_tx.send(true);

        let tick_task = self.tick_task.lock().take();
        if let Some(handle) = tick_task {
            let _ = handle.await;
        }

        let cycle_task = self.shared.cycle_task.lock().take();
        if let Some(mut handle) = cycle_task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("In-flight cycle did not finish within {:?}; aborting", SHUTDOWN_GRACE);
                handle.abort();
            }
        }
        info!("Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
        if let Some(handle) = self.tick_task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_loop(shared: Arc<Shared>, interval: Duration, mut cancel_rx: watch::Receiver<bool>) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            _ = timer.tick() => on_tick(&shared, &cancel_rx),
        }
    }
    debug!("Scheduler tick loop exited");
}

fn on_tick(shared: &Shared, cancel_rx: &watch::Receiver<bool>) {
    let c = &shared.counters;
    c.ticks.fetch_add(1, Ordering::AcqRel);

    if *cancel_rx.borrow() || !shared.runner.is_ready() {
        c.idle_ticks.fetch_add(1, Ordering::AcqRel);
        return;
    }
    if shared.in_flight.swap(true, Ordering::AcqRel) {
        c.skipped_ticks.fetch_add(1, Ordering::AcqRel);
        debug!("Tick skipped: cycle still in flight");
        return;
    }

    let guard = InFlightGuard(shared.in_flight.clone());
    let sequence = c.cycles_started.fetch_add(1, Ordering::AcqRel) + 1;
    let token = CycleToken {
        sequence,
        cancel: cancel_rx.clone(),
    };
    let runner = shared.runner.clone();
    let counters = shared.counters.clone();

    let handle = tokio::spawn(async move {
        let _guard = guard;
        match runner.run_cycle(&token).await {
            Ok(()) => {
                counters.cycles_completed.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) if e.is_cycle_local() => {
                counters.cycles_failed.fetch_add(1, Ordering::AcqRel);
                warn!("Cycle {} failed: {}", token.sequence(), e);
            }
            Err(e) => {
                counters.cycles_failed.fetch_add(1, Ordering::AcqRel);
                error!("Cycle {} failed: {}", token.sequence(), e);
            }
        }
    });
    *shared.cycle_task.lock() = Some(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct TestRunner {
        ready: AtomicBool,
        delay: Duration,
        fail: bool,
        running: AtomicUsize,
        max_running: AtomicUsize,
        cancelled_seen: AtomicUsize,
    }

    impl TestRunner {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                ready: AtomicBool::new(true),
                delay,
                fail: false,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                cancelled_seen: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CycleRunner for TestRunner {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::Acquire)
        }

        async fn run_cycle(&self, token: &CycleToken) -> Result<(), VisionError> {
            let now = self.running.fetch_add(1, Ordering::AcqRel) + 1;
            self.max_running.fetch_max(now, Ordering::AcqRel);
            tokio::time::sleep(self.delay).await;
            if token.is_cancelled() {
                self.cancelled_seen.fetch_add(1, Ordering::AcqRel);
            }
            self.running.fetch_sub(1, Ordering::AcqRel);
            if self.fail {
                Err(VisionError::Inference("scripted failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_cycles_run_every_tick() {
        let runner = TestRunner::new(Duration::from_millis(10));
        let scheduler = Scheduler::start(Duration::from_millis(100), runner.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(1050)).await;
        scheduler.shutdown().await;

        let stats = scheduler.stats();
        assert_eq!(stats.skipped_ticks, 0);
        assert_eq!(stats.cycles_completed, stats.cycles_started);
        assert!(stats.cycles_started >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycle_drops_ticks() {
        let runner = TestRunner::new(Duration::from_millis(350));
        let scheduler = Scheduler::start(Duration::from_millis(100), runner.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(2000)).await;
        scheduler.shutdown().await;

        let stats = scheduler.stats();
        assert_eq!(runner.max_running.load(Ordering::Acquire), 1);
        assert!(stats.skipped_ticks > 0);
        assert!(stats.cycles_started < stats.ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_keeps_idle() {
        let runner = TestRunner::new(Duration::ZERO);
        runner.ready.store(false, Ordering::Release);
        let scheduler = Scheduler::start(Duration::from_millis(100), runner.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let stats = scheduler.stats();
        assert_eq!(stats.cycles_started, 0);
        assert_eq!(stats.idle_ticks, stats.ticks);

        runner.ready.store(true, Ordering::Release);
        assert_eq!(scheduler.state(), SchedulerState::Armed);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(scheduler.stats().cycles_started > 0);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_loop() {
        let runner = Arc::new(TestRunner {
            ready: AtomicBool::new(true),
            delay: Duration::ZERO,
            fail: true,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            cancelled_seen: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::start(Duration::from_millis(100), runner).unwrap();
        tokio::time::sleep(Duration::from_millis(550)).await;
        scheduler.shutdown().await;
        let stats = scheduler.stats();
        assert!(stats.cycles_failed >= 5);
        assert_eq!(stats.cycles_completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent_and_final() {
        let runner = TestRunner::new(Duration::from_millis(10));
        let scheduler = Scheduler::start(Duration::from_millis(100), runner).unwrap();
        scheduler.shutdown().await;
        scheduler.shutdown().await;
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let before = scheduler.stats().ticks;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(scheduler.stats().ticks, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signals_in_flight_cycle() {
        let runner = TestRunner::new(Duration::from_millis(300));
        let scheduler = Scheduler::start(Duration::from_millis(100), runner.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.state(), SchedulerState::Running);
        scheduler.shutdown().await;
        assert_eq!(runner.cancelled_seen.load(Ordering::Acquire), 1);
        assert_eq!(runner.running.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let runner = TestRunner::new(Duration::ZERO);
        assert!(Scheduler::start(Duration::ZERO, runner).is_err());
    }
}
