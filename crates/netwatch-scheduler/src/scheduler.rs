//! Periodic scheduler — fixed-delay ticks, coalesced extra runs, and
//! runtime reconfiguration.
//!
//! The scheduler separates *when* the action fires (an [`ExecutionBackend`])
//! from *where* it runs (optionally a caller-supplied executor `Handle`).
//! Every firing goes through the same run gate, so the action never runs
//! concurrently with itself. In recurring mode a firing that arrives less
//! than one period after the previous run started is skipped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::backend::{BoxFuture, ExecutionBackend, Job, TaskHandle, TokioBackend};
use crate::error::SchedulerResult;
use crate::time_unit::TimeUnit;

/// Upper bound on pending `delay()` requests. Requests beyond it are dropped.
pub const MAX_PENDING_DELAYS: usize = 10;

/// The action a scheduler invokes on each tick.
pub type Action = Job;

/// Mutable scheduler configuration and lifecycle state.
struct SchedulerState {
    period: i64,
    time_unit: TimeUnit,
    backend: Option<Arc<dyn ExecutionBackend>>,
    /// The backend was provisioned by `start()` and is torn down by `stop()`.
    owns_backend: bool,
    /// Recurring trigger. Its presence is the started flag.
    handle: Option<TaskHandle>,
}

/// Shared by every firing of one scheduler.
struct Runner {
    name: String,
    action: Action,
    on_demand: bool,
    /// Pending `delay()` runs.
    delayed: AtomicUsize,
    /// Current period in nanoseconds, used by the overlap guard.
    min_interval_nanos: AtomicU64,
    /// Start time of the previous run. Held for the duration of a run.
    last_run: tokio::sync::Mutex<Option<Instant>>,
}

impl Runner {
    async fn fire(self: Arc<Self>, executor: Option<Handle>) {
        match executor {
            Some(executor) => {
                executor.spawn(async move { self.execute().await });
            }
            None => self.execute().await,
        }
    }

    async fn execute(&self) {
        let mut last_run = self.last_run.lock().await;

        if !self.on_demand {
            if let Some(previous) = *last_run {
                let min_interval =
                    Duration::from_nanos(self.min_interval_nanos.load(Ordering::Relaxed));
                if previous.elapsed() < min_interval {
                    trace!(
                        scheduler = %self.name,
                        "execution skipped, previous run started less than a period ago"
                    );
                    return;
                }
            }
        }

        *last_run = Some(Instant::now());
        (self.action)().await;
    }
}

/// Invokes an action periodically, never overlapping with itself.
pub struct PeriodicScheduler {
    name: String,
    on_demand: bool,
    executor: Option<Handle>,
    state: Mutex<SchedulerState>,
    runner: Arc<Runner>,
}

impl PeriodicScheduler {
    /// Create a stopped scheduler.
    ///
    /// With `on_demand` set, `start()` schedules no recurring trigger and the
    /// action only runs through `delay()`.
    pub fn new(
        name: impl Into<String>,
        period: i64,
        time_unit: TimeUnit,
        on_demand: bool,
        action: Action,
    ) -> Self {
        let name = name.into();
        Self {
            runner: Arc::new(Runner {
                name: name.clone(),
                action,
                on_demand,
                delayed: AtomicUsize::new(0),
                min_interval_nanos: AtomicU64::new(0),
                last_run: tokio::sync::Mutex::new(None),
            }),
            name,
            on_demand,
            executor: None,
            state: Mutex::new(SchedulerState {
                period,
                time_unit,
                backend: None,
                owns_backend: false,
                handle: None,
            }),
        }
    }

    /// Use an externally owned backend instead of provisioning one.
    pub fn with_backend(self, backend: Arc<dyn ExecutionBackend>) -> Self {
        {
            let mut state = self.lock_state();
            state.backend = Some(backend);
            state.owns_backend = false;
        }
        self
    }

    /// Run the action on `executor` instead of on the backend's task.
    pub fn with_executor(mut self, executor: Handle) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Begin recurring invocation. No-op when already started.
    pub fn start(&self) -> SchedulerResult<()> {
        let mut state = self.lock_state();
        self.start_locked(&mut state)
    }

    /// Cancel the recurring trigger and release an owned backend.
    ///
    /// A tick that is already executing runs to completion, unless the
    /// backend is owned, in which case its runtime is shut down immediately.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        self.stop_locked(&mut state);
    }

    pub fn is_started(&self) -> bool {
        self.lock_state().handle.is_some()
    }

    pub fn period(&self) -> i64 {
        self.lock_state().period
    }

    pub fn time_unit(&self) -> TimeUnit {
        self.lock_state().time_unit
    }

    /// Change the period. A started scheduler restarts on the new cadence.
    pub fn set_period(&self, period: i64) -> SchedulerResult<()> {
        let mut state = self.lock_state();
        state.period = period;
        self.restart_if_needed(&mut state)
    }

    /// Change the time unit. A started scheduler restarts on the new cadence.
    pub fn set_time_unit(&self, time_unit: TimeUnit) -> SchedulerResult<()> {
        let mut state = self.lock_state();
        state.time_unit = time_unit;
        self.restart_if_needed(&mut state)
    }

    /// Request one extra run outside the normal cadence.
    ///
    /// At most [`MAX_PENDING_DELAYS`] requests are pending at a time; further
    /// requests are dropped and `false` is returned. An accepted request
    /// fires after `min(period, period * pending)`.
    pub fn delay(&self) -> bool {
        let state = self.lock_state();
        let Some(backend) = state.backend.clone() else {
            debug!(scheduler = %self.name, "delay requested without a backend, dropped");
            return false;
        };
        let Some(period) = state.time_unit.duration(state.period) else {
            debug!(scheduler = %self.name, "delay requested with a negative period, dropped");
            return false;
        };

        let pending = self.runner.delayed.fetch_add(1, Ordering::SeqCst) + 1;
        if pending > MAX_PENDING_DELAYS {
            self.runner.delayed.fetch_sub(1, Ordering::SeqCst);
            trace!(scheduler = %self.name, "too many pending delays, request dropped");
            return false;
        }

        let factor = u32::try_from(pending).unwrap_or(u32::MAX);
        let wait = period.min(period.saturating_mul(factor));
        backend.schedule(self.delayed_job(), wait);
        true
    }

    /// Number of accepted `delay()` requests that have not fired yet.
    pub fn pending_delays(&self) -> usize {
        self.runner.delayed.load(Ordering::SeqCst)
    }

    fn start_locked(&self, state: &mut SchedulerState) -> SchedulerResult<()> {
        if state.handle.is_some() {
            return Ok(());
        }

        let backend = match &state.backend {
            Some(backend) => backend.clone(),
            None => {
                let backend: Arc<dyn ExecutionBackend> =
                    Arc::new(TokioBackend::dedicated(&self.name)?);
                state.backend = Some(backend.clone());
                state.owns_backend = true;
                backend
            }
        };

        let period = match state.time_unit.duration(state.period) {
            Some(period) if !period.is_zero() => period,
            _ => {
                trace!(
                    scheduler = %self.name,
                    period = state.period,
                    "not scheduling, period is not positive"
                );
                return Ok(());
            }
        };
        let nanos = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX);
        self.runner.min_interval_nanos.store(nanos, Ordering::Relaxed);

        if self.on_demand {
            return Ok(());
        }

        state.handle = Some(backend.schedule_with_fixed_delay(self.job(), period, period));
        debug!(
            scheduler = %self.name,
            period = state.period,
            unit = ?state.time_unit,
            "scheduler started"
        );
        Ok(())
    }

    fn stop_locked(&self, state: &mut SchedulerState) {
        if let Some(handle) = state.handle.take() {
            handle.cancel();
            debug!(scheduler = %self.name, "scheduler stopped");
        }
        if state.owns_backend {
            if let Some(backend) = state.backend.take() {
                backend.shutdown_now();
            }
            state.owns_backend = false;
            // One-shots registered on the released runtime never fire.
            self.runner.delayed.store(0, Ordering::SeqCst);
        }
    }

    /// Swap the recurring trigger for one on the new cadence. The backend,
    /// owned or not, is kept so an in-flight tick runs to completion.
    fn restart_if_needed(&self, state: &mut SchedulerState) -> SchedulerResult<()> {
        if let Some(handle) = state.handle.take() {
            handle.cancel();
            debug!(scheduler = %self.name, "scheduler restarting");
            self.start_locked(state)?;
        }
        Ok(())
    }

    fn job(&self) -> Job {
        let runner = self.runner.clone();
        let executor = self.executor.clone();
        Arc::new(move || -> BoxFuture<'static, ()> {
            Box::pin(runner.clone().fire(executor.clone()))
        })
    }

    fn delayed_job(&self) -> Job {
        let runner = self.runner.clone();
        let executor = self.executor.clone();
        Arc::new(move || -> BoxFuture<'static, ()> {
            runner.delayed.fetch_sub(1, Ordering::SeqCst);
            Box::pin(runner.clone().fire(executor.clone()))
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = state.handle.take() {
            handle.cancel();
        }
        if state.owns_backend {
            if let Some(backend) = state.backend.take() {
                backend.shutdown_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn counting_action(counter: Arc<AtomicUsize>) -> Action {
        Arc::new(move || -> BoxFuture<'static, ()> {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    fn scheduler_on_current(period_ms: i64, on_demand: bool, counter: Arc<AtomicUsize>) -> PeriodicScheduler {
        PeriodicScheduler::new(
            "test",
            period_ms,
            TimeUnit::Milliseconds,
            on_demand,
            counting_action(counter),
        )
        .with_backend(Arc::new(TokioBackend::current().unwrap()))
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_at_fixed_delay() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_on_current(100, false, counter.clone());

        scheduler.start().unwrap();
        assert!(scheduler.is_started());

        advance(50).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        advance(300).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_on_current(100, false, counter.clone());

        scheduler.start().unwrap();
        scheduler.start().unwrap();
        scheduler.start().unwrap();

        advance(350).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_future_ticks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_on_current(100, false, counter.clone());

        scheduler.start().unwrap();
        advance(150).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        scheduler.stop();
        assert!(!scheduler.is_started());
        advance(1000).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Stopping twice is harmless.
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_start_resumes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_on_current(100, false, counter.clone());

        scheduler.start().unwrap();
        advance(150).await;
        scheduler.stop();
        advance(500).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        scheduler.start().unwrap();
        advance(50).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        advance(100).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn set_period_restarts_on_new_cadence() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_on_current(1000, false, counter.clone());

        scheduler.start().unwrap();
        advance(100).await;

        scheduler.set_period(100).unwrap();
        assert!(scheduler.is_started());
        assert_eq!(scheduler.period(), 100);

        // Next tick is 100ms after the restart, not 1000ms after start.
        advance(150).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_time_unit_restarts_on_new_cadence() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_on_current(1, false, counter.clone());
        scheduler.set_time_unit(TimeUnit::Seconds).unwrap();

        scheduler.start().unwrap();
        advance(500).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        scheduler.set_time_unit(TimeUnit::Milliseconds).unwrap();
        assert_eq!(scheduler.time_unit(), TimeUnit::Milliseconds);
        advance(5).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_period_while_stopped_does_not_start() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_on_current(100, false, counter.clone());

        scheduler.set_period(50).unwrap();
        assert!(!scheduler.is_started());
        advance(500).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_period_schedules_nothing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_on_current(-1, false, counter.clone());

        scheduler.start().unwrap();
        assert!(!scheduler.is_started());
        advance(1000).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_caps_pending_requests() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_on_current(50, true, counter.clone());

        let accepted = (0..11).filter(|_| scheduler.delay()).count();
        assert_eq!(accepted, MAX_PENDING_DELAYS);
        assert_eq!(scheduler.pending_delays(), MAX_PENDING_DELAYS);

        advance(60).await;
        assert_eq!(counter.load(Ordering::SeqCst), MAX_PENDING_DELAYS);
        assert_eq!(scheduler.pending_delays(), 0);

        // Capacity is available again once the backlog drained.
        assert!(scheduler.delay());
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_start_schedules_no_recurring_trigger() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_on_current(50, true, counter.clone());

        scheduler.start().unwrap();
        assert!(!scheduler.is_started());
        advance(500).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_without_backend_is_dropped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = PeriodicScheduler::new(
            "no-backend",
            50,
            TimeUnit::Milliseconds,
            true,
            counting_action(counter),
        );
        assert!(!scheduler.delay());
        assert_eq!(scheduler.pending_delays(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn redundant_trigger_within_a_period_is_skipped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_on_current(100, false, counter.clone());

        scheduler.start().unwrap();
        // Fires at the same instant as the first recurring tick.
        assert!(scheduler.delay());

        advance(150).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_delays(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn action_never_overlaps_itself() {
        let running = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicUsize::new(0));

        let action: Action = {
            let running = running.clone();
            let overlapped = overlapped.clone();
            let completed = completed.clone();
            Arc::new(move || -> BoxFuture<'static, ()> {
                let running = running.clone();
                let overlapped = overlapped.clone();
                let completed = completed.clone();
                Box::pin(async move {
                    if running.swap(true, Ordering::SeqCst) {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.store(false, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                })
            })
        };

        let scheduler = PeriodicScheduler::new("overlap", 50, TimeUnit::Milliseconds, true, action)
            .with_backend(Arc::new(TokioBackend::current().unwrap()))
            .with_executor(Handle::current());

        for _ in 0..5 {
            assert!(scheduler.delay());
        }

        advance(500).await;
        assert_eq!(completed.load(Ordering::SeqCst), 5);
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_does_not_interrupt_in_flight_tick() {
        let completed = Arc::new(AtomicUsize::new(0));
        let action: Action = {
            let completed = completed.clone();
            Arc::new(move || -> BoxFuture<'static, ()> {
                let completed = completed.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                })
            })
        };
        let scheduler = PeriodicScheduler::new("inflight", 50, TimeUnit::Milliseconds, false, action)
            .with_backend(Arc::new(TokioBackend::current().unwrap()));

        scheduler.start().unwrap();
        advance(60).await;
        scheduler.stop();

        advance(500).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn set_period_keeps_in_flight_tick_on_owned_backend() {
        let begun = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let action: Action = {
            let begun = begun.clone();
            let completed = completed.clone();
            Arc::new(move || -> BoxFuture<'static, ()> {
                let begun = begun.clone();
                let completed = completed.clone();
                Box::pin(async move {
                    begun.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                })
            })
        };
        let scheduler = PeriodicScheduler::new("restart", 50, TimeUnit::Milliseconds, false, action);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(begun.load(Ordering::SeqCst), 1);

        scheduler.set_period(5000).unwrap();
        assert!(scheduler.is_started());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(begun.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn owned_backend_is_provisioned_and_released() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = PeriodicScheduler::new(
            "owned",
            20,
            TimeUnit::Milliseconds,
            false,
            counting_action(counter.clone()),
        );

        scheduler.start().unwrap();
        assert!(scheduler.is_started());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(counter.load(Ordering::SeqCst) >= 2);

        scheduler.stop();
        assert!(!scheduler.is_started());
        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(counter.load(Ordering::SeqCst) <= after_stop + 1);

        // A fresh runtime is provisioned on restart.
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(counter.load(Ordering::SeqCst) > after_stop);
        scheduler.stop();
    }
}
