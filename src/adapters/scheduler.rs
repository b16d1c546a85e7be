//! Repeating tasks.
//!
//! Each schedule is owned by its [`ScheduleHandle`]: cancelling or dropping
//! the handle stops the schedule, and a firing that observes the
//! cancellation does not run. Callers that want a schedule to outlive the
//! current scope call [`ScheduleHandle::detach`].
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    runtime::Handle,
    time::{MissedTickBehavior, interval_at, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the runtime the caller is running in, if any.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Run `task` every `period` after `initial_delay`, measured from the
    /// start of each firing. Firings missed while a run overran are skipped.
    pub fn fixed_rate<F>(
        &self,
        name: &str,
        initial_delay: Duration,
        period: Duration,
        mut task: F,
    ) -> ScheduleHandle
    where
        F: FnMut() + Send + 'static,
    {
        let schedule = ScheduleHandle::new(name);
        let token = schedule.token.clone();
        let runs = schedule.runs.clone();
        let period = period.max(Duration::from_millis(1));
        let span = tracing::debug_span!("schedule", schedule = name, kind = "fixed_rate");

        self.handle.spawn(
            async move {
                let mut ticks = interval_at(tokio::time::Instant::now() + initial_delay, period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = ticks.tick() => {}
                    }
                    if token.is_cancelled() {
                        break;
                    }
                    task();
                    runs.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!("schedule stopped");
            }
            .instrument(span),
        );
        schedule
    }

    /// Run `task` after `initial_delay`, then again `delay` after each run
    /// finishes.
    pub fn fixed_delay<F>(
        &self,
        name: &str,
        initial_delay: Duration,
        delay: Duration,
        mut task: F,
    ) -> ScheduleHandle
    where
        F: FnMut() + Send + 'static,
    {
        let schedule = ScheduleHandle::new(name);
        let token = schedule.token.clone();
        let runs = schedule.runs.clone();
        let span = tracing::debug_span!("schedule", schedule = name, kind = "fixed_delay");

        self.handle.spawn(
            async move {
                let mut wait = initial_delay;
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = sleep(wait) => {}
                    }
                    if token.is_cancelled() {
                        break;
                    }
                    task();
                    runs.fetch_add(1, Ordering::Relaxed);
                    wait = delay;
                }
                tracing::debug!("schedule stopped");
            }
            .instrument(span),
        );
        schedule
    }
}

/// Liveness token for one schedule.
#[derive(Debug)]
pub struct ScheduleHandle {
    name: String,
    token: CancellationToken,
    runs: Arc<AtomicU64>,
    detached: bool,
}

impl ScheduleHandle {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            token: CancellationToken::new(),
            runs: Arc::new(AtomicU64::new(0)),
            detached: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completed runs so far.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("Cancelling schedule '{}'", self.name);
            self.token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Keep the schedule running after this handle is dropped. The returned
    /// token still cancels it.
    pub fn detach(mut self) -> CancellationToken {
        self.detached = true;
        self.token.clone()
    }
}

impl Drop for ScheduleHandle {
    fn drop(&mut self) {
        if !self.detached {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_rate_fires_until_cancelled() {
        let scheduler = Scheduler::try_current().unwrap();
        let (count, task) = counter();
        let handle = scheduler.fixed_rate(
            "tick",
            Duration::from_millis(10),
            Duration::from_millis(100),
            task,
        );

        sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert_eq!(handle.runs(), 4);

        handle.cancel();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_fixed_delay() {
        let scheduler = Scheduler::try_current().unwrap();
        let (count, task) = counter();
        let handle = scheduler.fixed_delay("delay", Duration::ZERO, Duration::from_millis(50), task);

        sleep(Duration::from_millis(120)).await;
        let seen = count.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        drop(handle);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_schedule_keeps_running() {
        let scheduler = Scheduler::try_current().unwrap();
        let (count, task) = counter();
        let token = scheduler
            .fixed_rate("detached", Duration::ZERO, Duration::from_millis(10), task)
            .detach();

        sleep(Duration::from_millis(55)).await;
        assert!(count.load(Ordering::SeqCst) >= 5);
        token.cancel();
    }
}
