//! Background jobs: auto-logout, the unpaid-appointment sweep, housekeeping and the daily Fiken
//! sync.
//!
//! Every job is registered with `BackgroundTasks`, which owns the global shutdown token and logs
//! panics. Periodic jobs run each tick in its own task behind a `JobGuard`, so a slow run makes the
//! next tick skip instead of piling up. The Fiken guard is shared with the manual sync endpoint.

use crate::{
    core::{
        fiken::{self, FikenApi, SyncOutcome},
        payment, time_tracking,
    },
    entities::SyncType,
    errors::{Error, Result},
    state::AppState,
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const AUTO_LOGOUT_PERIOD: Duration = Duration::from_secs(60);
pub const UNPAID_SWEEP_PERIOD: Duration = Duration::from_secs(300);
pub const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(300);
/// The daily sync wakes at least this often to pick up a changed sync time
const MAX_SCHEDULE_SLEEP: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Runs on a fixed interval
    Periodic,
    /// Runs once a day at a configured local time
    Daily,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Periodic => write!(f, "Periodic"),
            Self::Daily => write!(f, "Daily"),
        }
    }
}

struct RegisteredTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Owns the background tasks and their shutdown token.
pub struct BackgroundTasks {
    tasks: Vec<RegisteredTask>,
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawns `future`, logging a panic or an unexpected exit.
    pub fn spawn<F>(&mut self, name: &'static str, kind: TaskKind, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        let wrapped = async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(()) if token.is_cancelled() => {}
                Ok(()) => {
                    tracing::warn!(task = name, kind = %kind, "Background task completed unexpectedly");
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(task = name, kind = %kind, panic = %message, "Background task panicked");
                }
            }
        };

        let handle = tokio::spawn(wrapped);
        tracing::debug!(task = name, kind = %kind, "Registered background task");
        self.tasks.push(RegisteredTask { name, handle });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancels every task and waits for them to stop.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down {} background tasks", self.tasks.len());
        self.shutdown.cancel();

        for task in self.tasks {
            match task.handle.await {
                Ok(()) => tracing::debug!(task = task.name, "Task stopped"),
                Err(e) if e.is_cancelled() => tracing::debug!(task = task.name, "Task cancelled"),
                Err(e) => tracing::error!(task = task.name, error = ?e, "Task failed"),
            }
        }
        tracing::info!("All background tasks stopped");
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

/// At most one run of a job at a time.
#[derive(Debug, Clone)]
pub struct JobGuard {
    name: &'static str,
    running: Arc<AtomicBool>,
}

/// Releases the guard when dropped.
#[derive(Debug)]
pub struct JobRun {
    running: Arc<AtomicBool>,
}

impl Drop for JobRun {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl JobGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `None` while another run holds the guard.
    pub fn try_start(&self) -> Option<JobRun> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| JobRun {
                running: Arc::clone(&self.running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Runs `job` every `period` until `token` is cancelled, skipping ticks that would overlap.
async fn run_every<F, Fut>(period: Duration, guard: JobGuard, token: CancellationToken, job: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(run) = guard.try_start() else {
            tracing::warn!(job = guard.name(), "Previous run still in progress, skipping tick");
            continue;
        };
        let fut = job();
        tokio::spawn(async move {
            let _run = run;
            fut.await;
        });
    }
}

/// Registers every background job.
pub fn spawn_jobs(tasks: &mut BackgroundTasks, state: &AppState) {
    let token = tasks.shutdown_token();
    let s = state.clone();
    tasks.spawn(
        "auto_logout",
        TaskKind::Periodic,
        run_every(AUTO_LOGOUT_PERIOD, JobGuard::new("auto_logout"), token, move || {
            auto_logout_tick(s.clone())
        }),
    );

    let token = tasks.shutdown_token();
    let s = state.clone();
    tasks.spawn(
        "unpaid_sweep",
        TaskKind::Periodic,
        run_every(UNPAID_SWEEP_PERIOD, JobGuard::new("unpaid_sweep"), token, move || {
            unpaid_sweep_tick(s.clone())
        }),
    );

    let token = tasks.shutdown_token();
    let s = state.clone();
    tasks.spawn(
        "housekeeping",
        TaskKind::Periodic,
        run_every(HOUSEKEEPING_PERIOD, JobGuard::new("housekeeping"), token, move || {
            housekeeping_tick(s.clone())
        }),
    );

    let token = tasks.shutdown_token();
    tasks.spawn("fiken_daily_sync", TaskKind::Daily, fiken_daily_loop(state.clone(), token));

    tracing::info!(count = tasks.len(), "Background jobs registered");
}

async fn auto_logout_tick(state: AppState) {
    let settings = state.settings.current().await;
    let Some(cutoff) = settings.auto_logout_time else {
        return;
    };
    match time_tracking::auto_logout_sweep(
        &state.db,
        Utc::now(),
        cutoff,
        settings.timezone,
        settings.overtime_policy,
    )
    .await
    {
        Ok(0) => {}
        Ok(closed) => tracing::info!(closed, "Auto-logout closed open shifts"),
        Err(error) => tracing::error!(%error, "Auto-logout sweep failed"),
    }
}

async fn unpaid_sweep_tick(state: AppState) {
    let settings = state.settings.current().await;
    match payment::expire_unpaid(&state.db, Utc::now(), settings.unpaid_timeout_minutes).await {
        Ok(report) if report.expired_payments > 0 => tracing::info!(
            expired = report.expired_payments,
            cancelled = report.cancelled_appointments,
            "Expired unpaid online bookings"
        ),
        Ok(_) => {}
        Err(error) => tracing::error!(%error, "Unpaid appointment sweep failed"),
    }
}

async fn housekeeping_tick(state: AppState) {
    let purged = state.sessions.purge_expired(Utc::now());
    state.webhook_limiter.cleanup();
    if purged > 0 {
        tracing::debug!(purged, "Purged expired sessions");
    }
}

async fn fiken_daily_loop(state: AppState, token: CancellationToken) {
    let mut last_run: Option<NaiveDate> = None;
    loop {
        let settings = state.settings.current().await;
        let wait = duration_until_next(settings.fiken.sync_time, settings.timezone, Utc::now());
        let due = wait <= MAX_SCHEDULE_SLEEP;
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(wait.min(MAX_SCHEDULE_SLEEP)) => {}
        }
        if !due {
            continue;
        }

        let date = Utc::now().with_timezone(&settings.timezone).date_naive();
        if last_run == Some(date) {
            continue;
        }
        last_run = Some(date);
        match run_fiken_sync(&state, date, SyncType::Automatic).await {
            Ok(SyncOutcome::Skipped) => {}
            Ok(SyncOutcome::Completed { log }) => {
                tracing::info!(%date, sales = log.sales_count, "Scheduled Fiken sync completed");
            }
            Ok(SyncOutcome::Failed { log }) => {
                tracing::error!(%date, error = ?log.error_message, "Scheduled Fiken sync failed");
            }
            Err(Error::Conflict { .. }) => {
                tracing::warn!(%date, "Fiken sync already running, skipping scheduled run");
            }
            Err(error) => tracing::error!(%date, %error, "Scheduled Fiken sync errored"),
        }
    }
}

/// Runs the Fiken sync for `date` unless one is already in flight (`Conflict`).
pub async fn run_fiken_sync(state: &AppState, date: NaiveDate, sync_type: SyncType) -> Result<SyncOutcome> {
    let Some(_run) = state.fiken_sync.try_start() else {
        return Err(Error::conflict("A Fiken sync is already running"));
    };
    let settings = state.settings.current().await;
    let client = state.fiken_client(&settings);
    fiken::run_daily_sync(
        &state.db,
        client.as_ref().map(|c| c as &dyn FikenApi),
        &settings.fiken.payment_account,
        settings.timezone,
        date,
        sync_type,
    )
    .await
}

/// Time from `now` until the next `at` on the wall clock of `tz`.
pub fn duration_until_next(at: NaiveTime, tz: Tz, now: DateTime<Utc>) -> Duration {
    let local_now = now.with_timezone(&tz);
    let today = local_now.date_naive();
    let target_date = if local_now.time() >= at {
        today + ChronoDuration::days(1)
    } else {
        today
    };

    // Nonexistent local times (spring-forward gap) resolve an hour later
    let target = target_date
        .and_time(at)
        .and_local_timezone(tz)
        .earliest()
        .or_else(|| {
            (target_date.and_time(at) + ChronoDuration::hours(1))
                .and_local_timezone(tz)
                .earliest()
        });

    target
        .and_then(|t| t.signed_duration_since(local_now).to_std().ok())
        .filter(|d| !d.is_zero())
        .unwrap_or(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Oslo;

    fn hhmm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_duration_until_later_today() {
        // 2030-01-07 20:00 Oslo is 19:00 UTC
        let now = Utc.with_ymd_and_hms(2030, 1, 7, 19, 0, 0).unwrap();
        let wait = duration_until_next(hhmm(23, 30), Oslo, now);
        assert_eq!(wait, Duration::from_secs(3 * 3600 + 30 * 60));
    }

    #[test]
    fn test_duration_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2030, 1, 7, 22, 30, 0).unwrap(); // 23:30 Oslo
        let wait = duration_until_next(hhmm(23, 30), Oslo, now);
        assert_eq!(wait, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_duration_across_spring_forward_gap() {
        // 2030-03-31 02:30 does not exist in Oslo
        let now = Utc.with_ymd_and_hms(2030, 3, 30, 23, 0, 0).unwrap(); // 00:00 Oslo
        let wait = duration_until_next(hhmm(2, 30), Oslo, now);
        assert!(wait > Duration::from_secs(3600));
        assert!(wait <= Duration::from_secs(3 * 3600));
    }

    #[test]
    fn test_job_guard_blocks_overlap() {
        let guard = JobGuard::new("test");
        let run = guard.try_start();
        assert!(run.is_some());
        assert!(guard.is_running());
        assert!(guard.clone().try_start().is_none());
        drop(run);
        assert!(!guard.is_running());
        assert!(guard.try_start().is_some());
    }

    #[tokio::test]
    async fn test_background_tasks_shutdown() {
        let mut tasks = BackgroundTasks::new();
        let token = tasks.shutdown_token();
        tasks.spawn("waiter", TaskKind::Periodic, async move { token.cancelled().await });
        assert_eq!(tasks.len(), 1);
        tokio::time::timeout(Duration::from_secs(1), tasks.shutdown())
            .await
            .unwrap();
    }
}
