//! The per-application background thread: session expiry and cron jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, TimeZone};
use kiln_types::Value;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::app::AppContext;
use crate::cron::{self, CronJob};
use crate::engine::FunctionRef;
use crate::evaluator::EvaluatorUnit;
use crate::pool::{EvaluatorPool, PooledEvaluator};

/// Jobs with a longer timeout always get their own thread.
const INLINE_TIMEOUT_LIMIT: Duration = Duration::from_secs(20);

/// Jobs started with less than this left in the minute get their own
/// thread so the next tick is not delayed.
const INLINE_MINUTE_REMAINDER_MS: u64 = 30_000;

/// Extra delay past the full minute, so a tick never lands just before it.
const MINUTE_ALIGN_SLACK_MS: u64 = 1_000;

const MIN_INTERVAL_MS: u64 = 1_000;

static NEXT_RUNNER: AtomicU64 = AtomicU64::new(1);

struct ActiveJob {
    id: u64,
    unit: Arc<EvaluatorUnit>,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub expired_sessions: usize,
    /// Jobs run inline or handed to a runner thread.
    pub started: Vec<String>,
    /// Jobs skipped because an earlier run of the same name is still going.
    pub overlapping: Vec<String>,
}

/// Wakes once a minute (or on a fixed interval), expires idle sessions and
/// runs the cron jobs that apply.
pub struct BackgroundScheduler {
    app: Arc<AppContext>,
    pool: Arc<EvaluatorPool>,
    active_jobs: Arc<Mutex<HashMap<String, ActiveJob>>>,
    /// Unit the scheduler thread itself is waiting on, if any.
    inline_unit: Mutex<Option<Arc<EvaluatorUnit>>>,
    stopped: Mutex<bool>,
    wake: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_cleanup: Mutex<Option<Instant>>,
}

impl BackgroundScheduler {
    pub fn new(app: Arc<AppContext>, pool: Arc<EvaluatorPool>) -> Self {
        Self {
            app,
            pool,
            active_jobs: Arc::new(Mutex::new(HashMap::new())),
            inline_unit: Mutex::new(None),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            handle: Mutex::new(None),
            last_cleanup: Mutex::new(None),
        }
    }

    /// Start the scheduler thread. Returns false if it is disabled or
    /// already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.app.config().scheduler().enabled {
            info!(app = %self.app.name(), "Scheduler disabled");
            return false;
        }
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return false;
        }
        *self.stopped.lock() = false;

        let scheduler = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker", self.app.name()))
            .spawn(move || scheduler.run());
        match spawned {
            Ok(h) => {
                *handle = Some(h);
                info!(app = %self.app.name(), "Scheduler started");
                true
            }
            Err(e) => {
                error!(app = %self.app.name(), error = %e, "Failed to start scheduler thread");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread, interrupting any job it or a runner is executing.
    pub fn shutdown(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();

        let inline = self.inline_unit.lock().clone();
        if let Some(unit) = inline {
            unit.interrupt();
        }
        self.interrupt_jobs();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!(app = %self.app.name(), "Scheduler thread panicked");
        }
        self.interrupt_jobs();
        debug!(app = %self.app.name(), "Scheduler stopped");
    }

    /// Names of cron jobs currently running on runner threads.
    pub fn active_jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active_jobs.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// How long to sleep before the tick following `now`.
    pub fn next_sleep<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
        match self.app.config().scheduler().interval_secs {
            Some(secs) => Duration::from_millis(secs.saturating_mul(1000).max(MIN_INTERVAL_MS)),
            None => Duration::from_millis(
                cron::millis_to_next_full_minute(now.timestamp_millis()) + MINUTE_ALIGN_SLACK_MS,
            ),
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            let sleep = self.next_sleep(&Local::now());
            if self.wait_for_stop(sleep) {
                break;
            }
            let report = self.tick_at(&Local::now());
            debug!(
                app = %self.app.name(),
                expired = report.expired_sessions,
                started = report.started.len(),
                "Scheduler tick"
            );
        }
        self.interrupt_jobs();
    }

    /// Sleep up to `timeout`. Returns true if asked to stop.
    fn wait_for_stop(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake
                .wait_while_for(&mut stopped, |stopped| !*stopped, timeout);
        }
        *stopped
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// One pass: expire sessions, then start the cron jobs applying at `now`.
    pub fn tick_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> TickReport {
        let mut report = TickReport {
            expired_sessions: self.cleanup_sessions(),
            ..TickReport::default()
        };

        let entries = self.app.config().cron.clone();
        let mut jobs = CronJob::parse_all(&entries);
        jobs.extend(self.app.custom_jobs());
        CronJob::sort(&mut jobs);

        let to_next_minute = cron::millis_to_next_full_minute(now.timestamp_millis());
        for job in jobs {
            if self.is_stopped() {
                break;
            }
            if !job.applies_to(now) {
                continue;
            }
            if self.active_jobs.lock().contains_key(job.name()) {
                info!(app = %self.app.name(), job = %job.name(), "Cron job still active, skipping");
                report.overlapping.push(job.name().to_string());
                continue;
            }

            let unit = match self.pool.acquire() {
                Ok(unit) => unit,
                Err(e) => {
                    if !self.app.is_running() {
                        break;
                    }
                    warn!(app = %self.app.name(), job = %job.name(), error = %e, "No evaluator for cron job");
                    continue;
                }
            };

            report.started.push(job.name().to_string());
            if job.timeout() > INLINE_TIMEOUT_LIMIT || to_next_minute < INLINE_MINUTE_REMAINDER_MS {
                self.spawn_runner(job, unit);
            } else {
                self.run_inline(&job, unit);
            }
        }
        report
    }

    fn run_inline(&self, job: &CronJob, unit: PooledEvaluator) {
        debug!(app = %self.app.name(), job = %job.name(), "Running cron job");
        *self.inline_unit.lock() = Some(Arc::clone(unit.unit()));
        let result = unit.invoke_internal(
            None,
            FunctionRef::from(job.function()),
            Vec::new(),
            Some(job.timeout()),
        );
        *self.inline_unit.lock() = None;
        if let Err(e) = result {
            error!(app = %self.app.name(), job = %job.name(), error = %e, "Cron job failed");
        }
    }

    fn spawn_runner(&self, job: CronJob, unit: PooledEvaluator) {
        let id = NEXT_RUNNER.fetch_add(1, Ordering::Relaxed);
        let name = job.name().to_string();
        self.active_jobs.lock().insert(
            name.clone(),
            ActiveJob {
                id,
                unit: Arc::clone(unit.unit()),
            },
        );

        let active_jobs = Arc::clone(&self.active_jobs);
        let app_name = self.app.name().to_string();
        let spawned = thread::Builder::new()
            .name(format!("{app_name}-cron-{name}"))
            .spawn(move || {
                debug!(app = %app_name, job = %job.name(), "Running cron job on runner thread");
                let result = unit.invoke_internal(
                    None,
                    FunctionRef::from(job.function()),
                    Vec::new(),
                    Some(job.timeout()),
                );
                if let Err(e) = result {
                    error!(app = %app_name, job = %job.name(), error = %e, "Cron job failed");
                }
                let mut jobs = active_jobs.lock();
                if jobs.get(job.name()).is_some_and(|active| active.id == id) {
                    jobs.remove(job.name());
                }
                drop(jobs);
                drop(unit);
            });
        if let Err(e) = spawned {
            self.active_jobs.lock().remove(&name);
            error!(app = %self.app.name(), job = %name, error = %e, "Failed to start cron runner");
        }
    }

    fn interrupt_jobs(&self) {
        let jobs: Vec<ActiveJob> = self.active_jobs.lock().drain().map(|(_, job)| job).collect();
        for job in jobs {
            job.unit.interrupt();
        }
    }

    /// Expire idle sessions, calling `onLogout` for logged-in ones. Runs at
    /// most once per cleanup interval.
    fn cleanup_sessions(&self) -> usize {
        let (cleanup_interval, session_timeout) = {
            let config = self.app.config();
            let sessions = config.sessions();
            (sessions.cleanup_interval(), sessions.timeout())
        };
        {
            let mut last = self.last_cleanup.lock();
            if last.is_some_and(|at| at.elapsed() < cleanup_interval) {
                return 0;
            }
            *last = Some(Instant::now());
        }

        let expired = self.app.sessions().drain_expired(session_timeout);
        if expired.is_empty() {
            return 0;
        }
        info!(app = %self.app.name(), count = expired.len(), "Expired sessions");

        let timeout = self.app.config().requests().internal_timeout();
        let mut unit: Option<PooledEvaluator> = None;
        for session in &expired {
            let Some(user) = session.logout() else { continue };
            if unit.is_none() {
                match self.pool.acquire() {
                    Ok(acquired) => unit = Some(acquired),
                    Err(e) => {
                        warn!(app = %self.app.name(), error = %e, "No evaluator for onLogout");
                        break;
                    }
                }
            }
            let Some(unit) = unit.as_ref() else { break };
            *self.inline_unit.lock() = Some(Arc::clone(unit.unit()));
            let result = unit.invoke_internal(
                Some(Value::Object(user)),
                FunctionRef::from("onLogout"),
                vec![Value::from(session.id())],
                Some(timeout),
            );
            *self.inline_unit.lock() = None;
            if let Err(e) = result {
                warn!(app = %self.app.name(), session_id = %session.id(), error = %e, "onLogout failed");
            }
        }
        expired.len()
    }
}

impl std::fmt::Debug for BackgroundScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundScheduler")
            .field("app", &self.app.name())
            .field("active_jobs", &self.active_jobs())
            .finish_non_exhaustive()
    }
}
