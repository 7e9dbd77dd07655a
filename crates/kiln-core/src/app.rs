//! The application facade.
//!
//! [`AppContext`] is the shared, read-mostly state every evaluator, the
//! router and the scheduler hold an `Arc` to. [`Application`] owns the pool,
//! router and scheduler and drives the lifecycle.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use kiln_config::AppConfig;
use kiln_session::{Session, SessionManager, SessionRecord, load_records, save_records};
use kiln_types::Value;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cron::CronJob;
use crate::engine::{EngineFactory, FunctionRef, ObjectGraph, ScriptingEngine, TransactionManager};
use crate::error::{KilnError, Result};
use crate::exchange::{RequestTrans, Response};
use crate::memory::{FunctionTable, MemoryEngineFactory, MemoryGraph, MemoryTransactions};
use crate::pool::EvaluatorPool;
use crate::prototype::PrototypeRegistry;
use crate::router::RequestRouter;
use crate::scheduler::BackgroundScheduler;
use crate::skin::SkinRegistry;

// ─────────────────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Request counters.
#[derive(Debug, Default)]
pub struct Stats {
    requests: AtomicU64,
    rpc_requests: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc(&self) {
        self.rpc_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn rpc_requests(&self) -> u64 {
        self.rpc_requests.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared context
// ─────────────────────────────────────────────────────────────────────────────

/// State shared by everything that runs on behalf of one application.
pub struct AppContext {
    name: String,
    config: RwLock<AppConfig>,
    engine_factory: Arc<dyn EngineFactory>,
    transactions: Arc<dyn TransactionManager>,
    graph: Arc<dyn ObjectGraph>,
    prototypes: PrototypeRegistry,
    skins: SkinRegistry,
    sessions: SessionManager,
    stats: Stats,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    /// Milliseconds since the epoch, 0 until code changes for the first time.
    last_code_update: AtomicI64,
    custom_jobs: RwLock<BTreeMap<String, CronJob>>,
}

impl AppContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current settings. Do not hold the guard across calls that may block.
    pub fn config(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.config.read()
    }

    pub fn engine_factory(&self) -> &dyn EngineFactory {
        self.engine_factory.as_ref()
    }

    pub fn transactions(&self) -> &dyn TransactionManager {
        self.transactions.as_ref()
    }

    pub fn graph(&self) -> &dyn ObjectGraph {
        self.graph.as_ref()
    }

    pub fn prototypes(&self) -> &PrototypeRegistry {
        &self.prototypes
    }

    pub fn skins(&self) -> &SkinRegistry {
        &self.skins
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock()
    }

    pub fn last_code_update(&self) -> Option<DateTime<Utc>> {
        match self.last_code_update.load(Ordering::SeqCst) {
            0 => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    /// Jobs added at runtime, in name order.
    pub fn custom_jobs(&self) -> Vec<CronJob> {
        self.custom_jobs.read().values().cloned().collect()
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`Application`]. Collaborators default to the in-memory ones.
pub struct ApplicationBuilder {
    config: AppConfig,
    engine_factory: Option<Arc<dyn EngineFactory>>,
    transactions: Option<Arc<dyn TransactionManager>>,
    graph: Option<Arc<dyn ObjectGraph>>,
    skins: Vec<(String, String, String)>,
}

impl ApplicationBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            engine_factory: None,
            transactions: None,
            graph: None,
            skins: Vec::new(),
        }
    }

    pub fn with_engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.engine_factory = Some(factory);
        self
    }

    pub fn with_transactions(mut self, transactions: Arc<dyn TransactionManager>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    pub fn with_graph(mut self, graph: Arc<dyn ObjectGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Register skin source for `prototype` (`"global"` for global skins).
    pub fn with_skin(
        mut self,
        prototype: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        self.skins.push((prototype.into(), name.into(), source.into()));
        self
    }

    /// Validate the configuration and assemble the application. Nothing is
    /// started yet.
    pub fn build(self) -> Result<Application> {
        self.config.validate()?;

        let skins = SkinRegistry::new(self.config.skins().cache_size);
        for (prototype, name, source) in &self.skins {
            skins.add_skin(prototype, name, source);
        }

        let context = Arc::new(AppContext {
            name: self.config.app_name().to_string(),
            prototypes: PrototypeRegistry::new(&self.config.prototypes),
            config: RwLock::new(self.config),
            engine_factory: self
                .engine_factory
                .unwrap_or_else(|| Arc::new(MemoryEngineFactory::new(FunctionTable::new()))),
            transactions: self
                .transactions
                .unwrap_or_else(|| Arc::new(MemoryTransactions::new())),
            graph: self.graph.unwrap_or_else(|| Arc::new(MemoryGraph::with_root())),
            skins,
            sessions: SessionManager::new(),
            stats: Stats::default(),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            last_code_update: AtomicI64::new(0),
            custom_jobs: RwLock::new(BTreeMap::new()),
        });

        let pool = Arc::new(EvaluatorPool::new(Arc::clone(&context)));
        let router = RequestRouter::new(Arc::clone(&context), Arc::clone(&pool));
        let scheduler = Arc::new(BackgroundScheduler::new(Arc::clone(&context), Arc::clone(&pool)));
        Ok(Application {
            context,
            pool,
            router,
            scheduler,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application
// ─────────────────────────────────────────────────────────────────────────────

/// Point-in-time view of an application, for status pages and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: i64,
    pub requests: u64,
    pub rpc_requests: u64,
    pub errors: u64,
    pub free_evaluators: usize,
    pub active_evaluators: usize,
    pub total_evaluators: usize,
    pub max_evaluators: usize,
    pub sessions: usize,
    pub active_cron_jobs: Vec<String>,
    pub last_code_update: Option<DateTime<Utc>>,
}

/// One running application: its pool, router and scheduler.
pub struct Application {
    context: Arc<AppContext>,
    pool: Arc<EvaluatorPool>,
    router: RequestRouter,
    scheduler: Arc<BackgroundScheduler>,
}

impl Application {
    pub fn builder(config: AppConfig) -> ApplicationBuilder {
        ApplicationBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    pub fn pool(&self) -> &Arc<EvaluatorPool> {
        &self.pool
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn scheduler(&self) -> &Arc<BackgroundScheduler> {
        &self.scheduler
    }

    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    /// Pre-allocate evaluators, run `onStart` and start the scheduler.
    pub fn start(&self) -> Result<()> {
        if self.context.running.swap(true, Ordering::SeqCst) {
            return Err(KilnError::IllegalState(format!(
                "Application {} is already running",
                self.name()
            )));
        }
        *self.context.started_at.lock() = Some(Utc::now());
        info!(app = %self.name(), "Starting application");

        let min_threads = self.context.config().evaluators().min_threads;
        self.pool.preallocate(min_threads);

        if let Err(e) = self.invoke_hook("onStart") {
            error!(app = %self.name(), error = %e, "onStart failed");
        }

        self.scheduler.start();
        Ok(())
    }

    /// Run `onStop`, stop the scheduler and shut down every evaluator.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        info!(app = %self.name(), "Stopping application");
        if let Err(e) = self.invoke_hook("onStop") {
            error!(app = %self.name(), error = %e, "onStop failed");
        }

        self.context.running.store(false, Ordering::SeqCst);
        self.scheduler.shutdown();
        self.pool.stop_all();
        debug!(app = %self.name(), "Application stopped");
    }

    fn invoke_hook(&self, name: &str) -> Result<Value> {
        let timeout = self.context.config().requests().internal_timeout();
        let unit = self.pool.acquire()?;
        unit.invoke_internal(None, FunctionRef::from(name), Vec::new(), Some(timeout))
    }

    // ── Entry points ──────────────────────────────────────────────────────

    pub fn execute(&self, request: RequestTrans) -> Result<Response> {
        self.router.execute(request)
    }

    pub fn invoke_rpc(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.router.invoke_rpc(method, args)
    }

    pub fn invoke_external(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.router.invoke_external(method, args)
    }

    /// Invoke `function` on `this`. A negative timeout waits indefinitely.
    pub fn invoke_internal(
        &self,
        this: Option<Value>,
        function: impl Into<FunctionRef>,
        args: Vec<Value>,
        timeout_ms: i64,
    ) -> Result<Value> {
        self.router.invoke_internal(this, function, args, timeout_ms)
    }

    // ── Management ────────────────────────────────────────────────────────

    /// Change the maximum pool size. See [`EvaluatorPool::resize`].
    pub fn resize(&self, size: usize) -> Result<bool> {
        self.pool.resize(size)
    }

    /// Add or replace a custom cron job, keyed by its name.
    pub fn add_cron_job(&self, job: CronJob) {
        info!(app = %self.name(), job = %job.name(), "Added cron job");
        self.context
            .custom_jobs
            .write()
            .insert(job.name().to_string(), job);
    }

    pub fn remove_cron_job(&self, name: &str) -> Option<CronJob> {
        self.context.custom_jobs.write().remove(name)
    }

    /// Swap in new settings. The pool is resized if `max_threads` changed;
    /// the application name and prototype declarations stay as built.
    pub fn update_config(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        let max_threads = config.evaluators().max_threads;
        *self.context.config.write() = config;

        if max_threads != self.pool.max() {
            match self.pool.resize(max_threads) {
                Ok(true) => {}
                Ok(false) => warn!(
                    app = %self.name(),
                    max_threads,
                    "Pool could not shrink fully, busy evaluators remain"
                ),
                Err(e) => warn!(app = %self.name(), error = %e, "Pool resize failed"),
            }
        }
        info!(app = %self.name(), "Configuration updated");
        Ok(())
    }

    /// Note that application code changed and hand the new source to every
    /// initialized engine.
    pub fn code_changed(&self, resource: &str, source: &str) {
        self.context
            .last_code_update
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        let mut reloaded = 0;
        for unit in self.pool.units() {
            if let Some(engine) = unit.engine_if_initialized() {
                engine.inject_code_resource(resource, source);
                reloaded += 1;
            }
        }
        debug!(app = %self.name(), resource, engines = reloaded, "Code changed");
    }

    pub fn status(&self) -> AppStatus {
        let stats = self.context.stats();
        let started_at = self.context.started_at();
        let total = self.pool.total_count();
        let free = self.pool.free_count();
        AppStatus {
            name: self.name().to_string(),
            running: self.is_running(),
            started_at,
            uptime_secs: started_at.map_or(0, |at| (Utc::now() - at).num_seconds()),
            requests: stats.requests(),
            rpc_requests: stats.rpc_requests(),
            errors: stats.errors(),
            free_evaluators: free,
            active_evaluators: total.saturating_sub(free),
            total_evaluators: total,
            max_evaluators: self.pool.max(),
            sessions: self.context.sessions().len(),
            active_cron_jobs: self.scheduler.active_jobs(),
            last_code_update: self.context.last_code_update(),
        }
    }

    // ── Session persistence ───────────────────────────────────────────────

    /// Write every session's cache node to `path`. Returns the number stored.
    pub fn store_sessions(&self, path: &Path) -> Result<usize> {
        let engine = self.serializer()?;
        let mut records = Vec::new();
        for session in self.context.sessions().sessions() {
            let cache = Value::Object(session.cache_node().clone());
            match engine.serialize(&cache) {
                Ok(data) => records.push(SessionRecord {
                    id: session.id().to_string(),
                    user_name: session.user_name(),
                    data,
                }),
                Err(e) => warn!(app = %self.name(), session_id = %session.id(), error = %e, "Could not serialize session"),
            }
        }
        save_records(path, &records)?;
        info!(app = %self.name(), count = records.len(), "Stored sessions");
        Ok(records.len())
    }

    /// Restore sessions written by [`store_sessions`](Self::store_sessions).
    /// Sessions come back logged out.
    pub fn load_sessions(&self, path: &Path) -> Result<usize> {
        let records = load_records(path)?;
        if records.is_empty() {
            return Ok(0);
        }
        let engine = self.serializer()?;
        let mut loaded = 0;
        for record in records {
            match engine.deserialize(&record.data) {
                Ok(Value::Object(cache)) => {
                    self.context
                        .sessions()
                        .insert(Arc::new(Session::with_cache_node(record.id, cache)));
                    loaded += 1;
                }
                Ok(_) => warn!(app = %self.name(), session_id = %record.id, "Session cache is not an object"),
                Err(e) => warn!(app = %self.name(), session_id = %record.id, error = %e, "Could not restore session"),
            }
        }
        info!(app = %self.name(), count = loaded, "Loaded sessions");
        Ok(loaded)
    }

    /// An initialized engine for (de)serialization: a pooled one if any
    /// exists, otherwise a fresh one from the factory.
    fn serializer(&self) -> Result<Arc<dyn ScriptingEngine>> {
        if let Some(engine) = self
            .pool
            .units()
            .iter()
            .find_map(|unit| unit.engine_if_initialized())
        {
            return Ok(engine);
        }
        let engine = self.context.engine_factory().create();
        engine.init(&self.context, usize::MAX)?;
        Ok(engine)
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
