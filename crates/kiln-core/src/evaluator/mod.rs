//! Evaluator units.
//!
//! A unit pairs one scripting engine with at most one worker thread. Work is
//! handed over through a single pending slot; the caller waits on a
//! [`Handoff`] for the result. Every submission bumps the unit's generation,
//! and a caller that gives up bumps it again, so in-flight work can tell
//! whether anyone is still waiting for it.

mod exec;
mod handoff;

pub use exec::{MAX_CONFLICT_ATTEMPTS, conflict_backoff};
pub use handoff::Handoff;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use kiln_session::Session;
use kiln_types::Value;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::app::AppContext;
use crate::engine::{FunctionRef, ScriptingEngine, Transaction};
use crate::error::{KilnError, Result, ScriptError};
use crate::exchange::{RequestTrans, Response, ResponseTrans};

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

/// Non-HTTP entry points that resolve a dotted function name from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// XML-RPC call, subject to the access list.
    Rpc,
    /// Call from embedding code.
    External,
}

impl CallKind {
    fn method(self) -> &'static str {
        match self {
            CallKind::Rpc => "XMLRPC",
            CallKind::External => "EXTERNAL",
        }
    }
}

/// A unit of work for an evaluator.
#[derive(Debug, Clone)]
pub enum Job {
    Http {
        request: RequestTrans,
        session: Arc<Session>,
    },
    Call {
        kind: CallKind,
        function: String,
        args: Vec<Value>,
    },
    Internal {
        this: Option<Value>,
        function: FunctionRef,
        args: Vec<Value>,
    },
}

/// What a finished job hands back to its caller.
#[derive(Debug, Clone)]
pub struct Completion {
    pub response: Response,
    pub result: std::result::Result<Value, ScriptError>,
}

struct Assignment {
    generation: u64,
    job: Job,
    reply: Arc<Handoff<Completion>>,
}

struct ActiveWork {
    generation: u64,
    transaction: Option<Arc<dyn Transaction>>,
    reply: Arc<Handoff<Completion>>,
}

#[derive(Default)]
struct UnitState {
    pending: Option<Assignment>,
    active: Option<ActiveWork>,
    /// Serial of the thread currently designated to serve this unit.
    worker: Option<u64>,
    /// Set by shutdown, or when running work had to be abandoned. A retired
    /// unit takes no new work, so its engine stays with the thread that
    /// last entered it.
    retired: bool,
}

/// A pooled worker: one scripting engine, one thread at a time.
pub struct EvaluatorUnit {
    id: usize,
    app: Arc<AppContext>,
    generation: Arc<AtomicU64>,
    engine: Mutex<Option<Arc<dyn ScriptingEngine>>>,
    state: Mutex<UnitState>,
    work: Condvar,
}

impl EvaluatorUnit {
    pub fn new(id: usize, app: Arc<AppContext>) -> Self {
        Self {
            id,
            app,
            generation: Arc::new(AtomicU64::new(0)),
            engine: Mutex::new(None),
            state: Mutex::new(UnitState::default()),
            work: Condvar::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn generation_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generation)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Whether work is pending or running.
    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_some() || state.active.is_some()
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    /// The engine, if it has been created already.
    pub fn engine_if_initialized(&self) -> Option<Arc<dyn ScriptingEngine>> {
        self.engine.lock().clone()
    }

    /// Create and initialize the engine on first use; later calls reuse it.
    pub fn ensure_engine(&self) -> std::result::Result<Arc<dyn ScriptingEngine>, ScriptError> {
        let mut slot = self.engine.lock();
        if let Some(engine) = slot.as_ref() {
            return Ok(Arc::clone(engine));
        }
        let engine = self.app.engine_factory().create();
        engine.init(&self.app, self.id)?;
        debug!(app = %self.app.name(), unit = self.id, "Initialized scripting engine");
        *slot = Some(Arc::clone(&engine));
        Ok(engine)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Caller side
    // ─────────────────────────────────────────────────────────────────────

    /// Hand a job to the unit, starting a worker thread if none is alive.
    pub fn submit(self: &Arc<Self>, job: Job) -> (u64, Arc<Handoff<Completion>>) {
        let reply = Arc::new(Handoff::new());
        let mut state = self.state.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if state.retired {
            reply.complete(self.refused("Evaluator is retired"));
            return (generation, reply);
        }
        state.pending = Some(Assignment {
            generation,
            job,
            reply: Arc::clone(&reply),
        });

        if state.worker.is_some() {
            self.work.notify_all();
            return (generation, reply);
        }

        let serial = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
        let unit = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.app.name(), serial))
            .spawn(move || unit.serve(serial));
        match spawned {
            Ok(_) => state.worker = Some(serial),
            Err(e) => {
                error!(app = %self.app.name(), unit = self.id, error = %e, "Failed to start evaluator thread");
                state.pending = None;
                reply.complete(self.refused(&format!("Could not start evaluator thread: {e}")));
            }
        }
        (generation, reply)
    }

    fn refused(&self, message: &str) -> Completion {
        let mut response = ResponseTrans::new();
        response.report_error(self.app.name(), message);
        Completion {
            response: response.snapshot(),
            result: Err(ScriptError::runtime(message)),
        }
    }

    /// Run an HTTP request and wait for its response.
    ///
    /// On timeout the unit is stopped and a synthesized error page returned.
    pub fn invoke_http(self: &Arc<Self>, request: RequestTrans, session: Arc<Session>) -> Response {
        let timeout = self.app.config().requests().timeout();
        let (generation, reply) = self.submit(Job::Http { request, session });
        if let Some(done) = reply.take(Some(timeout)) {
            return done.response;
        }
        if let Some(done) = reply.cancel() {
            return done.response;
        }
        self.stop(generation);
        warn!(app = %self.app.name(), unit = self.id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
        let mut response = ResponseTrans::new();
        response.report_error(self.app.name(), "Request timed out");
        response.snapshot()
    }

    /// Run an RPC or external call and wait for its result.
    pub fn invoke_call(
        self: &Arc<Self>,
        kind: CallKind,
        function: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let job = Job::Call {
            kind,
            function: function.to_string(),
            args,
        };
        self.wait_for_result(job, timeout)
    }

    /// Invoke a function directly on an object (or the global scope).
    pub fn invoke_internal(
        self: &Arc<Self>,
        this: Option<Value>,
        function: FunctionRef,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.wait_for_result(
            Job::Internal {
                this,
                function,
                args,
            },
            timeout,
        )
    }

    fn wait_for_result(self: &Arc<Self>, job: Job, timeout: Option<Duration>) -> Result<Value> {
        let (generation, reply) = self.submit(job);
        if let Some(done) = reply.take(timeout) {
            return done.result.map_err(KilnError::from);
        }
        let interrupted = reply.is_cancelled();
        if let Some(done) = reply.cancel() {
            return done.result.map_err(KilnError::from);
        }
        self.stop(generation);
        if interrupted {
            Err(KilnError::Interrupted)
        } else {
            Err(KilnError::Timeout)
        }
    }

    /// Give up on the work of `generation`.
    ///
    /// Clears the worker designation so in-flight work finds itself
    /// orphaned. Returns true if the work was running and had to be aborted,
    /// in which case the unit is retired: the orphaned thread may never
    /// return, and the pool replaces the unit instead of reusing its engine.
    /// Work that was still waiting to be picked up is simply dropped.
    pub fn stop(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if !self.is_current(generation) {
            return false;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        state.worker = None;
        self.work.notify_all();

        if state
            .pending
            .as_ref()
            .is_some_and(|p| p.generation == generation)
        {
            state.pending = None;
            return false;
        }

        let transaction = match state.active.as_ref() {
            Some(active) if active.generation == generation => active.transaction.clone(),
            _ => return false,
        };
        state.retired = true;
        drop(state);

        if let Some(engine) = self.engine_if_initialized() {
            engine.abort();
        }
        if let Some(txn) = transaction {
            txn.kill();
            txn.abort();
            txn.close_connections();
        }
        warn!(app = %self.app.name(), unit = self.id, "Stopped running evaluator, retiring it");
        true
    }

    /// Cancel whatever the unit is doing and wake its caller.
    pub fn interrupt(&self) {
        let reply = {
            let state = self.state.lock();
            state
                .active
                .as_ref()
                .map(|a| Arc::clone(&a.reply))
                .or_else(|| state.pending.as_ref().map(|p| Arc::clone(&p.reply)))
        };
        if let Some(reply) = reply {
            reply.cancel();
        }
        self.stop(self.generation());
    }

    /// Drop leftovers of a caller that already went away.
    pub fn recycle(&self) {
        let mut state = self.state.lock();
        if state
            .pending
            .as_ref()
            .is_some_and(|p| p.reply.is_cancelled() || !self.is_current(p.generation))
        {
            state.pending = None;
        }
    }

    /// Stop for good and release the engine.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.retired = true;
        }
        self.interrupt();
        if let Some(engine) = self.engine.lock().take() {
            engine.shutdown();
        }
        debug!(app = %self.app.name(), unit = self.id, "Evaluator shut down");
    }

    pub(crate) fn set_transaction(&self, generation: u64, transaction: Option<Arc<dyn Transaction>>) {
        let mut state = self.state.lock();
        if let Some(active) = state.active.as_mut()
            && active.generation == generation
        {
            active.transaction = transaction;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Worker side
    // ─────────────────────────────────────────────────────────────────────

    fn serve(self: Arc<Self>, serial: u64) {
        let idle_timeout = self.app.config().evaluators().idle_timeout();
        while let Some(assignment) = self.next_assignment(serial, idle_timeout) {
            let completion = exec::run(&self, assignment.generation, assignment.job);

            {
                let mut state = self.state.lock();
                if state
                    .active
                    .as_ref()
                    .is_some_and(|a| a.generation == assignment.generation)
                {
                    state.active = None;
                }
            }

            if let Some(completion) = completion
                && self.is_current(assignment.generation)
            {
                assignment.reply.complete(completion);
            }
        }

        if self.is_retired()
            && let Some(engine) = self.engine.lock().take()
        {
            engine.shutdown();
            debug!(app = %self.app.name(), unit = self.id, "Released engine of retired evaluator");
        }
    }

    fn next_assignment(&self, serial: u64, idle_timeout: Duration) -> Option<Assignment> {
        let mut state = self.state.lock();
        loop {
            if state.retired || state.worker != Some(serial) {
                return None;
            }
            if let Some(assignment) = state.pending.take() {
                state.active = Some(ActiveWork {
                    generation: assignment.generation,
                    transaction: None,
                    reply: Arc::clone(&assignment.reply),
                });
                return Some(assignment);
            }
            if self.work.wait_for(&mut state, idle_timeout).timed_out() && state.pending.is_none() {
                if state.worker == Some(serial) {
                    state.worker = None;
                }
                debug!(app = %self.app.name(), unit = self.id, "Evaluator thread idle, exiting");
                return None;
            }
        }
    }
}

impl std::fmt::Debug for EvaluatorUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluatorUnit")
            .field("id", &self.id)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
