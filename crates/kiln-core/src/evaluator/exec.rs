//! The per-job execution loop run on a unit's worker thread.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kiln_session::Session;
use kiln_types::Value;
use rand::Rng;
use tracing::{debug, error, info};

use super::{CallKind, Completion, EvaluatorUnit, Job};
use crate::engine::{ArgsWrap, FunctionRef, ScriptingEngine, Transaction};
use crate::error::ScriptError;
use crate::exchange::{Exchange, RequestTrans, ResponseTrans, StopSignal};
use crate::path;

/// Attempts made before a transaction that keeps conflicting is given up.
pub const MAX_CONFLICT_ATTEMPTS: u32 = 8;

const CONFLICT_GIVE_UP: &str = "Couldn't complete transaction due to heavy object traffic";

/// Wait before retry number `attempt` after a conflict: at least
/// `base_ms * attempt`, plus up to twice that in random jitter.
pub fn conflict_backoff(attempt: u32, base_ms: u64, rng: &mut impl Rng) -> Duration {
    let floor = base_ms.saturating_mul(u64::from(attempt));
    let jitter = if floor == 0 {
        0
    } else {
        rng.random_range(0..floor.saturating_mul(2))
    };
    Duration::from_millis(floor.saturating_add(jitter))
}

/// How one pass through the loop ended.
#[derive(Debug)]
enum Step {
    Finished,
    /// The transaction lost a race; retry the same work after a backoff.
    RetryConflict,
    /// Application error; run the configured error action next.
    RetryAsError(ScriptError),
    /// The caller stopped waiting; leave everything untouched.
    Abandoned,
}

enum Work {
    Http,
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

/// Run `job` to completion. Returns `None` if it was abandoned.
pub(super) fn run(unit: &Arc<EvaluatorUnit>, generation: u64, job: Job) -> Option<Completion> {
    let app = Arc::clone(unit.app());
    let stop = StopSignal::new(unit.generation_counter(), generation);
    if !stop.is_current() {
        return None;
    }

    let (request, session, work) = match job {
        Job::Http { request, session } => (request, session, Work::Http),
        Job::Call {
            kind,
            function,
            args,
        } => (
            RequestTrans::new(kind.method(), function.clone()),
            transient_session(),
            Work::Call {
                kind,
                function,
                args,
            },
        ),
        Job::Internal {
            this,
            function,
            args,
        } => {
            let label = function.name().unwrap_or("(function)").to_string();
            (
                RequestTrans::new("INTERNAL", label),
                transient_session(),
                Work::Internal {
                    this,
                    function,
                    args,
                },
            )
        }
    };

    let engine = match unit.ensure_engine() {
        Ok(engine) => engine,
        Err(e) => {
            error!(app = %app.name(), unit = unit.id(), error = %e, "Scripting engine failed to initialize");
            let mut response = ResponseTrans::new();
            response.report_error(app.name(), &e.to_string());
            return Some(Completion {
                response: response.snapshot(),
                result: Err(e),
            });
        }
    };

    let txname = format!("{}:{}", request.method(), request.path());
    debug!(app = %app.name(), unit = unit.id(), txn = %txname, "Executing");

    let cx = Exchange::new(app, engine, unit.id(), stop, request, session);
    let execution = Execution {
        unit,
        generation,
        cx,
        work,
        txname,
        conflicts: 0,
        cause: None,
        result: Ok(Value::Null),
    };
    execution.run()
}

fn transient_session() -> Arc<Session> {
    Arc::new(Session::new(uuid::Uuid::new_v4().simple().to_string()))
}

struct Execution<'a> {
    unit: &'a EvaluatorUnit,
    generation: u64,
    cx: Exchange,
    work: Work,
    txname: String,
    conflicts: u32,
    /// The application error being handled by the error action, if any.
    cause: Option<ScriptError>,
    result: Result<Value, ScriptError>,
}

impl Execution<'_> {
    fn run(mut self) -> Option<Completion> {
        let mut rng = rand::rng();
        loop {
            if !self.cx.is_current() {
                return None;
            }
            match self.pass() {
                Step::Finished => break,
                Step::Abandoned => return None,
                Step::RetryConflict => {
                    let base = self.cx.app().config().requests().conflict_backoff_ms;
                    let wait = conflict_backoff(self.conflicts, base, &mut rng);
                    debug!(
                        app = %self.cx.app().name(),
                        txn = %self.txname,
                        attempt = self.conflicts,
                        wait_ms = wait.as_millis() as u64,
                        "Transaction conflict, retrying"
                    );
                    thread::sleep(wait);
                }
                Step::RetryAsError(cause) => self.cause = Some(cause),
            }
        }
        Some(Completion {
            response: self.cx.response.snapshot(),
            result: self.result,
        })
    }

    fn pass(&mut self) -> Step {
        let engine = Arc::clone(self.cx.engine());
        let step = match engine.enter_context() {
            Ok(()) => self.pass_in_context(&engine),
            Err(e) => self.fail(None, e),
        };
        // a broken engine may fail to leave; nothing left to do about it
        let _ = engine.exit_context();
        step
    }

    fn pass_in_context(&mut self, engine: &Arc<dyn ScriptingEngine>) -> Step {
        if let Work::Internal { this, function, .. } = &self.work
            && let Some(name) = function.name()
            && !engine.has_function(this.as_ref(), name, true)
        {
            info!(app = %self.cx.app().name(), function = name, "Function not defined, skipping call");
            return Step::Finished;
        }

        let txname = match self.cause {
            Some(_) => format!("error:{}", self.txname),
            None => self.txname.clone(),
        };
        let txn = self.cx.app().transactions().begin(&txname);
        self.unit
            .set_transaction(self.generation, Some(Arc::clone(&txn)));

        let root = self.cx.app().graph().data_root();
        if let Some(cause) = &self.cause {
            self.cx.response.set_error(cause.to_string());
        }

        let outcome = match &self.work {
            Work::Http => self.http(engine, root),
            Work::Call {
                kind,
                function,
                args,
            } => {
                let (kind, function, args) = (*kind, function.clone(), args.clone());
                self.call(engine, root, kind, &function, args)
            }
            Work::Internal {
                this,
                function,
                args,
            } => {
                let (this, function, args) = (this.clone(), function.clone(), args.clone());
                self.internal(engine, this, &function, args)
            }
        };

        let step = match outcome {
            Ok(()) if !self.cx.is_current() => Step::Abandoned,
            Ok(()) => match txn.commit() {
                Ok(()) => Step::Finished,
                Err(e) => self.fail(Some(&txn), e),
            },
            Err(e) => self.fail(Some(&txn), e),
        };
        self.unit.set_transaction(self.generation, None);
        step
    }

    fn fail(&mut self, txn: Option<&Arc<dyn Transaction>>, err: ScriptError) -> Step {
        if !self.cx.is_current() {
            return Step::Abandoned;
        }
        let abort = || {
            if let Some(txn) = txn {
                txn.abort();
            }
        };
        let app_name = self.cx.app().name().to_string();

        match err {
            ScriptError::Abort => {
                abort();
                Step::Finished
            }
            ScriptError::Conflict(_) => {
                self.cx.response.reset();
                abort();
                self.conflicts += 1;
                if self.conflicts < MAX_CONFLICT_ATTEMPTS {
                    return Step::RetryConflict;
                }
                error!(app = %app_name, txn = %self.txname, attempts = self.conflicts, "Giving up after repeated transaction conflicts");
                self.cx.response.report_error(&app_name, CONFLICT_GIVE_UP);
                self.result = Err(err);
                Step::Finished
            }
            err => {
                abort();
                if !self.cx.is_current() {
                    return Step::Abandoned;
                }
                error!(app = %app_name, txn = %self.txname, error = %err, "Error executing request");
                if !matches!(self.work, Work::Http) {
                    self.result = Err(err);
                    return Step::Finished;
                }

                self.cx.response.reset();
                match self.cause.take() {
                    None => {
                        if !matches!(err, ScriptError::NotFound(_)) {
                            self.cx.app().stats().record_error();
                        }
                        if self.cx.request.is_xmlrpc() {
                            self.cx.response.set_rpc_fault(err.to_string());
                            self.result = Err(err);
                            return Step::Finished;
                        }
                        Step::RetryAsError(err)
                    }
                    Some(cause) => {
                        self.cx.response.report_error(&app_name, &cause.to_string());
                        self.result = Err(cause);
                        Step::Finished
                    }
                }
            }
        }
    }

    fn http(&mut self, engine: &Arc<dyn ScriptingEngine>, root: Value) -> Result<(), ScriptError> {
        let pending = self.cx.session().recover_messages();
        self.cx.response.restore_messages(pending);

        match self.dispatch_http(engine, root) {
            Err(ScriptError::Redirect(url)) => {
                debug!(app = %self.cx.app().name(), url = %url, "Redirected");
                if self.cx.response.redirect().is_some() {
                    let messages = self.cx.response.pending_messages();
                    self.cx.session().store_messages(messages);
                }
                Ok(())
            }
            other => other,
        }
    }

    fn dispatch_http(
        &mut self,
        engine: &Arc<dyn ScriptingEngine>,
        root: Value,
    ) -> Result<(), ScriptError> {
        let (error_action, notfound_action) = {
            let config = self.cx.app().config();
            let requests = config.requests();
            (requests.error_action.clone(), requests.notfound_action.clone())
        };

        let (target, action) = match &self.cause {
            Some(cause) => {
                self.cx.response.set_status(500);
                match path::get_action(&mut self.cx, &root, Some(error_action.as_str())) {
                    Some(action) => (root, action),
                    None => return Err(cause.clone()),
                }
            }
            None => match path::resolve(&mut self.cx, &root) {
                Ok(resolved) => (resolved.target, resolved.action),
                Err(ScriptError::NotFound(msg)) => {
                    self.cx.response.set_status(404);
                    match path::get_action(&mut self.cx, &root, Some(notfound_action.as_str())) {
                        Some(action) => (root, action),
                        None => return Err(ScriptError::NotFound(msg)),
                    }
                }
                Err(e) => return Err(e),
            },
        };

        path::register_handlers(&mut self.cx);
        self.cx.request.set_action(&action);

        let this = Some(&target);
        self.cx.skin_depth = 0;
        self.invoke_hook(engine, &target, "onRequest")?;
        self.cx.skin_depth = 0;

        if self.cx.request.is_xmlrpc() {
            let call = self
                .cx
                .request
                .rpc()
                .cloned()
                .ok_or_else(|| ScriptError::runtime("XML-RPC action called without a call body"))?;
            let mut args = Vec::with_capacity(call.params.len() + 1);
            args.push(Value::from(call.method));
            args.extend(call.params);
            let result = engine.invoke(
                &mut self.cx,
                this,
                &FunctionRef::from(action),
                &mut args,
                ArgsWrap::XmlRpc,
                false,
            )?;
            self.cx.response.set_rpc_result(result);
            self.cx.app().stats().record_rpc();
        } else {
            engine.invoke(
                &mut self.cx,
                this,
                &FunctionRef::from(action),
                &mut [],
                ArgsWrap::Default,
                false,
            )?;
        }

        self.invoke_hook(engine, &target, "onResponse")
    }

    fn invoke_hook(
        &mut self,
        engine: &Arc<dyn ScriptingEngine>,
        target: &Value,
        name: &str,
    ) -> Result<(), ScriptError> {
        if engine.has_function(Some(target), name, false) {
            engine.invoke(
                &mut self.cx,
                Some(target),
                &FunctionRef::from(name),
                &mut [],
                ArgsWrap::Default,
                false,
            )?;
        }
        Ok(())
    }

    fn call(
        &mut self,
        engine: &Arc<dyn ScriptingEngine>,
        root: Value,
        kind: CallKind,
        function: &str,
        mut args: Vec<Value>,
    ) -> Result<(), ScriptError> {
        let mut target = root;
        let mut name = function;
        if let Some((object_path, last)) = function.rsplit_once('.') {
            for segment in object_path.split('.').filter(|s| !s.is_empty()) {
                target = path::child_element(&mut self.cx, &target, segment)?
                    .ok_or_else(|| ScriptError::NotFound(format!("Method {function} not found")))?;
            }
            name = last;
        }

        if kind == CallKind::Rpc {
            let prototype = self
                .cx
                .app()
                .graph()
                .prototype_name(&target)
                .unwrap_or_default();
            let allowed = self.cx.app().config().requests().allows_rpc(&prototype, name);
            if !allowed {
                return Err(ScriptError::AccessDenied(format!("{prototype}.{name}")));
            }
        }

        self.cx.skin_depth = 0;
        if !engine.has_function(Some(&target), name, false) {
            return Err(ScriptError::NotFound(format!(
                "Function {name} not defined on {target}"
            )));
        }
        let value = engine.invoke(
            &mut self.cx,
            Some(&target),
            &FunctionRef::from(name),
            &mut args,
            ArgsWrap::XmlRpc,
            false,
        )?;
        self.result = Ok(value);
        Ok(())
    }

    fn internal(
        &mut self,
        engine: &Arc<dyn ScriptingEngine>,
        this: Option<Value>,
        function: &FunctionRef,
        mut args: Vec<Value>,
    ) -> Result<(), ScriptError> {
        self.cx.skin_depth = 0;
        let value = engine.invoke(
            &mut self.cx,
            this.as_ref(),
            function,
            &mut args,
            ArgsWrap::Default,
            true,
        )?;
        self.result = Ok(value);
        Ok(())
    }
}
