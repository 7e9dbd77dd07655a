//! Application entry points: pick a unit, hand it the work, wait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_types::Value;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::app::AppContext;
use crate::engine::FunctionRef;
use crate::error::{KilnError, Result};
use crate::evaluator::{CallKind, Handoff};
use crate::exchange::{Fingerprint, RequestTrans, Response, ResponseTrans};
use crate::pool::EvaluatorPool;

type Latch = Arc<Handoff<Option<Response>>>;

/// In-flight HTTP requests keyed by fingerprint.
#[derive(Debug, Clone, Default)]
pub struct ActiveRequestTable {
    entries: Arc<Mutex<HashMap<Fingerprint, Latch>>>,
}

/// Outcome of registering a request in the [`ActiveRequestTable`].
#[derive(Debug)]
pub enum Claim {
    /// First of its kind; the caller runs it and publishes the response.
    Primary(ClaimGuard),
    /// An identical request is already running; wait on its latch.
    Attached(Latch),
}

impl ActiveRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, fingerprint: Fingerprint) -> Claim {
        let mut entries = self.entries.lock();
        if let Some(latch) = entries.get(&fingerprint) {
            return Claim::Attached(Arc::clone(latch));
        }
        let latch: Latch = Arc::new(Handoff::new());
        entries.insert(fingerprint.clone(), Arc::clone(&latch));
        Claim::Primary(ClaimGuard {
            table: self.clone(),
            fingerprint,
            latch,
        })
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.lock().contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of a fingerprint. The entry is removed when the guard drops,
/// whether or not a response was published.
#[derive(Debug)]
pub struct ClaimGuard {
    table: ActiveRequestTable,
    fingerprint: Fingerprint,
    latch: Latch,
}

impl ClaimGuard {
    /// Share the response with every attached caller.
    pub fn publish(&self, response: &Response) {
        self.latch.complete(Some(response.clone()));
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut entries = self.table.entries.lock();
        if entries
            .get(&self.fingerprint)
            .is_some_and(|l| Arc::ptr_eq(l, &self.latch))
        {
            entries.remove(&self.fingerprint);
        }
        drop(entries);
        // wake attached callers if nothing was published
        self.latch.complete(None);
    }
}

/// Routes requests and calls to pooled evaluators.
pub struct RequestRouter {
    app: Arc<AppContext>,
    pool: Arc<EvaluatorPool>,
    active: ActiveRequestTable,
}

impl RequestRouter {
    pub fn new(app: Arc<AppContext>, pool: Arc<EvaluatorPool>) -> Self {
        Self {
            app,
            pool,
            active: ActiveRequestTable::new(),
        }
    }

    pub fn active_requests(&self) -> &ActiveRequestTable {
        &self.active
    }

    /// Serve an HTTP request.
    ///
    /// A request identical to one already running waits for that one's
    /// response instead of running again. Requests without a session get a
    /// new one.
    pub fn execute(&self, mut request: RequestTrans) -> Result<Response> {
        self.app.stats().record_request();

        let fingerprint = request.fingerprint();
        let session = match request.session_id() {
            Some(id) => self.app.sessions().get_or_create(id),
            None => {
                let session = self.app.sessions().create_session();
                request.set_session_id(session.id());
                session
            }
        };

        let guard = match fingerprint.map(|fp| self.active.claim(fp)) {
            Some(Claim::Attached(latch)) => {
                debug!(app = %self.app.name(), path = %request.path(), "Attaching to identical request in flight");
                let timeout = self.app.config().requests().timeout();
                if let Some(Some(response)) = latch.peek(Some(timeout)) {
                    return Ok(response);
                }
                None
            }
            Some(Claim::Primary(guard)) => Some(guard),
            None => None,
        };

        let unit = match self.pool.acquire() {
            Ok(unit) => unit,
            Err(e @ KilnError::ApplicationStopped(_)) => return Err(e),
            Err(e) => {
                self.app.stats().record_error();
                error!(app = %self.app.name(), error = %e, "Could not serve request");
                let mut response = ResponseTrans::new();
                response.report_error(self.app.name(), &e.to_string());
                return Ok(response.snapshot());
            }
        };

        let response = unit.invoke_http(request, session);
        if let Some(guard) = &guard {
            guard.publish(&response);
        }
        Ok(response)
    }

    /// Serve an XML-RPC call such as `"root.ping"`.
    pub fn invoke_rpc(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.app.stats().record_rpc();
        let timeout = self.app.config().requests().timeout();
        let unit = self.pool.acquire()?;
        unit.invoke_call(CallKind::Rpc, method, args, Some(timeout))
    }

    /// Call a function from embedding code, waiting as long as it takes.
    pub fn invoke_external(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let unit = self.pool.acquire()?;
        unit.invoke_call(CallKind::External, method, args, None)
    }

    /// Invoke `function` on `this`. A negative timeout waits indefinitely.
    pub fn invoke_internal(
        &self,
        this: Option<Value>,
        function: impl Into<FunctionRef>,
        args: Vec<Value>,
        timeout_ms: i64,
    ) -> Result<Value> {
        let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
        let unit = self.pool.acquire()?;
        unit.invoke_internal(this, function.into(), args, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(path: &str) -> Fingerprint {
        RequestTrans::get(path)
            .with_session("s")
            .fingerprint()
            .unwrap()
    }

    #[test]
    fn test_second_claim_attaches() {
        let table = ActiveRequestTable::new();
        let first = table.claim(fingerprint("/a"));
        assert!(matches!(first, Claim::Primary(_)));
        assert!(matches!(table.claim(fingerprint("/a")), Claim::Attached(_)));
        assert!(matches!(table.claim(fingerprint("/b")), Claim::Primary(_)));
    }

    #[test]
    fn test_guard_drop_removes_entry_and_wakes() {
        let table = ActiveRequestTable::new();
        let Claim::Primary(guard) = table.claim(fingerprint("/a")) else {
            panic!("expected primary");
        };
        let Claim::Attached(latch) = table.claim(fingerprint("/a")) else {
            panic!("expected attached");
        };
        drop(guard);
        assert!(table.is_empty());
        assert_eq!(latch.peek(Some(Duration::from_millis(10))), Some(None));
    }

    #[test]
    fn test_published_response_is_shared() {
        let table = ActiveRequestTable::new();
        let Claim::Primary(guard) = table.claim(fingerprint("/a")) else {
            panic!("expected primary");
        };
        let Claim::Attached(latch) = table.claim(fingerprint("/a")) else {
            panic!("expected attached");
        };
        let response = ResponseTrans::new().snapshot();
        guard.publish(&response);
        drop(guard);
        assert_eq!(latch.peek(None), Some(Some(response)));
    }
}
