//! Transactions that only keep score.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::{Transaction, TransactionManager};
use crate::error::ScriptError;

/// When commits should fail with a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPlan {
    #[default]
    Never,
    /// The next `n` commits conflict, later ones succeed.
    Next(u32),
    Always,
}

/// Counters over every transaction a manager has handed out.
#[derive(Debug, Default)]
pub struct TransactionStats {
    begun: AtomicUsize,
    committed: AtomicUsize,
    aborted: AtomicUsize,
    killed: AtomicUsize,
    closed: AtomicUsize,
    conflicts: AtomicUsize,
}

impl TransactionStats {
    pub fn begun(&self) -> usize {
        self.begun.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }
}

/// Transaction manager with no storage behind it.
#[derive(Debug, Default)]
pub struct MemoryTransactions {
    stats: Arc<TransactionStats>,
    plan: Arc<Mutex<ConflictPlan>>,
    names: Mutex<Vec<String>>,
}

impl MemoryTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_conflict_plan(&self, plan: ConflictPlan) {
        *self.plan.lock() = plan;
    }

    pub fn stats(&self) -> Arc<TransactionStats> {
        Arc::clone(&self.stats)
    }

    /// Names of all transactions begun, in order.
    pub fn names(&self) -> Vec<String> {
        self.names.lock().clone()
    }
}

impl TransactionManager for MemoryTransactions {
    fn begin(&self, name: &str) -> Arc<dyn Transaction> {
        self.stats.begun.fetch_add(1, Ordering::SeqCst);
        self.names.lock().push(name.to_string());
        Arc::new(MemoryTransaction {
            name: name.to_string(),
            state: Mutex::new(TxState::Active),
            stats: Arc::clone(&self.stats),
            plan: Arc::clone(&self.plan),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    Aborted,
}

struct MemoryTransaction {
    name: String,
    state: Mutex<TxState>,
    stats: Arc<TransactionStats>,
    plan: Arc<Mutex<ConflictPlan>>,
}

impl MemoryTransaction {
    fn should_conflict(&self) -> bool {
        let mut plan = self.plan.lock();
        match *plan {
            ConflictPlan::Never => false,
            ConflictPlan::Always => true,
            ConflictPlan::Next(0) => {
                *plan = ConflictPlan::Never;
                false
            }
            ConflictPlan::Next(n) => {
                *plan = if n == 1 {
                    ConflictPlan::Never
                } else {
                    ConflictPlan::Next(n - 1)
                };
                true
            }
        }
    }
}

impl Transaction for MemoryTransaction {
    fn name(&self) -> &str {
        &self.name
    }

    fn commit(&self) -> Result<(), ScriptError> {
        let mut state = self.state.lock();
        if *state != TxState::Active {
            return Err(ScriptError::runtime(format!(
                "Transaction {} is no longer active",
                self.name
            )));
        }
        if self.should_conflict() {
            self.stats.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(ScriptError::Conflict(self.name.clone()));
        }
        *state = TxState::Committed;
        self.stats.committed.fetch_add(1, Ordering::SeqCst);
        debug!(txn = %self.name, "Committed");
        Ok(())
    }

    fn abort(&self) {
        let mut state = self.state.lock();
        if *state == TxState::Active {
            *state = TxState::Aborted;
            self.stats.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn kill(&self) {
        *self.state.lock() = TxState::Aborted;
        self.stats.killed.fetch_add(1, Ordering::SeqCst);
    }

    fn close_connections(&self) {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        *self.state.lock() == TxState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_abort_counts() {
        let manager = MemoryTransactions::new();
        let a = manager.begin("GET:/");
        a.commit().unwrap();
        assert!(!a.is_active());

        let b = manager.begin("GET:/x");
        b.abort();
        b.abort();
        assert!(b.commit().is_err());

        let stats = manager.stats();
        assert_eq!(stats.begun(), 2);
        assert_eq!(stats.committed(), 1);
        assert_eq!(stats.aborted(), 1);
        assert_eq!(manager.names(), ["GET:/", "GET:/x"]);
    }

    #[test]
    fn test_conflict_plan_next() {
        let manager = MemoryTransactions::new();
        manager.set_conflict_plan(ConflictPlan::Next(2));

        assert!(matches!(manager.begin("t").commit(), Err(ScriptError::Conflict(_))));
        assert!(matches!(manager.begin("t").commit(), Err(ScriptError::Conflict(_))));
        assert!(manager.begin("t").commit().is_ok());
        assert_eq!(manager.stats().conflicts(), 2);
    }

    #[test]
    fn test_kill_deactivates() {
        let manager = MemoryTransactions::new();
        let txn = manager.begin("t");
        txn.kill();
        txn.close_connections();
        assert!(!txn.is_active());
        assert_eq!(manager.stats().killed(), 1);
        assert_eq!(manager.stats().closed(), 1);
    }
}
