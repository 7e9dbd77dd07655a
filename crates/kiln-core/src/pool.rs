//! The evaluator pool.

use std::ops::Deref;
use std::sync::Arc;

use kiln_config::{MAX_POOL_SIZE, MIN_POOL_SIZE};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::app::AppContext;
use crate::error::{KilnError, Result};
use crate::evaluator::EvaluatorUnit;

struct PoolState {
    /// Idle units, most recently released last.
    free: Vec<Arc<EvaluatorUnit>>,
    all: Vec<Arc<EvaluatorUnit>>,
    max: usize,
    next_id: usize,
}

/// Bounded set of evaluator units, grown on demand.
///
/// Idle units are reused last-in first-out so warm engines are preferred.
pub struct EvaluatorPool {
    app: Arc<AppContext>,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl EvaluatorPool {
    pub fn new(app: Arc<AppContext>) -> Self {
        let max = app.config().evaluators().max_threads;
        Self {
            app,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                all: Vec::new(),
                max,
                next_id: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Take an idle unit, creating one if below the maximum.
    ///
    /// At capacity, waits up to `acquire_attempts` times for a release
    /// before giving up with [`KilnError::ResourceExhausted`].
    pub fn acquire(self: &Arc<Self>) -> Result<PooledEvaluator> {
        let (max_attempts, retry_interval) = {
            let config = self.app.config();
            let evaluators = config.evaluators();
            (evaluators.acquire_attempts, evaluators.acquire_retry_interval())
        };
        let mut state = self.state.lock();
        let mut attempts = 0;
        loop {
            if !self.app.is_running() {
                return Err(KilnError::ApplicationStopped(self.app.name().to_string()));
            }
            if let Some(unit) = state.free.pop() {
                return Ok(PooledEvaluator::new(Arc::clone(self), unit));
            }
            if state.all.len() < state.max {
                let unit = self.create_unit(&mut state);
                info!(
                    app = %self.app.name(),
                    unit = unit.id(),
                    total = state.all.len(),
                    "Created evaluator"
                );
                return Ok(PooledEvaluator::new(Arc::clone(self), unit));
            }
            if attempts >= max_attempts {
                break;
            }
            attempts += 1;
            self.released.wait_for(&mut state, retry_interval);
        }
        warn!(app = %self.app.name(), max = state.max, "No free evaluators");
        Err(KilnError::ResourceExhausted(self.app.name().to_string()))
    }

    /// Return a unit to the free list. Units that were removed from the pool
    /// in the meantime are dropped instead, and retired units give up their
    /// slot so a fresh unit can be created in their place.
    pub fn release(&self, unit: Option<Arc<EvaluatorUnit>>) {
        let Some(unit) = unit else { return };
        unit.recycle();
        let mut state = self.state.lock();
        let Some(index) = state.all.iter().position(|u| Arc::ptr_eq(u, &unit)) else {
            return;
        };
        if unit.is_retired() {
            state.all.remove(index);
            debug!(app = %self.app.name(), unit = unit.id(), total = state.all.len(), "Dropped retired evaluator");
        } else {
            state.free.push(unit);
        }
        self.released.notify_one();
    }

    /// Change the maximum number of units.
    ///
    /// Growing creates idle units right away. Shrinking removes idle units
    /// one at a time and returns `Ok(false)` if too few were idle; units
    /// removed up to that point stay removed.
    pub fn resize(&self, size: usize) -> Result<bool> {
        if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&size) {
            return Err(KilnError::InvalidPoolSize(size));
        }
        let mut removed = Vec::new();
        let complete = {
            let mut state = self.state.lock();
            let current = state.all.len();
            let mut complete = true;
            if size > current {
                for _ in current..size {
                    let unit = self.create_unit(&mut state);
                    state.free.push(unit);
                }
                self.released.notify_all();
            } else {
                for _ in size..current {
                    let Some(unit) = state.free.pop() else {
                        complete = false;
                        break;
                    };
                    state.all.retain(|u| !Arc::ptr_eq(u, &unit));
                    removed.push(unit);
                }
            }
            if complete {
                state.max = size;
            }
            complete
        };
        for unit in removed {
            unit.shutdown();
        }
        info!(app = %self.app.name(), size, complete, "Resized evaluator pool");
        Ok(complete)
    }

    /// Create up to `count` idle units and warm up the first one's engine.
    pub fn preallocate(&self, count: usize) {
        let first = {
            let mut state = self.state.lock();
            let target = count.min(state.max);
            while state.all.len() < target {
                let unit = self.create_unit(&mut state);
                state.free.push(unit);
            }
            state.free.last().cloned()
        };
        if let Some(unit) = first
            && let Err(e) = unit.ensure_engine()
        {
            warn!(app = %self.app.name(), error = %e, "Failed to initialize scripting engine");
        }
    }

    /// Shut down every unit and empty the pool.
    pub fn stop_all(&self) {
        let units = {
            let mut state = self.state.lock();
            state.free.clear();
            std::mem::take(&mut state.all)
        };
        self.released.notify_all();
        for unit in &units {
            unit.shutdown();
        }
        debug!(app = %self.app.name(), count = units.len(), "Stopped all evaluators");
    }

    fn create_unit(&self, state: &mut PoolState) -> Arc<EvaluatorUnit> {
        let unit = Arc::new(EvaluatorUnit::new(state.next_id, Arc::clone(&self.app)));
        state.next_id += 1;
        state.all.push(Arc::clone(&unit));
        unit
    }

    pub fn units(&self) -> Vec<Arc<EvaluatorUnit>> {
        self.state.lock().all.clone()
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn total_count(&self) -> usize {
        self.state.lock().all.len()
    }

    /// Units currently handed out.
    pub fn active_count(&self) -> usize {
        let state = self.state.lock();
        state.all.len() - state.free.len()
    }

    pub fn max(&self) -> usize {
        self.state.lock().max
    }
}

/// A unit on loan from the pool, returned when dropped.
pub struct PooledEvaluator {
    pool: Arc<EvaluatorPool>,
    unit: Arc<EvaluatorUnit>,
}

impl PooledEvaluator {
    fn new(pool: Arc<EvaluatorPool>, unit: Arc<EvaluatorUnit>) -> Self {
        Self { pool, unit }
    }

    pub fn unit(&self) -> &Arc<EvaluatorUnit> {
        &self.unit
    }
}

impl Deref for PooledEvaluator {
    type Target = Arc<EvaluatorUnit>;

    fn deref(&self) -> &Self::Target {
        &self.unit
    }
}

impl Drop for PooledEvaluator {
    fn drop(&mut self) {
        self.pool.release(Some(Arc::clone(&self.unit)));
    }
}

impl std::fmt::Debug for PooledEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledEvaluator").field(&self.unit).finish()
    }
}
