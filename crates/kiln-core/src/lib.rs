//! Server core for Kiln applications.
//!
//! Runs application code on a bounded pool of evaluator units, each pairing
//! one scripting engine with at most one worker thread:
//! - [`EvaluatorPool`] / [`EvaluatorUnit`]: acquire, hand off, wait, recycle
//! - [`RequestRouter`]: HTTP, XML-RPC, external and internal entry points,
//!   with deduplication of identical in-flight requests
//! - [`path`]: path resolution against the object graph and action dispatch
//! - [`BackgroundScheduler`] / [`CronJob`]: session expiry and cron jobs
//! - [`skin`]: the skin (template) parser and macro renderer
//! - [`Application`]: lifecycle, statistics and management
//!
//! The scripting runtime, persistence and object graph are collaborators
//! behind the traits in [`engine`]; [`memory`] implements them in memory.

pub mod app;
pub mod cron;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod exchange;
pub mod memory;
pub mod path;
pub mod pool;
pub mod prototype;
pub mod router;
pub mod scheduler;
pub mod skin;

pub use app::{AppContext, AppStatus, Application, ApplicationBuilder, Stats};
pub use cron::{CalendarField, CronJob, FieldSet, millis_to_next_full_minute};
pub use engine::{
    ArgsWrap, EngineFactory, FunctionRef, ObjectGraph, ScriptingEngine, Transaction,
    TransactionManager,
};
pub use error::{KilnError, Result, ScriptError};
pub use evaluator::{CallKind, EvaluatorUnit};
pub use exchange::{Exchange, Fingerprint, RequestTrans, Response, ResponseTrans, RpcOutcome};
pub use pool::{EvaluatorPool, PooledEvaluator};
pub use prototype::PrototypeRegistry;
pub use router::{ActiveRequestTable, RequestRouter};
pub use scheduler::{BackgroundScheduler, TickReport};
pub use skin::{Encoding, Skin, SkinRegistry};
