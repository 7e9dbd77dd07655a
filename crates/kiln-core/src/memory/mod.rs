//! In-memory collaborators.
//!
//! A function-table scripting engine, a transient-node object graph and a
//! transaction manager that can be told to conflict. Enough to run the
//! server core without a real scripting runtime or database.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut functions = FunctionTable::new();
//! functions.define("Root", "main_action", |cx, _this, _args| {
//!     cx.write("hello");
//!     Ok(Value::Null)
//! });
//! let factory = MemoryEngineFactory::new(functions);
//! ```

mod engine;
mod functions;
mod graph;
mod transactions;

pub use engine::{MemoryEngine, MemoryEngineFactory};
pub use functions::{FunctionHandle, FunctionTable, ScriptFn};
pub use graph::MemoryGraph;
pub use transactions::{ConflictPlan, MemoryTransactions, TransactionStats};
