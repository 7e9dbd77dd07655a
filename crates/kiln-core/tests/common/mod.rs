//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_config::AppConfig;
use kiln_core::memory::{FunctionTable, MemoryEngineFactory, MemoryGraph, MemoryTransactions};
use kiln_core::{Application, EngineFactory, Exchange, ScriptingEngine};
use kiln_types::{ObjectRef, ParamMap, Value};

/// Settings with short waits so timing tests finish quickly.
pub const FAST_CONFIG: &str = r#"
name = "test"

[evaluators]
max_threads = 4
acquire_attempts = 2
acquire_retry_interval_ms = 50
idle_timeout_ms = 2000

[requests]
timeout_ms = 2000
internal_timeout_ms = 2000
conflict_backoff_ms = 1
xmlrpc_access = ["root.ping"]

[scheduler]
enabled = false
"#;

pub fn fast_config() -> AppConfig {
    AppConfig::from_toml(FAST_CONFIG).unwrap()
}

/// Fast settings, adjusted by `f`.
pub fn configure(f: impl FnOnce(&mut AppConfig)) -> AppConfig {
    let mut config = fast_config();
    f(&mut config);
    config
}

/// Fast settings with at most `max` evaluators.
pub fn with_max_threads(max: usize) -> AppConfig {
    configure(|config| {
        if let Some(evaluators) = config.evaluators.as_mut() {
            evaluators.max_threads = max;
        }
    })
}

/// An application over the in-memory collaborators, with handles on them.
pub struct TestApp {
    pub app: Application,
    pub factory: Arc<MemoryEngineFactory>,
    pub graph: Arc<MemoryGraph>,
    pub transactions: Arc<MemoryTransactions>,
}

impl TestApp {
    pub fn new(config: AppConfig, functions: FunctionTable) -> Self {
        Self::with_skins(config, functions, &[])
    }

    /// Build with skins given as `(prototype, name, source)`.
    pub fn with_skins(config: AppConfig, functions: FunctionTable, skins: &[(&str, &str, &str)]) -> Self {
        let factory = Arc::new(MemoryEngineFactory::new(functions));
        let graph = Arc::new(MemoryGraph::with_root());
        let transactions = Arc::new(MemoryTransactions::new());

        let mut builder = Application::builder(config)
            .with_engine_factory(factory.clone())
            .with_graph(graph.clone())
            .with_transactions(transactions.clone());
        for (prototype, name, source) in skins {
            builder = builder.with_skin(*prototype, *name, *source);
        }
        let app = builder.build().unwrap();
        Self {
            app,
            factory,
            graph,
            transactions,
        }
    }

    /// Build and start.
    pub fn started(config: AppConfig, functions: FunctionTable) -> Self {
        let test = Self::new(config, functions);
        test.app.start().unwrap();
        test
    }

    pub fn root(&self) -> ObjectRef {
        self.graph.root().clone()
    }

    /// An exchange outside the pool, on a fresh engine.
    pub fn exchange(&self) -> Exchange {
        let engine = self.factory.create();
        engine.init(self.app.context(), 0).unwrap();
        Exchange::standalone(self.app.context().clone(), engine)
    }

    /// Render a skin looked up by name and return the output.
    pub fn render(&self, name: &str, this: Option<&Value>, param: Option<ParamMap>) -> String {
        let mut cx = self.exchange();
        cx.render_skin_as_string(name, this, param).unwrap()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
