//! Integration tests for the application facade.

mod common;

use common::{TestApp, configure, fast_config, with_max_threads};
use kiln_core::memory::FunctionTable;
use kiln_core::{KilnError, RequestTrans};
use kiln_types::{TransientNode, Value};
use tempfile::TempDir;

fn site() -> FunctionTable {
    let mut functions = FunctionTable::new();
    functions.define("Root", "main_action", |cx, _, _| {
        cx.write("home");
        Ok(Value::Null)
    });
    functions
}

#[test]
fn test_status_counts_requests_and_units() {
    let test = TestApp::started(fast_config(), site());
    test.app
        .execute(RequestTrans::get("/").with_session("a"))
        .unwrap();
    test.app
        .execute(RequestTrans::get("/").with_session("b"))
        .unwrap();

    let status = test.app.status();
    assert!(status.running);
    assert!(status.started_at.is_some());
    assert_eq!(status.requests, 2);
    assert_eq!(status.errors, 0);
    assert_eq!(status.sessions, 2);
    assert_eq!(status.max_evaluators, 4);
    assert_eq!(status.active_evaluators, 0);
    assert_eq!(status.free_evaluators, status.total_evaluators);
    assert!(status.last_code_update.is_none());
}

#[test]
fn test_update_config_resizes_pool() {
    let test = TestApp::started(fast_config(), site());

    test.app.update_config(with_max_threads(6)).unwrap();
    assert_eq!(test.app.pool().max(), 6);
    assert_eq!(test.app.context().config().evaluators().max_threads, 6);

    let err = test.app.update_config(with_max_threads(0)).unwrap_err();
    assert!(matches!(err, KilnError::Config(_)), "{err}");
    assert_eq!(test.app.context().config().evaluators().max_threads, 6);
}

#[test]
fn test_code_change_reaches_initialized_engines() {
    let test = TestApp::started(fast_config(), site());
    test.app.execute(RequestTrans::get("/")).unwrap();

    test.app.code_changed("Root/actions", "function main_action() {}");

    assert!(test.app.status().last_code_update.is_some());
    let engines = test.factory.engines();
    assert_eq!(engines.len(), 1);
    assert_eq!(engines[0].injected_resources(), vec!["Root/actions".to_string()]);
}

#[test]
fn test_sessions_survive_store_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.json");

    let first = TestApp::started(fast_config(), site());
    let session = first.app.context().sessions().get_or_create("visitor");
    session
        .cache_node()
        .downcast_ref::<TransientNode>()
        .unwrap()
        .set("cart", 3i64);
    session.login_as("ada", TransientNode::new("ada").with_prototype("User").into_ref());
    assert_eq!(first.app.store_sessions(&path).unwrap(), 1);

    let second = TestApp::started(fast_config(), site());
    assert_eq!(second.app.load_sessions(&path).unwrap(), 1);

    let restored = second.app.context().sessions().get("visitor").unwrap();
    let cache = restored.cache_node().downcast_ref::<TransientNode>().unwrap();
    assert_eq!(cache.get("cart"), Some(Value::Int(3)));
    assert!(!restored.is_logged_in());
}

#[test]
fn test_loading_missing_session_file_is_empty() {
    let dir = TempDir::new().unwrap();
    let test = TestApp::new(fast_config(), site());
    let loaded = test.app.load_sessions(&dir.path().join("none.json")).unwrap();
    assert_eq!(loaded, 0);
}

#[test]
fn test_stopped_application_rejects_requests() {
    let config = configure(|config| config.name = Some("closed".to_string()));
    let test = TestApp::new(config, site());
    assert_eq!(test.app.name(), "closed");

    let err = test.app.execute(RequestTrans::get("/")).unwrap_err();
    assert!(matches!(err, KilnError::ApplicationStopped(_)), "{err}");
}
