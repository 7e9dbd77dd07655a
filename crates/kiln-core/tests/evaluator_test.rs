//! Integration tests for request execution on evaluator units.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use common::{TestApp, configure, fast_config, wait_until, with_max_threads};
use kiln_core::memory::{ConflictPlan, FunctionTable, MemoryEngineFactory};
use kiln_core::{Application, RequestTrans, ScriptError};
use kiln_types::Value;

fn site() -> FunctionTable {
    let mut functions = FunctionTable::new();
    functions
        .define("Root", "main_action", |cx, _, _| {
            cx.write("home");
            Ok(Value::Null)
        })
        .define("Root", "fail_action", |_, _, _| Err(ScriptError::runtime("boom")))
        .define("Root", "save_action", |cx, _, _| {
            cx.response.set_message("saved");
            Err(cx.redirect("/done"))
        })
        .define("Root", "done_action", |cx, _, _| {
            let message = cx.response.message().unwrap_or("none").to_string();
            cx.write(&message);
            Ok(Value::Null)
        })
        .define("Root", "slow_action", |cx, _, _| {
            while !cx.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(Value::Null)
        });
    functions
}

fn with_error_actions(mut functions: FunctionTable) -> FunctionTable {
    functions
        .define("Root", "notfound_action", |cx, _, _| {
            cx.write("nope");
            Ok(Value::Null)
        })
        .define("Root", "error_action", |cx, _, _| {
            let error = cx.response.error().unwrap_or_default().to_string();
            cx.write(&format!("handled: {error}"));
            Ok(Value::Null)
        });
    functions
}

#[test]
fn test_get_runs_main_action_and_commits() {
    let test = TestApp::started(fast_config(), site());
    let response = test.app.execute(RequestTrans::get("/")).unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, "home");
    let stats = test.transactions.stats();
    assert_eq!(stats.begun(), 1);
    assert_eq!(stats.committed(), 1);
    assert_eq!(test.transactions.names(), vec!["GET:/".to_string()]);
}

#[test]
fn test_child_objects_resolve_along_the_path() {
    let mut functions = site();
    functions.define("Page", "edit_action", |cx, this, _| {
        let name = this.map(|v| v.to_string()).unwrap_or_default();
        cx.write(&format!("editing {name}"));
        Ok(Value::Null)
    });
    let test = TestApp::started(fast_config(), functions);
    let docs = test.graph.add_child(&test.root(), "docs", Some("Folder"));
    test.graph.add_child(&docs, "intro", Some("Page"));

    let response = test.app.execute(RequestTrans::get("/docs/intro/edit")).unwrap();
    assert_eq!(response.status, 200);
    assert!(response.body.starts_with("editing"), "{}", response.body);
}

#[test]
fn test_unresolved_path_runs_notfound_action() {
    let test = TestApp::started(fast_config(), with_error_actions(site()));
    let response = test.app.execute(RequestTrans::get("/missing")).unwrap();

    assert_eq!(response.status, 404);
    assert_eq!(response.body, "nope");
    assert_eq!(test.app.status().errors, 0);
}

#[test]
fn test_overlong_path_is_an_error() {
    let test = TestApp::started(fast_config(), site());
    let path = "/a".repeat(kiln_core::path::MAX_PATH_SEGMENTS + 1);
    let response = test.app.execute(RequestTrans::get(&path)).unwrap();

    assert_eq!(response.status, 500);
    assert!(response.body.contains("Path too long"), "{}", response.body);
}

#[test]
fn test_application_error_escalates_to_error_action() {
    let test = TestApp::started(fast_config(), with_error_actions(site()));
    let response = test.app.execute(RequestTrans::get("/fail")).unwrap();

    assert_eq!(response.status, 500);
    assert_eq!(response.body, "handled: boom");
    assert_eq!(test.app.status().errors, 1);
    // the failed pass is rolled back, the error pass commits
    let stats = test.transactions.stats();
    assert_eq!(stats.aborted(), 1);
    assert_eq!(stats.committed(), 1);
    assert_eq!(test.transactions.names()[1], "error:GET:/fail");
}

#[test]
fn test_error_without_error_action_renders_minimal_page() {
    let test = TestApp::started(fast_config(), site());
    let response = test.app.execute(RequestTrans::get("/fail")).unwrap();

    assert_eq!(response.status, 500);
    assert!(response.body.contains("Error in application test"));
    assert!(response.body.contains("boom"));
}

#[test]
fn test_failing_error_action_falls_back_to_original_cause() {
    let mut functions = site();
    functions.define("Root", "error_action", |_, _, _| {
        Err(ScriptError::runtime("error handler broke"))
    });
    let test = TestApp::started(fast_config(), functions);
    let response = test.app.execute(RequestTrans::get("/fail")).unwrap();

    assert_eq!(response.status, 500);
    assert!(response.body.contains("boom"));
    assert!(!response.body.contains("error handler broke"));
}

#[test]
fn test_redirect_carries_message_to_next_request() {
    let test = TestApp::started(fast_config(), site());

    let response = test
        .app
        .execute(RequestTrans::post("/save").with_session("visitor"))
        .unwrap();
    assert_eq!(response.redirect.as_deref(), Some("/done"));
    assert_eq!(test.transactions.stats().committed(), 1);

    let response = test
        .app
        .execute(RequestTrans::get("/done").with_session("visitor"))
        .unwrap();
    assert_eq!(response.body, "saved");

    // consumed by the request that displayed it
    let response = test
        .app
        .execute(RequestTrans::get("/done").with_session("visitor"))
        .unwrap();
    assert_eq!(response.body, "none");
}

#[test]
fn test_conflicts_retry_eight_times_then_give_up() {
    let test = TestApp::started(fast_config(), site());
    test.transactions.set_conflict_plan(ConflictPlan::Always);

    let response = test.app.execute(RequestTrans::get("/")).unwrap();

    assert_eq!(response.status, 500);
    assert!(
        response
            .body
            .contains("Couldn't complete transaction due to heavy object traffic")
    );
    assert_eq!(test.transactions.stats().conflicts(), 8);
    let engine = &test.factory.engines()[0];
    let runs = engine.calls().iter().filter(|c| *c == "main_action").count();
    assert_eq!(runs, 8);
}

#[test]
fn test_conflict_retry_succeeds_when_contention_clears() {
    let test = TestApp::started(fast_config(), site());
    test.transactions.set_conflict_plan(ConflictPlan::Next(2));

    let response = test.app.execute(RequestTrans::get("/")).unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, "home");
    let stats = test.transactions.stats();
    assert_eq!(stats.conflicts(), 2);
    assert_eq!(stats.committed(), 1);
}

#[test]
fn test_timeout_frees_the_unit() {
    let config = configure(|config| {
        if let Some(evaluators) = config.evaluators.as_mut() {
            evaluators.max_threads = 1;
        }
        if let Some(requests) = config.requests.as_mut() {
            requests.timeout_ms = 200;
        }
    });
    let test = TestApp::started(config, site());

    let started = Instant::now();
    let response = test.app.execute(RequestTrans::get("/slow")).unwrap();
    let waited = started.elapsed();

    assert_eq!(response.status, 500);
    assert!(response.body.contains("Request timed out"));
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_secs(2));
    assert!(test.transactions.stats().killed() >= 1);

    let response = test.app.execute(RequestTrans::get("/")).unwrap();
    assert_eq!(response.body, "home");
    assert_eq!(test.app.pool().total_count(), 1);
}

#[test]
fn test_hung_handler_does_not_wedge_the_pool() {
    let released = Arc::new(AtomicBool::new(false));
    let mut functions = site();
    {
        let released = Arc::clone(&released);
        functions.define("Root", "hang_action", move |_, _, _| {
            // ignores cancellation on purpose
            while !released.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(10));
            }
            Ok(Value::Null)
        });
    }
    let config = configure(|config| {
        if let Some(evaluators) = config.evaluators.as_mut() {
            evaluators.max_threads = 1;
        }
        if let Some(requests) = config.requests.as_mut() {
            requests.timeout_ms = 200;
        }
    });
    let test = TestApp::started(config, functions);

    let response = test.app.execute(RequestTrans::get("/hang")).unwrap();
    assert_eq!(response.status, 500);
    assert!(response.body.contains("Request timed out"));

    for _ in 0..3 {
        let response = test.app.execute(RequestTrans::get("/")).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "home");
    }
    assert_eq!(test.app.pool().total_count(), 1);

    // the stuck engine was replaced, never shared
    let engines = test.factory.engines();
    assert_eq!(engines.len(), 2);
    assert_eq!(test.factory.total_overlaps(), 0);
    assert!(!engines[0].is_shut_down());

    released.store(true, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(2), || engines[0].is_shut_down()));
    assert!(!engines[1].is_shut_down());
}

#[test]
fn test_engine_is_never_entered_by_two_threads() {
    let mut functions = FunctionTable::new();
    functions.define("Root", "main_action", |cx, _, _| {
        thread::sleep(Duration::from_millis(2));
        cx.write("ok");
        Ok(Value::Null)
    });
    let test = Arc::new(TestApp::started(with_max_threads(3), functions));

    let callers: Vec<_> = (0..6)
        .map(|i| {
            let test = Arc::clone(&test);
            thread::spawn(move || {
                for j in 0..10 {
                    let request = RequestTrans::get("/").with_param("n", format!("{i}-{j}"));
                    test.app.execute(request).unwrap();
                }
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }

    assert!(test.app.pool().total_count() <= 3);
    assert_eq!(test.factory.total_overlaps(), 0);
}

#[test]
fn test_engine_init_failure_is_reported() {
    let factory = Arc::new(MemoryEngineFactory::new(site()).with_init_failure("no runtime"));
    let app = Application::builder(fast_config())
        .with_engine_factory(factory)
        .build()
        .unwrap();
    app.start().unwrap();

    let response = app.execute(RequestTrans::get("/")).unwrap();
    assert_eq!(response.status, 500);
    assert!(response.body.contains("no runtime"));
}
