//! Integration tests for the evaluator pool.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use common::{TestApp, configure, fast_config, with_max_threads};
use kiln_core::KilnError;
use kiln_core::memory::FunctionTable;
use kiln_types::Value;

#[test]
fn test_acquire_requires_running_application() {
    let test = TestApp::new(fast_config(), FunctionTable::new());
    let err = test.app.pool().acquire().unwrap_err();
    assert!(matches!(err, KilnError::ApplicationStopped(_)));
}

#[test]
fn test_released_units_are_reused_last_in_first_out() {
    let test = TestApp::started(fast_config(), FunctionTable::new());
    let pool = test.app.pool();

    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    let (first_id, second_id) = (first.id(), second.id());
    assert_ne!(first_id, second_id);

    drop(first);
    drop(second);

    assert_eq!(pool.acquire().unwrap().id(), second_id);
    // the previous loan went straight back, so the same unit comes out again
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    assert_eq!(a.id(), second_id);
    assert_eq!(b.id(), first_id);
}

#[test]
fn test_pool_never_exceeds_maximum() {
    let config = configure(|config| {
        if let Some(evaluators) = config.evaluators.as_mut() {
            evaluators.max_threads = 2;
            evaluators.acquire_attempts = 1;
            evaluators.acquire_retry_interval_ms = 20;
        }
    });
    let test = TestApp::started(config, FunctionTable::new());
    let pool = test.app.pool();

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    let err = pool.acquire().unwrap_err();
    assert!(matches!(err, KilnError::ResourceExhausted(_)));
    assert_eq!(pool.total_count(), 2);
    assert_eq!(pool.active_count(), 2);

    drop(a);
    drop(b);
    assert_eq!(pool.free_count(), 2);
    assert_eq!(pool.total_count(), 2);
}

#[test]
fn test_third_acquire_waits_for_release() {
    let config = configure(|config| {
        if let Some(evaluators) = config.evaluators.as_mut() {
            evaluators.max_threads = 2;
            evaluators.acquire_attempts = 4;
            evaluators.acquire_retry_interval_ms = 1000;
        }
    });
    let test = TestApp::started(config, FunctionTable::new());
    let pool = Arc::clone(test.app.pool());

    let a = pool.acquire().unwrap();
    let _b = pool.acquire().unwrap();
    let a_id = a.id();

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let pool = Arc::clone(&pool);
        let acquired = Arc::clone(&acquired);
        thread::spawn(move || {
            let unit = pool.acquire().unwrap();
            acquired.store(true, Ordering::SeqCst);
            unit.id()
        })
    };

    thread::sleep(Duration::from_millis(150));
    assert!(!acquired.load(Ordering::SeqCst), "third acquire must block at capacity");
    assert_eq!(pool.total_count(), 2);

    drop(a);
    let id = waiter.join().unwrap();
    assert_eq!(id, a_id);
    assert_eq!(pool.total_count(), 2);
}

#[test]
fn test_resize_bounds() {
    let test = TestApp::started(fast_config(), FunctionTable::new());
    let pool = test.app.pool();

    assert!(matches!(pool.resize(1), Err(KilnError::InvalidPoolSize(1))));
    assert!(matches!(pool.resize(512), Err(KilnError::InvalidPoolSize(512))));

    assert!(pool.resize(6).unwrap());
    assert_eq!(pool.max(), 6);
    assert_eq!(pool.total_count(), 6);
    assert_eq!(pool.free_count(), 6);
}

#[test]
fn test_shrink_is_partial_when_units_are_busy() {
    let test = TestApp::started(fast_config(), FunctionTable::new());
    let pool = test.app.pool();
    assert!(pool.resize(6).unwrap());

    let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
    assert!(!pool.resize(2).unwrap());
    assert_eq!(pool.total_count(), 3);
    assert_eq!(pool.max(), 6);

    drop(held);
    assert!(pool.resize(2).unwrap());
    assert_eq!(pool.total_count(), 2);
    assert_eq!(pool.max(), 2);
}

#[test]
fn test_units_removed_by_shrink_are_shut_down() {
    let test = TestApp::started(with_max_threads(2), FunctionTable::new());
    let pool = test.app.pool();
    assert!(pool.resize(3).unwrap());

    let units = pool.units();
    assert!(pool.resize(2).unwrap());
    let retired = units.iter().filter(|u| u.is_retired()).count();
    assert_eq!(retired, 1);
}

#[test]
fn test_start_preallocates_and_runs_hooks() {
    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));
    let mut functions = FunctionTable::new();
    {
        let started = Arc::clone(&started);
        functions.define_global("onStart", move |_, _, _| {
            started.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
    }
    {
        let stopped = Arc::clone(&stopped);
        functions.define_global("onStop", move |_, _, _| {
            stopped.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
    }
    let config = configure(|config| {
        if let Some(evaluators) = config.evaluators.as_mut() {
            evaluators.min_threads = 3;
        }
    });

    let test = TestApp::started(config, functions);
    assert_eq!(test.app.pool().total_count(), 3);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    // only the warmed-up unit has an engine, and onStart ran on it
    assert_eq!(test.factory.engines().len(), 1);

    test.app.stop();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert_eq!(test.app.pool().total_count(), 0);
    assert!(test.factory.engines().iter().all(|e| e.is_shut_down()));
}
