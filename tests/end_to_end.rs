//! Black-box scenarios exercising a real pool and/or scheduler — no
//! mocked clock, no stubbed pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use tickforge::scheduler::ScheduleRequest;
use tickforge::{Config, CoreError, Mode, Record, Task, TickScheduler, WorkStealingPool};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

/// Scenario 1: pool size 2, 10 closures each append their index to a
/// shared log under a mutex; every index appears exactly once.
#[test]
fn scenario_simple_pool_submission() {
    init_tracing();
    let pool = WorkStealingPool::new(&Config {
        worker_count: 2,
        ..Config::default()
    })
    .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..10 {
        let log = Arc::clone(&log);
        handles.push(
            pool.submit(move || {
                log.lock().unwrap().push(i);
            })
            .unwrap(),
        );
    }
    for h in handles {
        h.join().unwrap();
    }
    let elapsed = start.elapsed();
    let mut seen = log.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    assert!(elapsed < Duration::from_secs(1));
    pool.shutdown();
}

/// Scenario 2: A at tick 1, B at tick 1 depends on A, C at tick 1
/// depends on B. Expected dispatch order A, B, C.
#[test]
fn scenario_dependency_chain() {
    init_tracing();
    let pool = WorkStealingPool::new(&Config {
        worker_count: 2,
        ..Config::default()
    })
    .unwrap();
    let scheduler = TickScheduler::new(
        pool,
        &Config {
            mode: Mode::Manual,
            ..Config::default()
        },
    )
    .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));

    let mk_completion = |order: Arc<Mutex<Vec<&'static str>>>, label: &'static str| {
        move |_task: &Task| {
            order.lock().unwrap().push(label);
        }
    };

    let a = scheduler.schedule(
        ScheduleRequest {
            target_tick: 1,
            ..Default::default()
        },
        |r| Ok(r.clone()),
    );
    scheduler
        .set_completion(&a, mk_completion(Arc::clone(&order), "A"))
        .unwrap();

    let b = scheduler.schedule(
        ScheduleRequest {
            target_tick: 1,
            ..Default::default()
        },
        |r| Ok(r.clone()),
    );
    scheduler.add_dependency(&b, &a).unwrap();
    scheduler
        .set_completion(&b, mk_completion(Arc::clone(&order), "B"))
        .unwrap();

    let c = scheduler.schedule(
        ScheduleRequest {
            target_tick: 1,
            ..Default::default()
        },
        |r| Ok(r.clone()),
    );
    scheduler.add_dependency(&c, &b).unwrap();
    scheduler
        .set_completion(&c, mk_completion(Arc::clone(&order), "C"))
        .unwrap();

    // Tick 0: nothing is ready yet (all three target tick 1).
    scheduler.trigger();
    assert_eq!(scheduler.pending_count(), 3);

    // Tick 1: A becomes ready; B and C still wait on their dependency.
    scheduler.trigger();
    assert!(wait_until(
        || *order.lock().unwrap() == vec!["A"],
        Duration::from_secs(1)
    ));

    // Further sweeps let B then C become ready once their dependency's
    // completed flag is observed.
    for _ in 0..20 {
        scheduler.trigger();
        if order.lock().unwrap().len() == 3 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
}

/// Scenario 3: retry_count=2, retry_interval=3; fails twice, succeeds with
/// 42 on the third attempt.
#[test]
fn scenario_retry_then_succeed() {
    init_tracing();
    let pool = WorkStealingPool::new(&Config {
        worker_count: 1,
        ..Config::default()
    })
    .unwrap();
    let scheduler = TickScheduler::new(
        pool,
        &Config {
            mode: Mode::Manual,
            ..Config::default()
        },
    )
    .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let final_result: Arc<Mutex<Option<Result<Record, CoreError>>>> = Arc::new(Mutex::new(None));

    let attempts_for_closure = Arc::clone(&attempts);
    let handle = scheduler.schedule(
        ScheduleRequest {
            target_tick: 0,
            retry_count: 2,
            retry_interval: 3,
            ..Default::default()
        },
        move |_r| {
            let n = attempts_for_closure.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(CoreError::UserError("not yet".to_string()))
            } else {
                let mut rec = Record::new();
                rec.insert("value", 42);
                Ok(rec)
            }
        },
    );
    let final_result_cb = Arc::clone(&final_result);
    scheduler
        .set_completion(&handle, move |task: &Task| {
            *final_result_cb.lock().unwrap() = Some(match task.result() {
                Some(r) => Ok(r.clone()),
                None => Err(task.last_error().cloned().unwrap()),
            });
        })
        .unwrap();

    // Attempt 1 at tick 0, fails, reschedules for tick 3.
    for tick in 0..12u64 {
        scheduler.trigger();
        assert_eq!(scheduler.current_tick(), tick + 1);
        if final_result.lock().unwrap().is_some() {
            break;
        }
    }

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let result = final_result.lock().unwrap().take().expect("task finished");
    let mut expected = Record::new();
    expected.insert("value", 42);
    assert_eq!(result, Ok(expected));
}

/// Scenario 4: a 50ms timeout against a 500ms sleeping closure reaches
/// Failed(TimedOut) well before the closure actually returns.
#[test]
fn scenario_timeout_reaches_failed_before_closure_returns() {
    init_tracing();
    let pool = WorkStealingPool::new(&Config {
        worker_count: 1,
        ..Config::default()
    })
    .unwrap();
    let scheduler = TickScheduler::new(
        pool,
        &Config {
            tick_length_ms: 20,
            mode: Mode::Auto,
            ..Config::default()
        },
    )
    .unwrap();

    let outcome: Arc<Mutex<Option<Result<(), CoreError>>>> = Arc::new(Mutex::new(None));
    let outcome_for_closure = Arc::clone(&outcome);

    let handle = scheduler.schedule(
        ScheduleRequest {
            target_tick: 0,
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        },
        |r| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(r.clone())
        },
    );
    scheduler
        .set_completion(&handle, move |task: &Task| {
            let mut guard = outcome_for_closure.lock().unwrap();
            if guard.is_none() {
                *guard = Some(match task.last_error() {
                    Some(e) => Err(e.clone()),
                    None => Ok(()),
                });
            }
        })
        .unwrap();

    let started = Instant::now();
    let reached = wait_until(
        || outcome.lock().unwrap().is_some(),
        Duration::from_millis(200),
    );
    assert!(reached, "task did not reach a terminal outcome in time");
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(
        outcome.lock().unwrap().take().unwrap(),
        Err(CoreError::TimedOut)
    );
}

/// Scenario 5: manual mode, four tasks at ticks {0, 0, 1, 2}. One
/// trigger dispatches both tick-0 tasks; two more triggers dispatch the
/// rest in order; final current_tick == 3.
#[test]
fn scenario_manual_mode_stepping() {
    init_tracing();
    let pool = WorkStealingPool::new(&Config {
        worker_count: 2,
        ..Config::default()
    })
    .unwrap();
    let scheduler = TickScheduler::new(
        pool,
        &Config {
            mode: Mode::Manual,
            ..Config::default()
        },
    )
    .unwrap();

    for target in [0u64, 0, 1, 2] {
        scheduler.schedule(
            ScheduleRequest {
                target_tick: target,
                ..Default::default()
            },
            |r| Ok(r.clone()),
        );
    }
    assert_eq!(scheduler.pending_count(), 4);

    assert!(scheduler.trigger());
    assert_eq!(scheduler.current_tick(), 1);
    assert_eq!(scheduler.pending_count(), 2);

    assert!(scheduler.trigger());
    assert_eq!(scheduler.current_tick(), 2);

    assert!(scheduler.trigger());
    assert_eq!(scheduler.current_tick(), 3);
    assert_eq!(scheduler.pending_count(), 0);
}

/// Scenario 6: cancelling a not-yet-dispatched task succeeds; cancelling
/// one that's already run returns false and the task still completes.
#[test]
fn scenario_cancel_pending_vs_already_dispatched() {
    init_tracing();
    let pool = WorkStealingPool::new(&Config {
        worker_count: 1,
        ..Config::default()
    })
    .unwrap();
    let scheduler = TickScheduler::new(
        pool,
        &Config {
            mode: Mode::Manual,
            ..Config::default()
        },
    )
    .unwrap();

    let x = scheduler.schedule(
        ScheduleRequest {
            target_tick: 100,
            ..Default::default()
        },
        |r| Ok(r.clone()),
    );
    assert!(x.cancel());
    assert!(x.get().is_none());

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_for_closure = Arc::clone(&ran);
    let y = scheduler.schedule(
        ScheduleRequest {
            target_tick: 0,
            ..Default::default()
        },
        move |r| {
            ran_for_closure.fetch_add(1, Ordering::SeqCst);
            Ok(r.clone())
        },
    );
    scheduler.trigger();
    assert!(!y.cancel());
    assert!(wait_until(
        || ran.load(Ordering::SeqCst) == 1,
        Duration::from_secs(1)
    ));
}

/// A dependency's failure short-circuits the dependent straight to
/// `Failed(DependencyFailed)` without ever running its own closure, and
/// without consuming its retry budget.
#[test]
fn dependency_failure_short_circuits_dependent_without_running_its_closure() {
    init_tracing();
    let pool = WorkStealingPool::new(&Config {
        worker_count: 1,
        ..Config::default()
    })
    .unwrap();
    let scheduler = TickScheduler::new(
        pool,
        &Config {
            mode: Mode::Manual,
            ..Config::default()
        },
    )
    .unwrap();

    let a = scheduler.schedule(
        ScheduleRequest {
            target_tick: 0,
            ..Default::default()
        },
        |_r| Err(CoreError::UserError("a blew up".to_string())),
    );

    let b_ran = Arc::new(AtomicUsize::new(0));
    let b_ran_for_closure = Arc::clone(&b_ran);
    let b_error: Arc<Mutex<Option<CoreError>>> = Arc::new(Mutex::new(None));
    let b_error_for_cb = Arc::clone(&b_error);

    let b = scheduler.schedule(
        ScheduleRequest {
            target_tick: 0,
            retry_count: 3,
            ..Default::default()
        },
        move |r| {
            b_ran_for_closure.fetch_add(1, Ordering::SeqCst);
            Ok(r.clone())
        },
    );
    scheduler.add_dependency(&b, &a).unwrap();
    scheduler
        .set_completion(&b, move |task: &Task| {
            *b_error_for_cb.lock().unwrap() = task.last_error().cloned();
        })
        .unwrap();

    for _ in 0..20 {
        scheduler.trigger();
        if b_error.lock().unwrap().is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(
        b_error.lock().unwrap().take(),
        Some(CoreError::DependencyFailed)
    );
    assert_eq!(
        b_ran.load(Ordering::SeqCst),
        0,
        "B's closure must never run once A failed"
    );
    assert_eq!(scheduler.pending_count(), 0);
}
