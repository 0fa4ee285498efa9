use std::sync::Arc;

use parking_lot::Mutex;

use coflow::{new_future, spawn, spawn_named, Channel, Dispatcher, WorkflowContext};

mod common;
use common::{new_dispatcher, TestWorkflowEnvironment};

type EventLog = Arc<Mutex<Vec<String>>>;

// A workload mixing spawns, channel traffic, a future resolution, and a
// selector race. Every observable event is appended to the log.
fn contended_workload(ctx: WorkflowContext, log: EventLog) -> impl std::future::Future<Output = ()> + Send {
    async move {
        let work = Channel::new_buffered(&ctx, 2);
        let (future, settable) = new_future(&ctx);

        for producer in 0..3 {
            spawn(&ctx, {
                let work = work.clone();
                let log = log.clone();
                move |ctx| async move {
                    for item in 0..3 {
                        let value = producer * 10 + item;
                        work.send(&ctx, &value).await;
                        log.lock().push(format!("sent {value}"));
                    }
                }
            });
        }
        spawn(&ctx, {
            let log = log.clone();
            move |_ctx| async move {
                log.lock().push("resolving".to_string());
                settable.set_value(&"done".to_string());
            }
        });

        for _ in 0..9 {
            let (value, _) = work.receive::<i32>(&ctx).await;
            log.lock().push(format!("received {}", value.unwrap()));
        }
        let resolved = future.get::<String>(&ctx).await.unwrap().unwrap();
        log.lock().push(format!("future {resolved}"));
    }
}

fn run_workload_once() -> Vec<String> {
    let env = TestWorkflowEnvironment::new();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let (dispatcher, _ctx) = new_dispatcher(env, {
        let log = log.clone();
        move |ctx| contended_workload(ctx, log)
    });
    dispatcher.execute_until_all_blocked().unwrap();
    assert!(dispatcher.is_done());
    let log = log.lock();
    log.clone()
}

// Two isomorphic dispatchers must produce identical event orderings.
#[test]
fn identical_runs_observe_identical_orderings() {
    let first = run_workload_once();
    let second = run_workload_once();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

// Coroutines get their slices in spawn order within a pass.
#[test]
fn coroutines_run_in_spawn_order() {
    let env = TestWorkflowEnvironment::new();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));

    let (dispatcher, _ctx) = new_dispatcher(env, {
        let log = log.clone();
        move |ctx| async move {
            for name in ["alpha", "beta", "gamma"] {
                spawn_named(&ctx, name, {
                    let log = log.clone();
                    move |_ctx| async move {
                        log.lock().push(name.to_string());
                    }
                });
            }
        }
    });
    dispatcher.execute_until_all_blocked().unwrap();
    assert_eq!(*log.lock(), vec!["alpha", "beta", "gamma"]);
}

// A coroutine spawned mid-pass runs before execute_until_all_blocked
// returns: quiescence requires that no new coroutine appeared.
#[test]
fn spawn_during_pass_forces_another_pass() {
    let env = TestWorkflowEnvironment::new();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));

    let (dispatcher, _ctx) = new_dispatcher(env, {
        let log = log.clone();
        move |ctx| async move {
            spawn(&ctx, {
                let log = log.clone();
                move |ctx| async move {
                    spawn(&ctx, {
                        let log = log.clone();
                        move |_ctx| async move {
                            log.lock().push("grandchild".to_string());
                        }
                    });
                    log.lock().push("child".to_string());
                }
            });
            log.lock().push("root".to_string());
        }
    });
    dispatcher.execute_until_all_blocked().unwrap();
    assert!(dispatcher.is_done());
    assert_eq!(*log.lock(), vec!["root", "child", "grandchild"]);
}

// execute_until_all_blocked returns with every survivor parked at a yield
// point, and re-running without new input is a no-op.
#[test]
fn quiescence_is_stable_without_new_input() {
    let env = TestWorkflowEnvironment::new();
    let shared_channel: Arc<Mutex<Option<Channel>>> = Arc::new(Mutex::new(None));

    let (dispatcher, _ctx) = new_dispatcher(env, {
        let shared_channel = shared_channel.clone();
        move |ctx| async move {
            let channel = Channel::new(&ctx);
            *shared_channel.lock() = Some(channel.clone());
            let (_, more) = channel.receive::<i32>(&ctx).await;
            assert!(!more);
        }
    });
    dispatcher.execute_until_all_blocked().unwrap();
    assert!(!dispatcher.is_done());
    let trace = dispatcher.stack_trace();
    assert!(trace.contains("blocked on"), "got trace: {trace}");

    // No progress possible: quiescence again, same live coroutine.
    dispatcher.execute_until_all_blocked().unwrap();
    assert!(!dispatcher.is_done());

    shared_channel.lock().clone().unwrap().close();
    dispatcher.execute_until_all_blocked().unwrap();
    assert!(dispatcher.is_done());
}

// Closing the dispatcher destroys coroutines without running them further.
#[test]
fn close_is_idempotent_and_stops_everything() {
    let env = TestWorkflowEnvironment::new();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));

    let (dispatcher, _ctx) = new_dispatcher(env, {
        let log = log.clone();
        move |ctx| async move {
            let channel = Channel::new(&ctx);
            let (_, _) = channel.receive::<i32>(&ctx).await;
            log.lock().push("never reached".to_string());
        }
    });
    dispatcher.execute_until_all_blocked().unwrap();
    dispatcher.close();
    dispatcher.close();
    assert!(log.lock().is_empty());
}

// Panic capture: the first panicking coroutine surfaces its payload from
// execute_until_all_blocked; the panicking coroutine is removed.
#[test]
fn coroutine_panic_is_captured_and_surfaced() {
    let env = TestWorkflowEnvironment::new();
    let (dispatcher, _ctx) = new_dispatcher(env, move |ctx| async move {
        spawn_named(&ctx, "bomber", |_ctx| async move {
            panic!("boom");
        });
        // Root keeps running after the sibling dies.
        let channel = Channel::new(&ctx);
        let (_, _) = channel.receive::<i32>(&ctx).await;
    });
    let err = dispatcher.execute_until_all_blocked().unwrap_err();
    assert_eq!(err.message, "boom");
    assert!(err.trace.contains("bomber"), "got trace: {}", err.trace);
}

// Deterministic replay also holds for dispatchers built directly on a root
// context rather than through the test helper.
#[test]
fn direct_dispatcher_construction_is_equivalent() {
    let env = TestWorkflowEnvironment::new();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let root_ctx =
        WorkflowContext::new_root(env as Arc<dyn coflow::WorkflowEnvironment>);
    let (dispatcher, _ctx) = Dispatcher::new(&root_ctx, {
        let log = log.clone();
        move |ctx| contended_workload(ctx, log)
    });
    dispatcher.execute_until_all_blocked().unwrap();
    assert_eq!(*log.lock(), run_workload_once());
}
