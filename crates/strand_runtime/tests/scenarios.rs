//! End-to-end process scenarios against a live office.

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use strand_core::Timeout;
use strand_plan::{AdministrationTemplate, FunctionTemplate, OfficeGraph, PoolTemplate, ResourceTemplate, Scope, TeamTemplate};
use strand_runtime::{
    AsynchronousFlow, ConstructSource, ContainerOperation, Failure, FlowOptions, FlowOutcome, ManualClock, Office,
    ProcessOptions, SourceCompletion, Sourcing, UnitKind,
};

const WAIT: Duration = Duration::from_secs(10);

fn counting_source(counter: &Arc<AtomicUsize>) -> impl Fn(strand_runtime::SourceRequest) -> Result<Sourcing, Failure> + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move |_req| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        Ok(Sourcing::Ready(Arc::new(n)))
    }
}

// ---- sequencing ----

#[test]
fn test_sequential_chain_passes_values() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("parse").then("double"))
        .function(FunctionTemplate::new("double"))
        .build()
        .unwrap();
    let office = Office::builder(graph)
        .function("parse", |ctx| {
            let text: String = ctx.parameter_as()?;
            text.parse::<i64>()
                .map(Value::from)
                .map_err(|e| Failure::raise("app.parse", e.to_string()))
        })
        .function("double", |ctx| Ok(json!(ctx.parameter().as_i64().unwrap_or(0) * 2)))
        .build()
        .unwrap();

    let handle = office.submit("parse", json!("21")).unwrap();
    let outcome = handle.wait();
    assert_eq!(outcome.result, Ok(json!(42)));
    assert_eq!(handle.snapshot().units, 0);
    assert!(handle.snapshot().released);
}

#[test]
fn test_explicit_next_overrides_template() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("route").then("fallback"))
        .function(FunctionTemplate::new("fallback"))
        .function(FunctionTemplate::new("chosen"))
        .build()
        .unwrap();
    let office = Office::builder(graph)
        .function("route", |ctx| {
            ctx.next("fallback", json!("ignored"))?;
            ctx.next("chosen", json!({"via": "route"}))?;
            Ok(Value::Null)
        })
        .function("fallback", |_| Ok(json!("fallback")))
        .function("chosen", |ctx| Ok(ctx.parameter()["via"].clone()))
        .build()
        .unwrap();

    let outcome = office.submit("route", Value::Null).unwrap().wait();
    assert_eq!(outcome.result, Ok(json!("route")));
}

#[test]
fn test_next_to_unknown_function_is_a_failure() {
    let graph = OfficeGraph::builder().function(FunctionTemplate::new("a")).build().unwrap();
    let office = Office::builder(graph)
        .function("a", |ctx| {
            ctx.next("missing", Value::Null)?;
            Ok(Value::Null)
        })
        .build()
        .unwrap();

    let outcome = office.submit("a", Value::Null).unwrap().wait();
    let failure = outcome.failure().unwrap().root_cause();
    assert_eq!(failure.class().as_str(), "strand.function.unknown");
}

#[test]
fn test_parallel_units_complete_flow_once() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("fan"))
        .function(FunctionTemplate::new("leaf"))
        .build()
        .unwrap();
    let leaves = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&leaves);
    let office = Office::builder(graph)
        .function("fan", |ctx| {
            for i in 0..5 {
                ctx.parallel("leaf", json!(i))?;
            }
            Ok(json!("fanned"))
        })
        .function("leaf", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
        .build()
        .unwrap();

    let callbacks = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&callbacks);
    let handle = office
        .submit_with(
            "fan",
            Value::Null,
            ProcessOptions::new().on_complete(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    assert_eq!(handle.wait().result, Ok(json!("fanned")));
    assert_eq!(leaves.load(Ordering::SeqCst), 5);
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
}

// ---- flows and threads ----

#[test]
fn test_blocking_flow_suspends_parent() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("parent").then("after"))
        .function(FunctionTemplate::new("child"))
        .function(FunctionTemplate::new("after"))
        .build()
        .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let (l1, l2, l3) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
    let office = Office::builder(graph)
        .function("parent", move |ctx| {
            let l = Arc::clone(&l1);
            ctx.spawn_flow(
                "child",
                json!(7),
                FlowOptions::new().blocking().on_complete(move |outcome| {
                    let value = outcome.map(|v| v.to_string()).unwrap_or_default();
                    l.lock().push(format!("callback {}", value));
                }),
            )?;
            l1.lock().push("parent".to_string());
            Ok(json!("from parent"))
        })
        .function("child", move |ctx| {
            l2.lock().push("child".to_string());
            Ok(json!(ctx.parameter().as_i64().unwrap_or(0) + 1))
        })
        .function("after", move |ctx| {
            l3.lock().push("after".to_string());
            Ok(ctx.parameter().clone())
        })
        .build()
        .unwrap();

    let outcome = office.submit("parent", Value::Null).unwrap().wait();
    assert_eq!(outcome.result, Ok(json!("from parent")));
    assert_eq!(
        *log.lock(),
        vec![
            "parent".to_string(),
            "child".to_string(),
            "callback 8".to_string(),
            "after".to_string()
        ]
    );
}

#[test]
fn test_non_blocking_flow_does_not_hold_parent_but_holds_process() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("main"))
        .function(FunctionTemplate::new("side").depends_on("gate"))
        .resource(ResourceTemplate::new("gate").asynchronous().with_scope(Scope::Unit))
        .build()
        .unwrap();
    let gate: Arc<Mutex<Option<SourceCompletion>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&gate);
    let flow_result = Arc::new(Mutex::new(None));
    let recorded = Arc::clone(&flow_result);

    let office = Office::builder(graph)
        .function("main", move |ctx| {
            let r = Arc::clone(&recorded);
            ctx.spawn_flow(
                "side",
                Value::Null,
                FlowOptions::new().on_complete(move |outcome| *r.lock() = Some(outcome)),
            )?;
            Ok(json!("main done"))
        })
        .function("side", |_| Ok(json!("side done")))
        .source_fn("gate", move |req| {
            *slot.lock() = Some(req.completion);
            Ok(Sourcing::Pending)
        })
        .build()
        .unwrap();

    let handle = office.submit("main", Value::Null).unwrap();
    assert!(!handle.is_released());
    assert!(flow_result.lock().is_none());

    let completion = gate.lock().take().unwrap();
    completion.provide(Arc::new(()));

    assert_eq!(handle.wait().result, Ok(json!("main done")));
    assert_eq!(*flow_result.lock(), Some(Ok(json!("side done"))));
}

#[test]
fn test_new_thread_gets_own_thread_scope() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("main").depends_on("session"))
        .function(FunctionTemplate::new("worker").depends_on("session"))
        .function(FunctionTemplate::new("sibling").depends_on("session"))
        .resource(ResourceTemplate::new("session").with_scope(Scope::Thread))
        .build()
        .unwrap();
    let sourced = Arc::new(AtomicUsize::new(0));

    let office = Office::builder(graph)
        .function("main", |ctx| {
            ctx.spawn_flow("worker", Value::Null, FlowOptions::new().in_new_thread())?;
            ctx.spawn_flow("sibling", Value::Null, FlowOptions::new())?;
            Ok(Value::Null)
        })
        .function("worker", |_| Ok(Value::Null))
        .function("sibling", |_| Ok(Value::Null))
        .source_fn("session", counting_source(&sourced))
        .build()
        .unwrap();

    assert!(office.submit("main", Value::Null).unwrap().wait().is_success());
    // one for the entry thread (shared by main and sibling), one for the new thread
    assert_eq!(sourced.load(Ordering::SeqCst), 2);
}

// ---- containers ----

#[test]
fn test_process_scope_sourced_once() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("a").depends_on("db").then("b"))
        .function(FunctionTemplate::new("b").depends_on("db"))
        .resource(ResourceTemplate::new("db"))
        .build()
        .unwrap();
    let sourced = Arc::new(AtomicUsize::new(0));
    let office = Office::builder(graph)
        .function("a", |ctx| {
            ctx.parallel("b", Value::Null)?;
            Ok(json!(*ctx.dependency::<usize>(0)?))
        })
        .function("b", |ctx| Ok(json!(*ctx.dependency_named::<usize>("db")?)))
        .source_fn("db", counting_source(&sourced))
        .build()
        .unwrap();

    let outcome = office.submit("a", Value::Null).unwrap().wait();
    assert_eq!(outcome.result, Ok(json!(0)));
    assert_eq!(sourced.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unit_scope_sourced_per_unit() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("a").depends_on("scratch").then("b"))
        .function(FunctionTemplate::new("b").depends_on("scratch"))
        .resource(ResourceTemplate::new("scratch").with_scope(Scope::Unit))
        .build()
        .unwrap();
    let sourced = Arc::new(AtomicUsize::new(0));
    let office = Office::builder(graph)
        .function("a", |ctx| Ok(json!(*ctx.dependency::<usize>(0)?)))
        .function("b", |ctx| Ok(json!(*ctx.dependency::<usize>(0)?)))
        .source_fn("scratch", counting_source(&sourced))
        .build()
        .unwrap();

    let outcome = office.submit("a", Value::Null).unwrap().wait();
    assert_eq!(outcome.result, Ok(json!(1)));
    assert_eq!(sourced.load(Ordering::SeqCst), 2);
}

#[test]
fn test_prerequisites_sourced_first() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("query").depends_on("conn"))
        .resource(ResourceTemplate::new("conn").depends_on("settings"))
        .resource(ResourceTemplate::new("settings"))
        .build()
        .unwrap();
    let office = Office::builder(graph)
        .function("query", |ctx| Ok(json!(ctx.dependency::<String>(0)?.as_str())))
        .source("settings", ConstructSource::new(|| String::from("dsn=local")))
        .source_fn("conn", |req| {
            let settings = req
                .prerequisite::<String>("settings")
                .ok_or_else(|| Failure::raise("app.config", "no settings"))?;
            Ok(Sourcing::Ready(Arc::new(format!("connected({})", settings))))
        })
        .build()
        .unwrap();

    let outcome = office.submit("query", Value::Null).unwrap().wait();
    assert_eq!(outcome.result, Ok(json!("connected(dsn=local)")));
}

#[test]
fn test_source_failure_becomes_resolution_failure() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("a").depends_on("db"))
        .resource(ResourceTemplate::new("db"))
        .build()
        .unwrap();
    let office = Office::builder(graph)
        .function("a", |_| Ok(Value::Null))
        .source_fn("db", |_req| Err(Failure::raise("io.refused", "connection refused")))
        .build()
        .unwrap();

    let outcome = office.submit("a", Value::Null).unwrap().wait();
    let cause = outcome.failure().unwrap().root_cause();
    assert!(matches!(cause, Failure::DependencyResolution { resource, .. } if resource == "db"));
}

#[test]
fn test_pool_round_trip_reuses_instance() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("use").depends_on("conn"))
        .resource(
            ResourceTemplate::new("conn")
                .with_scope(Scope::Unit)
                .with_pool(PoolTemplate { max_idle: 1 }),
        )
        .build()
        .unwrap();
    let sourced = Arc::new(AtomicUsize::new(0));
    let office = Office::builder(graph)
        .function("use", |ctx| Ok(json!(*ctx.dependency::<usize>(0)?)))
        .source_fn("conn", counting_source(&sourced))
        .build()
        .unwrap();

    for _ in 0..3 {
        let outcome = office.submit("use", Value::Null).unwrap().wait();
        assert_eq!(outcome.result, Ok(json!(0)));
    }
    assert_eq!(sourced.load(Ordering::SeqCst), 1);
}

#[test]
fn test_invalidated_instance_not_pooled() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("use").depends_on("conn"))
        .resource(ResourceTemplate::new("conn").with_pool(PoolTemplate { max_idle: 1 }))
        .build()
        .unwrap();
    let sourced = Arc::new(AtomicUsize::new(0));
    let office = Office::builder(graph)
        .function("use", |ctx| {
            ctx.invalidate(0)?;
            Ok(Value::Null)
        })
        .source_fn("conn", counting_source(&sourced))
        .build()
        .unwrap();

    office.submit("use", Value::Null).unwrap().wait();
    office.submit("use", Value::Null).unwrap().wait();
    assert_eq!(sourced.load(Ordering::SeqCst), 2);
}

#[test]
fn test_async_source_provide_resumes_unit() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("a").depends_on("remote"))
        .resource(ResourceTemplate::new("remote").asynchronous())
        .build()
        .unwrap();
    let pending: Arc<Mutex<Option<SourceCompletion>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&pending);
    let office = Office::builder(graph)
        .function("a", |ctx| Ok(json!(ctx.dependency::<String>(0)?.as_str())))
        .source_fn("remote", move |req| {
            *slot.lock() = Some(req.completion);
            Ok(Sourcing::Pending)
        })
        .build()
        .unwrap();

    let handle = office.submit("a", Value::Null).unwrap();
    assert!(!handle.is_released());
    assert_eq!(handle.snapshot().units, 1);

    let completion = pending.lock().take().unwrap();
    assert!(!completion.is_abandoned());
    completion.provide(Arc::new(String::from("payload")));
    assert_eq!(handle.wait().result, Ok(json!("payload")));
}

#[test]
fn test_provide_while_snapshots_hold_the_lock() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("a").depends_on("remote"))
        .resource(ResourceTemplate::new("remote").asynchronous())
        .build()
        .unwrap();
    let pending: Arc<Mutex<Option<SourceCompletion>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&pending);
    let office = Office::builder(graph)
        .function("a", |ctx| Ok(json!(ctx.dependency::<String>(0)?.as_str())))
        .source_fn("remote", move |req| {
            *slot.lock() = Some(req.completion);
            Ok(Sourcing::Pending)
        })
        .build()
        .unwrap();

    for _ in 0..200 {
        let handle = office.submit("a", Value::Null).unwrap();
        let completion = pending.lock().take().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let watcher = {
            let (handle, stop) = (handle.clone(), Arc::clone(&stop));
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let _ = handle.snapshot();
                }
            })
        };

        completion.provide(Arc::new(String::from("payload")));
        let outcome = handle.wait_timeout(WAIT);
        stop.store(true, Ordering::SeqCst);
        watcher.join().unwrap();
        assert_eq!(outcome.map(|o| o.result), Some(Ok(json!("payload"))));
    }
}

#[test]
fn test_pending_answer_from_synchronous_resource_fails() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("a").depends_on("local"))
        .resource(ResourceTemplate::new("local"))
        .build()
        .unwrap();
    let office = Office::builder(graph)
        .function("a", |_| Ok(Value::Null))
        .source_fn("local", |_req| Ok(Sourcing::Pending))
        .build()
        .unwrap();

    let outcome = office.submit("a", Value::Null).unwrap().wait();
    assert_eq!(outcome.failure().unwrap().root_cause().class().as_str(), "strand.dependency.resolution");
}

#[test]
fn test_timeout_boundary_and_late_provide_ignored() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("a").depends_on("slow"))
        .resource(ResourceTemplate::new("slow").asynchronous().with_timeout(Timeout::from_millis(100)))
        .build()
        .unwrap();
    let clock = Arc::new(ManualClock::new());
    let pending: Arc<Mutex<Option<SourceCompletion>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&pending);
    let ran = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&ran);
    let office = Office::builder(graph)
        .clock(clock.clone())
        .function("a", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
        .source_fn("slow", move |req| {
            *slot.lock() = Some(req.completion);
            Ok(Sourcing::Pending)
        })
        .build()
        .unwrap();

    let handle = office.submit("a", Value::Null).unwrap();
    assert_eq!(office.pending_deadlines(), 1);

    clock.advance(99);
    assert_eq!(office.tick(), 0);
    assert!(!handle.is_released());

    clock.advance(1);
    assert_eq!(office.tick(), 1);
    let outcome = handle.wait();
    assert!(matches!(
        outcome.failure().unwrap().root_cause(),
        Failure::DependencyTimeout { resource, timeout } if resource == "slow" && *timeout == Timeout::from_millis(100)
    ));

    // a second sweep finds nothing; the late answer changes nothing
    assert_eq!(office.tick(), 0);
    pending.lock().take().unwrap().provide(Arc::new(()));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(handle.outcome(), Some(outcome));
    assert_eq!(office.metrics().timeouts, 1);
}

#[test]
fn test_provide_before_deadline_cancels_it() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("a").depends_on("slow"))
        .resource(ResourceTemplate::new("slow").asynchronous().with_timeout(Timeout::from_millis(50)))
        .build()
        .unwrap();
    let clock = Arc::new(ManualClock::new());
    let pending: Arc<Mutex<Option<SourceCompletion>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&pending);
    let office = Office::builder(graph)
        .clock(clock.clone())
        .function("a", |_| Ok(json!("ok")))
        .source_fn("slow", move |req| {
            *slot.lock() = Some(req.completion);
            Ok(Sourcing::Pending)
        })
        .build()
        .unwrap();

    let handle = office.submit("a", Value::Null).unwrap();
    pending.lock().take().unwrap().provide(Arc::new(()));
    assert_eq!(handle.wait().result, Ok(json!("ok")));
    assert_eq!(office.pending_deadlines(), 0);

    clock.advance(1_000);
    assert_eq!(office.tick(), 0);
}

#[test]
fn test_ten_parallel_flows_time_out_together() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("main"))
        .function(FunctionTemplate::new("fetch").depends_on("remote"))
        .function(FunctionTemplate::new("recover"))
        .resource(
            ResourceTemplate::new("remote")
                .asynchronous()
                .with_scope(Scope::Unit)
                .with_timeout(Timeout::from_millis(10)),
        )
        .build()
        .unwrap();
    let clock = Arc::new(ManualClock::new());
    let outcomes: Arc<Mutex<Vec<FlowOutcome>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&outcomes);

    let office = Office::builder(graph)
        .clock(clock.clone())
        .function("main", move |ctx| {
            for i in 0..10 {
                let r = Arc::clone(&recorded);
                ctx.spawn_flow(
                    "fetch",
                    json!(i),
                    FlowOptions::new()
                        .in_new_thread()
                        .handle("strand.dependency", "recover")
                        .on_complete(move |outcome| r.lock().push(outcome)),
                )?;
            }
            Ok(json!("spawned"))
        })
        .function("fetch", |_| Ok(Value::Null))
        .function("recover", |ctx| Ok(ctx.parameter()["class"].clone()))
        .source_fn("remote", |_req| Ok(Sourcing::Pending))
        .build()
        .unwrap();

    let handle = office.submit("main", Value::Null).unwrap();
    assert_eq!(office.pending_deadlines(), 10);

    clock.advance(10);
    assert_eq!(office.tick(), 10);

    assert_eq!(handle.wait().result, Ok(json!("spawned")));
    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 10);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, Err(Failure::DependencyTimeout { .. }))));
    assert_eq!(office.metrics().escalations, 10);
}

#[test]
fn test_container_operation_parks_later_dependents() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("writer").depends_on("ledger"))
        .function(FunctionTemplate::new("reader").depends_on("ledger"))
        .resource(ResourceTemplate::new("ledger"))
        .build()
        .unwrap();
    let operation: Arc<Mutex<Option<ContainerOperation>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&operation);
    let reads = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&reads);

    let office = Office::builder(graph)
        .function("writer", move |ctx| {
            *slot.lock() = Some(ctx.begin_operation(0)?);
            ctx.parallel("reader", Value::Null)?;
            Ok(json!("written"))
        })
        .function("reader", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
        .source("ledger", ConstructSource::new(Vec::<u8>::new))
        .build()
        .unwrap();

    let handle = office.submit("writer", Value::Null).unwrap();
    assert_eq!(reads.load(Ordering::SeqCst), 0);
    assert!(!handle.is_released());

    operation.lock().take().unwrap().complete();
    assert_eq!(handle.wait().result, Ok(json!("written")));
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_container_operation_timeout_fails_dependents() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("writer").depends_on("ledger"))
        .function(FunctionTemplate::new("reader").depends_on("ledger"))
        .resource(ResourceTemplate::new("ledger").with_timeout(Timeout::from_millis(20)))
        .build()
        .unwrap();
    let clock = Arc::new(ManualClock::new());
    let operation: Arc<Mutex<Option<ContainerOperation>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&operation);

    let office = Office::builder(graph)
        .clock(clock.clone())
        .function("writer", move |ctx| {
            *slot.lock() = Some(ctx.begin_operation(0)?);
            ctx.parallel("reader", Value::Null)?;
            Ok(Value::Null)
        })
        .function("reader", |_| Ok(Value::Null))
        .source("ledger", ConstructSource::new(|| 0_u8))
        .build()
        .unwrap();

    let handle = office.submit("writer", Value::Null).unwrap();
    clock.advance(20);
    assert_eq!(office.tick(), 1);

    let outcome = handle.wait();
    assert_eq!(
        outcome.failure().unwrap().root_cause().class().as_str(),
        "strand.async.timeout"
    );
    // completing afterwards is harmless
    operation.lock().take().unwrap().complete();
}

// ---- asynchronous flows ----

#[test]
fn test_asynchronous_flow_holds_unit_until_complete() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("call").then("reply"))
        .function(FunctionTemplate::new("reply"))
        .build()
        .unwrap();
    let slot: Arc<Mutex<Option<AsynchronousFlow>>> = Arc::new(Mutex::new(None));
    let stash = Arc::clone(&slot);
    let office = Office::builder(graph)
        .function("call", move |ctx| {
            *stash.lock() = Some(ctx.create_asynchronous_flow());
            Ok(json!("called"))
        })
        .function("reply", |ctx| Ok(json!(format!("reply to {}", ctx.parameter().as_str().unwrap_or("")))))
        .build()
        .unwrap();

    let handle = office.submit("call", Value::Null).unwrap();
    assert!(!handle.is_released());

    let flow = slot.lock().take().unwrap();
    flow.complete();
    assert_eq!(handle.wait().result, Ok(json!("reply to called")));
}

#[test]
fn test_asynchronous_flow_completed_inside_body() {
    let graph = OfficeGraph::builder().function(FunctionTemplate::new("call")).build().unwrap();
    let office = Office::builder(graph)
        .function("call", |ctx| {
            ctx.create_asynchronous_flow().complete();
            Ok(json!(1))
        })
        .build()
        .unwrap();

    assert_eq!(office.submit("call", Value::Null).unwrap().wait().result, Ok(json!(1)));
}

#[test]
fn test_asynchronous_flow_timeout_escalates() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("call").with_async_timeout(Timeout::from_millis(50)))
        .build()
        .unwrap();
    let clock = Arc::new(ManualClock::new());
    let slot: Arc<Mutex<Option<AsynchronousFlow>>> = Arc::new(Mutex::new(None));
    let stash = Arc::clone(&slot);
    let office = Office::builder(graph)
        .clock(clock.clone())
        .function("call", move |ctx| {
            assert_eq!(ctx.async_timeout(), Timeout::from_millis(50));
            *stash.lock() = Some(ctx.create_asynchronous_flow());
            Ok(Value::Null)
        })
        .build()
        .unwrap();

    let handle = office.submit("call", Value::Null).unwrap();
    clock.advance(50);
    assert_eq!(office.tick(), 1);

    let outcome = handle.wait();
    assert!(matches!(
        outcome.failure().unwrap().root_cause(),
        Failure::AsynchronousOperationTimeout { .. }
    ));
    slot.lock().take().unwrap().complete();
    assert_eq!(handle.outcome(), Some(outcome));
}

#[test]
fn test_asynchronous_flow_failure_escalates() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("call").handle("remote", "compensate"))
        .function(FunctionTemplate::new("compensate"))
        .build()
        .unwrap();
    let slot: Arc<Mutex<Option<AsynchronousFlow>>> = Arc::new(Mutex::new(None));
    let stash = Arc::clone(&slot);
    let office = Office::builder(graph)
        .function("call", move |ctx| {
            *stash.lock() = Some(ctx.create_asynchronous_flow());
            Ok(Value::Null)
        })
        .function("compensate", |ctx| {
            let class = ctx.failure().map(|f| f.class().as_str().to_string());
            Ok(json!(class))
        })
        .build()
        .unwrap();

    let handle = office.submit("call", Value::Null).unwrap();
    slot.lock().take().unwrap().fail(Failure::raise("remote.down", "peer gone"));
    assert_eq!(handle.wait().result, Ok(json!("remote.down")));
}

// ---- escalation ----

fn failing_office(graph: OfficeGraph) -> Office {
    Office::builder(graph)
        .function("work", |_| Err(Failure::raise("app.invalid.amount", "negative amount")))
        .function("handler", |ctx| {
            let failure = ctx.failure().cloned().unwrap_or_else(|| Failure::raise("none", ""));
            Ok(json!({"handled": failure.class().as_str(), "param": ctx.parameter()["class"].clone()}))
        })
        .function("other", |_| Ok(json!("other")))
        .build()
        .unwrap()
}

#[test]
fn test_function_handler_hides_raw_failure() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("work").handle("app.invalid", "handler"))
        .function(FunctionTemplate::new("handler"))
        .function(FunctionTemplate::new("other"))
        .build()
        .unwrap();
    let office = failing_office(graph);

    let outcome = office.submit("work", Value::Null).unwrap().wait();
    assert_eq!(
        outcome.result,
        Ok(json!({"handled": "app.invalid.amount", "param": "app.invalid.amount"}))
    );
}

#[test]
fn test_flow_handler_used_when_function_has_none() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("work"))
        .function(FunctionTemplate::new("handler"))
        .function(FunctionTemplate::new("other"))
        .escalation("app", "other")
        .build()
        .unwrap();
    let office = failing_office(graph);

    let outcome = office
        .submit_with("work", Value::Null, ProcessOptions::new().handle("app.invalid", "handler"))
        .unwrap()
        .wait();
    assert_eq!(outcome.value().unwrap()["handled"], json!("app.invalid.amount"));
}

#[test]
fn test_office_and_default_handlers() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("work"))
        .function(FunctionTemplate::new("handler"))
        .function(FunctionTemplate::new("other"))
        .escalation("io", "handler")
        .default_handler("other")
        .build()
        .unwrap();
    let office = failing_office(graph);

    let outcome = office.submit("work", Value::Null).unwrap().wait();
    assert_eq!(outcome.result, Ok(json!("other")));
}

#[test]
fn test_unhandled_failure_fails_process() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("work").handle("io", "handler"))
        .function(FunctionTemplate::new("handler"))
        .function(FunctionTemplate::new("other"))
        .build()
        .unwrap();
    let office = failing_office(graph);

    let outcome = office.submit("work", Value::Null).unwrap().wait();
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.class().as_str(), "strand.escalation.unhandled");
    assert!(matches!(
        failure.root_cause(),
        Failure::FunctionExecution { function, .. } if function == "work"
    ));
    let metrics = office.metrics();
    assert_eq!(metrics.processes_failed, 1);
    assert_eq!(metrics.units_failed, 1);
}

#[test]
fn test_reentrant_failure_skips_used_handler() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("work"))
        .function(FunctionTemplate::new("handler"))
        .function(FunctionTemplate::new("other"))
        .escalation("app", "flaky")
        .default_handler("other")
        .function(FunctionTemplate::new("flaky"))
        .build()
        .unwrap();
    let office = Office::builder(graph)
        .function("work", |_| Err(Failure::raise("app.first", "first")))
        .function("flaky", |_| Err(Failure::raise("app.second", "second")))
        .function("handler", |_| Ok(Value::Null))
        .function("other", |ctx| Ok(json!(ctx.failure().map(|f| f.class().as_str().to_string()))))
        .build()
        .unwrap();

    let outcome = office.submit("work", Value::Null).unwrap().wait();
    assert_eq!(outcome.result, Ok(json!("app.second")));
    assert_eq!(office.metrics().escalations, 2);
}

#[test]
fn test_handler_failing_with_no_alternative_fails_process() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("work"))
        .function(FunctionTemplate::new("flaky"))
        .escalation("app", "flaky")
        .build()
        .unwrap();
    let office = Office::builder(graph)
        .function("work", |_| Err(Failure::raise("app.first", "first")))
        .function("flaky", |_| Err(Failure::raise("app.second", "second")))
        .build()
        .unwrap();

    let outcome = office.submit("work", Value::Null).unwrap().wait();
    assert!(matches!(
        outcome.failure().unwrap().root_cause(),
        Failure::FunctionExecution { message, .. } if message == "second"
    ));
}

#[test]
fn test_escalation_suppresses_pending_siblings() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("main"))
        .function(FunctionTemplate::new("boom"))
        .function(FunctionTemplate::new("waiting").depends_on("gate"))
        .function(FunctionTemplate::new("handler"))
        .resource(ResourceTemplate::new("gate").asynchronous())
        .default_handler("handler")
        .build()
        .unwrap();
    let waited = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&waited);
    let office = Office::builder(graph)
        .function("main", |ctx| {
            ctx.parallel("waiting", Value::Null)?;
            ctx.parallel("boom", Value::Null)?;
            Ok(Value::Null)
        })
        .function("boom", |_| Err(Failure::raise("app.boom", "boom")))
        .function("waiting", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
        .function("handler", |_| Ok(json!("recovered")))
        .source_fn("gate", |_req| Ok(Sourcing::Pending))
        .build()
        .unwrap();

    let outcome = office.submit("main", Value::Null).unwrap().wait();
    assert_eq!(outcome.result, Ok(json!("recovered")));
    assert_eq!(waited.load(Ordering::SeqCst), 0);
    assert_eq!(office.metrics().units_suppressed, 1);
}

#[test]
fn test_flow_callback_sees_raw_failure_process_sees_wrapper() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("main"))
        .function(FunctionTemplate::new("child"))
        .build()
        .unwrap();
    let seen: Arc<Mutex<Option<FlowOutcome>>> = Arc::new(Mutex::new(None));
    let recorded = Arc::clone(&seen);
    let office = Office::builder(graph)
        .function("main", move |ctx| {
            let r = Arc::clone(&recorded);
            ctx.spawn_flow(
                "child",
                Value::Null,
                FlowOptions::new().blocking().on_complete(move |o| *r.lock() = Some(o)),
            )?;
            Ok(Value::Null)
        })
        .function("child", |_| Err(Failure::raise("app.child", "child failed")))
        .build()
        .unwrap();

    let outcome = office.submit("main", Value::Null).unwrap().wait();
    assert!(matches!(outcome.failure(), Some(Failure::EscalationHandlerNotFound { .. })));
    let flow = seen.lock().clone().unwrap();
    assert_eq!(flow.unwrap_err().class().as_str(), "app.child");
}

#[test]
fn test_process_handler_catches_spawned_flow_failure() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("main"))
        .function(FunctionTemplate::new("child"))
        .function(FunctionTemplate::new("handler"))
        .build()
        .unwrap();
    let handled = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&handled);
    let office = Office::builder(graph)
        .function("main", |ctx| {
            ctx.spawn_flow("child", Value::Null, FlowOptions::new())?;
            Ok(json!("main"))
        })
        .function("child", |_| Err(Failure::raise("app.child", "child failed")))
        .function("handler", move |ctx| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(ctx.parameter()["class"].clone())
        })
        .build()
        .unwrap();

    let outcome = office
        .submit_with("main", Value::Null, ProcessOptions::new().handle("app", "handler"))
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert_eq!(outcome.result, Ok(json!("main")));
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(office.metrics().escalations, 1);
}

#[test]
fn test_enclosing_flow_handler_catches_nested_thread_failure() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("main"))
        .function(FunctionTemplate::new("middle"))
        .function(FunctionTemplate::new("leaf"))
        .function(FunctionTemplate::new("recover"))
        .build()
        .unwrap();
    let recovered: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&recovered);
    let office = Office::builder(graph)
        .function("main", |ctx| {
            ctx.spawn_flow("middle", Value::Null, FlowOptions::new().blocking().handle("app", "recover"))?;
            Ok(json!("main"))
        })
        .function("middle", |ctx| {
            ctx.spawn_flow("leaf", Value::Null, FlowOptions::new().in_new_thread().blocking())?;
            Ok(Value::Null)
        })
        .function("leaf", |_| Err(Failure::raise("app.leaf", "leaf failed")))
        .function("recover", move |ctx| {
            let class = ctx.parameter()["class"].as_str().unwrap_or_default().to_string();
            recorded.lock().push(class);
            Ok(Value::Null)
        })
        .build()
        .unwrap();

    let outcome = office.submit("main", Value::Null).unwrap().wait_timeout(WAIT).unwrap();
    assert_eq!(outcome.result, Ok(json!("main")));
    assert_eq!(*recovered.lock(), ["app.leaf".to_string()]);
}

#[test]
fn test_parent_continues_after_handled_blocking_child() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("parent").then("after"))
        .function(FunctionTemplate::new("after"))
        .function(FunctionTemplate::new("child"))
        .function(FunctionTemplate::new("h"))
        .build()
        .unwrap();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (in_handler, in_after) = (Arc::clone(&order), Arc::clone(&order));
    let seen: Arc<Mutex<Option<FlowOutcome>>> = Arc::new(Mutex::new(None));
    let recorded = Arc::clone(&seen);
    let office = Office::builder(graph)
        .function("parent", move |ctx| {
            let r = Arc::clone(&recorded);
            ctx.spawn_flow(
                "child",
                Value::Null,
                FlowOptions::new()
                    .blocking()
                    .handle("app", "h")
                    .on_complete(move |o| *r.lock() = Some(o)),
            )?;
            Ok(json!("parent"))
        })
        .function("child", |_| Err(Failure::raise("app.x", "child failed")))
        .function("h", move |_| {
            in_handler.lock().push("h");
            Ok(json!("h"))
        })
        .function("after", move |ctx| {
            in_after.lock().push("after");
            Ok(json!({ "after": ctx.parameter() }))
        })
        .build()
        .unwrap();

    let handle = office.submit("parent", Value::Null).unwrap();
    let outcome = handle.wait_timeout(WAIT).unwrap();
    assert_eq!(outcome.result, Ok(json!({ "after": "parent" })));
    assert_eq!(*order.lock(), ["h", "after"]);
    let child = seen.lock().clone().unwrap();
    assert_eq!(child.unwrap_err().class().as_str(), "app.x");
    assert!(!handle.snapshot().escalating);
}

#[test]
fn test_superseded_failure_is_not_counted() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("main"))
        .function(FunctionTemplate::new("boom"))
        .function(FunctionTemplate::new("handler"))
        .default_handler("handler")
        .build()
        .unwrap();
    let slot: Arc<Mutex<Option<AsynchronousFlow>>> = Arc::new(Mutex::new(None));
    let stash = Arc::clone(&slot);
    let office = Office::builder(graph)
        .function("main", move |ctx| {
            *stash.lock() = Some(ctx.create_asynchronous_flow());
            ctx.parallel("boom", Value::Null)?;
            Ok(Value::Null)
        })
        .function("boom", |_| Err(Failure::raise("app.boom", "boom")))
        .function("handler", |_| Ok(json!("recovered")))
        .build()
        .unwrap();

    let handle = office.submit("main", Value::Null).unwrap();
    assert!(!handle.is_released());
    slot.lock().take().unwrap().fail(Failure::raise("remote.down", "late failure"));

    let outcome = handle.wait_timeout(WAIT).unwrap();
    assert_eq!(outcome.result, Ok(json!("recovered")));
    let metrics = office.metrics();
    assert_eq!(metrics.units_failed, 2);
    assert_eq!(metrics.escalations, 1);
}

#[test]
fn test_panic_becomes_failure() {
    let graph = OfficeGraph::builder().function(FunctionTemplate::new("bad")).build().unwrap();
    let office = Office::builder(graph)
        .function("bad", |_| -> strand_runtime::UnitResult { panic!("invariant broken") })
        .build()
        .unwrap();

    let outcome = office.submit("bad", Value::Null).unwrap().wait();
    let cause = outcome.failure().unwrap().root_cause();
    assert_eq!(cause.class().as_str(), "strand.panic");
    assert!(cause.to_string().contains("invariant broken"));
}

// ---- administration ----

#[test]
fn test_duties_and_governance_wrap_function() {
    let graph = OfficeGraph::builder()
        .function(
            FunctionTemplate::new("checkout")
                .before(AdministrationTemplate::duty("open_tx").over("db"))
                .before(AdministrationTemplate::governance("audit"))
                .after(AdministrationTemplate::duty("commit_tx").over("db")),
        )
        .function(FunctionTemplate::new("open_tx"))
        .function(FunctionTemplate::new("audit"))
        .function(FunctionTemplate::new("commit_tx"))
        .resource(ResourceTemplate::new("db"))
        .build()
        .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let (l1, l2, l3, l4) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));

    let office = Office::builder(graph)
        .function("open_tx", move |ctx| {
            assert_eq!(ctx.kind(), UnitKind::Duty);
            assert_eq!(ctx.administered(), Some("checkout"));
            let db = ctx.extension::<String>(0).map(|s| s.to_string()).unwrap_or_default();
            l1.lock().push(format!("open {} {}", db, ctx.parameter()));
            Ok(json!("discarded"))
        })
        .function("audit", move |ctx| {
            assert_eq!(ctx.kind(), UnitKind::Governance);
            assert!(ctx.extensions().is_empty());
            l2.lock().push(format!("audit {}", ctx.parameter()));
            Ok(Value::Null)
        })
        .function("checkout", move |ctx| {
            assert_eq!(ctx.kind(), UnitKind::Function);
            l3.lock().push("checkout".to_string());
            Ok(json!(ctx.parameter().as_i64().unwrap_or(0) + 1))
        })
        .function("commit_tx", move |ctx| {
            l4.lock().push(format!("commit {}", ctx.parameter()));
            Ok(Value::Null)
        })
        .source("db", ConstructSource::new(|| String::from("main-db")))
        .build()
        .unwrap();

    let outcome = office.submit("checkout", json!(41)).unwrap().wait();
    assert_eq!(outcome.result, Ok(json!(42)));
    assert_eq!(
        *log.lock(),
        vec![
            "open main-db 41".to_string(),
            "audit 41".to_string(),
            "checkout".to_string(),
            "commit 42".to_string()
        ]
    );
}

#[test]
fn test_failing_duty_prevents_function() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("guarded").before(AdministrationTemplate::governance("authorize")))
        .function(FunctionTemplate::new("authorize"))
        .build()
        .unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&ran);
    let office = Office::builder(graph)
        .function("guarded", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
        .function("authorize", |_| Err(Failure::raise("auth.denied", "not allowed")))
        .build()
        .unwrap();

    let outcome = office.submit("guarded", Value::Null).unwrap().wait();
    assert_eq!(outcome.failure().unwrap().root_cause().class().as_str(), "auth.denied");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

// ---- teams ----

#[test]
fn test_dedicated_team_runs_off_caller_thread() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("work").on_team("io"))
        .team(TeamTemplate::dedicated("io", 2))
        .build()
        .unwrap();
    let thread_seen = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&thread_seen);
    let office = Office::builder(graph)
        .function("work", move |ctx| {
            *seen.lock() = Some(ctx.current_thread());
            Ok(json!(ctx.worker().team()))
        })
        .build()
        .unwrap();

    let handle = office.submit("work", Value::Null).unwrap();
    let outcome = handle.wait_timeout(WAIT).unwrap();
    assert_eq!(outcome.result, Ok(json!("io")));
    let worker = thread_seen.lock().unwrap();
    assert_ne!(worker, std::thread::current().id());
    office.shutdown();
}

#[test]
fn test_thread_local_aware_units_stay_on_one_worker() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("s0").on_team("pool").then("s1"))
        .function(FunctionTemplate::new("s1").on_team("pool").then("s2"))
        .function(FunctionTemplate::new("s2").on_team("pool").then("s3"))
        .function(FunctionTemplate::new("s3").on_team("pool"))
        .team(TeamTemplate::dedicated("pool", 4))
        .build()
        .unwrap();
    let threads = Arc::new(Mutex::new(Vec::new()));
    let mut builder = Office::builder(graph);
    for name in ["s0", "s1", "s2", "s3"] {
        let t = Arc::clone(&threads);
        builder = builder.function(name, move |ctx| {
            t.lock().push(ctx.current_thread());
            Ok(Value::Null)
        });
    }
    let office = builder.build().unwrap();

    for _ in 0..5 {
        threads.lock().clear();
        let handle = office
            .submit_with("s0", Value::Null, ProcessOptions::new().thread_local_aware(true))
            .unwrap();
        assert!(handle.wait_timeout(WAIT).unwrap().is_success());
        let distinct: HashSet<_> = threads.lock().iter().copied().collect();
        assert_eq!(threads.lock().len(), 4);
        assert_eq!(distinct.len(), 1);
    }
    office.shutdown();
}

#[test]
fn test_shared_team_runs_on_target() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("work").on_team("alias"))
        .team(TeamTemplate::dedicated("io", 1))
        .team(TeamTemplate::shared("alias", "io"))
        .build()
        .unwrap();
    let office = Office::builder(graph)
        .function("work", |ctx| Ok(json!(ctx.worker().team())))
        .build()
        .unwrap();

    let outcome = office.submit("work", Value::Null).unwrap().wait_timeout(WAIT).unwrap();
    assert_eq!(outcome.result, Ok(json!("io")));
    office.shutdown();
}

#[test]
fn test_stopped_team_rejects_units() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("front").then("back"))
        .function(FunctionTemplate::new("back").on_team("io"))
        .team(TeamTemplate::dedicated("io", 1))
        .build()
        .unwrap();
    let office = Office::builder(graph)
        .function("front", |_| Ok(Value::Null))
        .function("back", |_| Ok(Value::Null))
        .build()
        .unwrap();

    office.team("io").unwrap().stop();
    let outcome = office.submit("front", Value::Null).unwrap().wait_timeout(WAIT).unwrap();
    assert_eq!(outcome.failure().unwrap().root_cause().class().as_str(), "strand.team.rejected");
    office.shutdown();
}

#[test]
fn test_many_processes_on_dedicated_team() {
    let graph = OfficeGraph::builder()
        .function(FunctionTemplate::new("inc").on_team("cpu").depends_on("counter"))
        .resource(ResourceTemplate::new("counter"))
        .team(TeamTemplate::dedicated("cpu", 4))
        .build()
        .unwrap();
    let office = Office::builder(graph)
        .function("inc", |ctx| {
            let counter = ctx.dependency::<AtomicUsize>(0)?;
            Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + ctx.parameter().as_u64().unwrap_or(0) as usize))
        })
        .source("counter", ConstructSource::new(|| AtomicUsize::new(0)))
        .build()
        .unwrap();

    let handles: Vec<_> = (0..32).map(|i| office.submit("inc", json!(i)).unwrap()).collect();
    for (i, handle) in handles.iter().enumerate() {
        let outcome = handle.wait_timeout(WAIT).unwrap();
        assert_eq!(outcome.result, Ok(json!(i)));
    }
    let metrics = office.metrics();
    assert_eq!(metrics.processes_started, 32);
    assert_eq!(metrics.processes_completed, 32);
    assert_eq!(metrics.active_processes(), 0);
    office.shutdown();
}

// ---- properties ----

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

    #[test]
    fn prop_chain_length_is_result(len in 1usize..12) {
        let mut graph = OfficeGraph::builder();
        let mut builder_names = Vec::new();
        for i in 0..len {
            let mut template = FunctionTemplate::new(format!("step{}", i));
            if i + 1 < len {
                template = template.then(format!("step{}", i + 1));
            }
            graph = graph.function(template);
            builder_names.push(format!("step{}", i));
        }
        let mut builder = Office::builder(graph.build().unwrap());
        for name in builder_names {
            builder = builder.function(name, |ctx| Ok(json!(ctx.parameter().as_u64().unwrap_or(0) + 1)));
        }
        let office = builder.build().unwrap();

        let outcome = office.submit("step0", json!(0)).unwrap().wait();
        proptest::prop_assert_eq!(outcome.result, Ok(json!(len)));
    }

    #[test]
    fn prop_flow_callback_exactly_once(parallel in 0usize..16, extra in 1usize..4) {
        let graph = OfficeGraph::builder()
            .function(FunctionTemplate::new("main"))
            .function(FunctionTemplate::new("root"))
            .function(FunctionTemplate::new("leaf").depends_on("shared"))
            .resource(ResourceTemplate::new("shared"))
            .build()
            .unwrap();
        let sourced = Arc::new(AtomicUsize::new(0));
        let callbacks = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&callbacks);
        let office = Office::builder(graph)
            .function("main", move |ctx| {
                let c = Arc::clone(&counted);
                ctx.spawn_flow("root", json!(parallel), FlowOptions::new().on_complete(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                }))?;
                Ok(Value::Null)
            })
            .function("root", move |ctx| {
                let n = ctx.parameter().as_u64().unwrap_or(0);
                for _ in 0..n {
                    ctx.parallel("leaf", Value::Null)?;
                }
                for _ in 0..extra {
                    ctx.parallel("leaf", Value::Null)?;
                }
                Ok(Value::Null)
            })
            .function("leaf", |_| Ok(Value::Null))
            .source_fn("shared", counting_source(&sourced))
            .build()
            .unwrap();

        proptest::prop_assert!(office.submit("main", Value::Null).unwrap().wait().is_success());
        proptest::prop_assert_eq!(callbacks.load(Ordering::SeqCst), 1);
        proptest::prop_assert_eq!(sourced.load(Ordering::SeqCst), 1);
    }
}
