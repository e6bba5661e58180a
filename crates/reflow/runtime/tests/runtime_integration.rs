//! End-to-end tests through the public runtime API

use async_trait::async_trait;
use reflow_runtime::cache::{CacheResult, DistributedCacheProvider, InMemoryDistributedCache};
use reflow_runtime::config::RuntimeConfig;
use reflow_runtime::engine::{CreateOptions, ExecuteOptions, FlowOptions};
use reflow_runtime::telemetry;
use reflow_runtime::types::{
    events, ErrorKind, Flow, FlowStep, InputBinding, OutputBinding, ProcessDefinition, ProcessId,
    ReflowError, RetryPolicy, Schema, StepId, TaskDefinition, TaskId, Transition, WILDCARD,
};
use reflow_runtime::{InMemoryStateStore, ReflowRuntime, TransactionState};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn order_process() -> ProcessDefinition {
    ProcessDefinition::new("order-process", "created")
        .with_states(["created", "processing", "completed", "cancelled"])
        .with_transition(Transition::new("created", "processing", "START"))
        .with_transition(Transition::new("processing", "completed", "COMPLETE"))
        .with_transition(Transition::new("*", "cancelled", "CANCEL"))
}

fn runtime() -> ReflowRuntime {
    let runtime = ReflowRuntime::bootstrap(RuntimeConfig::testing()).unwrap();
    runtime.register_process(order_process()).unwrap();
    runtime
}

fn order_context(order_id: &str) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert("orderId".into(), json!(order_id));
    context
}

#[tokio::test]
async fn order_lifecycle_end_to_end() {
    let runtime = runtime();
    let order = runtime
        .create_process(
            &ProcessId::new("order-process"),
            order_context("1"),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    runtime
        .transition_process(&order.id, "START", None)
        .await
        .unwrap()
        .into_applied()
        .unwrap();
    let done = runtime
        .transition_process(&order.id, "COMPLETE", Some(json!({"shipped": true})))
        .await
        .unwrap()
        .into_applied()
        .unwrap();

    assert_eq!(done.state, "completed");
    assert_eq!(done.context["orderId"], "1");
    assert_eq!(done.context["shipped"], true);
    let steps: Vec<(&str, &str)> = done
        .history
        .iter()
        .map(|h| (h.from.as_str(), h.to.as_str()))
        .collect();
    assert_eq!(steps, vec![("created", "processing"), ("processing", "completed")]);

    let fetched = runtime.get_process(&order.id).await.unwrap();
    assert_eq!(fetched, done);
}

#[tokio::test]
async fn wildcard_subscriber_sees_every_lifecycle_event_in_order() {
    let runtime = runtime();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = runtime.subscribe(WILDCARD, move |event| {
        s.lock().unwrap().push(event.event_type.clone());
        Ok(())
    });

    let order = runtime
        .create_process(
            &ProcessId::new("order-process"),
            order_context("2"),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    runtime
        .transition_process(&order.id, "COMPLETE", None)
        .await
        .unwrap();
    runtime.transition_process(&order.id, "CANCEL", None).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            events::PROCESS_CREATED,
            events::PROCESS_TRANSITION_REJECTED,
            events::PROCESS_STATE_CHANGED
        ]
    );
}

#[tokio::test]
async fn rollback_discards_created_instances() {
    let runtime = runtime();
    runtime
        .create_process(
            &ProcessId::new("order-process"),
            order_context("before"),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    let before = runtime.get_all_processes();

    let tx = runtime.begin_transaction().unwrap();
    tx.create_process(
        &ProcessId::new("order-process"),
        order_context("inside"),
        CreateOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(runtime.get_all_processes().len(), 2);

    tx.rollback().await.unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(runtime.get_all_processes(), before);
}

#[tokio::test]
async fn rollback_reverts_transitions_and_cached_lookups() {
    let runtime = runtime();
    let order = runtime
        .create_process(
            &ProcessId::new("order-process"),
            order_context("3"),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    let tx = runtime.begin_transaction().unwrap();
    tx.transition_process(&order.id, "START", None).await.unwrap();
    assert_eq!(runtime.get_process(&order.id).await.unwrap().state, "processing");

    tx.rollback().await.unwrap();
    let restored = runtime.get_process(&order.id).await.unwrap();
    assert_eq!(restored.state, "created");
    assert!(restored.history.is_empty());

    let snapshot = runtime.telemetry();
    assert_eq!(snapshot.counter(telemetry::TRANSACTIONS_ROLLED_BACK), 1);
}

#[tokio::test]
async fn committed_transaction_keeps_changes() {
    let runtime = runtime();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = runtime.subscribe(WILDCARD, move |event| {
        if event.event_type.starts_with("transaction.") {
            s.lock().unwrap().push(event.event_type.clone());
        }
        Ok(())
    });

    let tx = runtime.begin_transaction().unwrap();
    let order = tx
        .create_process(
            &ProcessId::new("order-process"),
            order_context("4"),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    tx.commit().unwrap();

    assert!(runtime.get_process(&order.id).await.is_ok());
    assert_eq!(
        tx.transition_process(&order.id, "START", None)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::ValidationError
    );
    assert_eq!(
        *seen.lock().unwrap(),
        vec![events::TRANSACTION_BEGUN, events::TRANSACTION_COMMITTED]
    );
}

/// Distributed tier whose writes take `delay`
struct SlowWrites {
    inner: InMemoryDistributedCache,
    delay: Duration,
}

#[async_trait]
impl DistributedCacheProvider for SlowWrites {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> CacheResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.inner.delete(key).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.inner.clear().await
    }

    async fn size(&self) -> CacheResult<usize> {
        self.inner.size().await
    }
}

#[tokio::test(start_paused = true)]
async fn rollback_waits_for_operation_in_flight() {
    let runtime = ReflowRuntime::builder()
        .with_config(RuntimeConfig::testing())
        .with_distributed_cache(Arc::new(SlowWrites {
            inner: InMemoryDistributedCache::new(),
            delay: Duration::from_millis(100),
        }))
        .build()
        .unwrap();
    runtime.register_process(order_process()).unwrap();

    let tx = runtime.begin_transaction().unwrap();
    // The create suspends on the slow cache write; rollback starts meanwhile
    let definition_id = ProcessId::new("order-process");
    let (created, rolled_back) = tokio::join!(
        tx.create_process(
            &definition_id,
            order_context("racing"),
            CreateOptions::default(),
        ),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.rollback().await
        }
    );
    let created = created.unwrap();
    rolled_back.unwrap();

    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(tx.operations().len(), 1);
    assert!(runtime.get_all_processes().is_empty());
    assert_eq!(
        runtime.get_process(&created.id).await.unwrap_err().kind(),
        ErrorKind::ProcessNotFound
    );
}

#[tokio::test]
async fn cached_task_results_skip_execution() {
    let runtime = runtime();
    let calls = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&calls);
    runtime
        .register_task(
            TaskDefinition::from_fn("price", move |input: Value, _ctx| {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Ok(json!(input["qty"].as_i64().unwrap_or(0) * 5)) }
            })
            .cached(),
        )
        .unwrap();

    let price = TaskId::new("price");
    for _ in 0..3 {
        let out = runtime
            .execute_task(&price, json!({"qty": 2}), Value::Null, ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(out, json!(10));
    }
    runtime
        .execute_task(&price, json!({"qty": 3}), Value::Null, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let snapshot = runtime.telemetry();
    assert_eq!(snapshot.counter(telemetry::CACHE_HITS), 2);
    assert_eq!(snapshot.counter(telemetry::TASKS_SUCCEEDED), 2);
}

#[tokio::test]
async fn failed_task_results_are_not_memoized() {
    let runtime = runtime();
    let calls = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&calls);
    runtime
        .register_task(
            TaskDefinition::from_fn("flaky", move |_input, ctx| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ReflowError::task_failed(ctx.task_id.as_str(), "cold start"))
                    } else {
                        Ok(json!("warm"))
                    }
                }
            })
            .cached(),
        )
        .unwrap();

    let flaky = TaskId::new("flaky");
    assert!(runtime
        .execute_task(&flaky, json!({}), Value::Null, ExecuteOptions::default())
        .await
        .is_err());
    assert_eq!(
        runtime
            .execute_task(&flaky, json!({}), Value::Null, ExecuteOptions::default())
            .await
            .unwrap(),
        json!("warm")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(runtime.telemetry().counter(telemetry::TASKS_FAILED), 1);
}

#[tokio::test]
async fn memoized_results_still_require_valid_input() {
    let runtime = runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    runtime
        .register_task(
            TaskDefinition::from_fn("charge", move |_input: Value, _ctx| {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Ok(json!("charged")) }
            })
            .with_input_schema(Schema::object_with_required(["amount"]))
            .cached(),
        )
        .unwrap();
    let charge = TaskId::new("charge");

    let unchecked = runtime
        .execute_task(
            &charge,
            json!({}),
            Value::Null,
            ExecuteOptions::default().without_validation(),
        )
        .await
        .unwrap();
    assert_eq!(unchecked, json!("charged"));

    let err = runtime
        .execute_task(&charge, json!({}), Value::Null, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    for _ in 0..2 {
        runtime
            .execute_task(&charge, json!({"amount": 5}), Value::Null, ExecuteOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(runtime.telemetry().counter(telemetry::CACHE_HITS), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_are_counted() {
    let runtime = runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    runtime
        .register_task(
            TaskDefinition::from_fn("eventually", move |_input, ctx| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ReflowError::task_failed(ctx.task_id.as_str(), "busy"))
                    } else {
                        Ok(json!(n))
                    }
                }
            })
            .with_retry(RetryPolicy::exponential(2, 100)),
        )
        .unwrap();

    let out = runtime
        .execute_task(
            &TaskId::new("eventually"),
            json!({}),
            Value::Null,
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(out, json!(2));
    assert_eq!(runtime.telemetry().counter(telemetry::TASKS_RETRIED), 2);
}

#[tokio::test]
async fn flows_run_through_the_runtime() {
    let runtime = runtime();
    runtime
        .register_task(TaskDefinition::from_fn("reserve", |input: Value, _ctx| async move {
            Ok(json!({"reservation": format!("R-{}", input["sku"].as_str().unwrap_or("?"))}))
        }))
        .unwrap();
    runtime
        .register_flow(
            Flow::new("fulfil")
                .with_step(FlowStep::condition(
                    "in-stock?",
                    |input, _ctx| input["stock"].as_i64().unwrap_or(0) > 0,
                    vec![StepId::new("reserve")],
                    vec![],
                ))
                .with_step(
                    FlowStep::task("reserve", "reserve")
                        .with_input(InputBinding::parse("sku", "input.sku").unwrap())
                        .with_output(
                            OutputBinding::parse("reservation", "output.reservation").unwrap(),
                        ),
                ),
        )
        .unwrap();

    let result = runtime
        .execute_flow(
            &"fulfil".into(),
            json!({"sku": "A1", "stock": 4}),
            FlowOptions::default(),
        )
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.output, json!({"reservation": "R-A1"}));
    // testing preset traces by default
    assert_eq!(result.trace.map(|t| t.len()), Some(2));
    assert_eq!(runtime.telemetry().counter(telemetry::FLOWS_SUCCEEDED), 1);
}

#[tokio::test(start_paused = true)]
async fn flow_timeouts_apply_through_the_runtime() {
    let mut config = RuntimeConfig::testing();
    config.flows.default_timeout_ms = 50;
    let runtime = ReflowRuntime::bootstrap(config).unwrap();
    runtime
        .register_flow(
            Flow::new("nap").with_step(FlowStep::wait("sleep", Duration::from_secs(1))),
        )
        .unwrap();
    runtime
        .register_flow(
            Flow::new("long-nap")
                .with_step(FlowStep::wait("sleep", Duration::from_secs(5)))
                .with_timeout(Duration::from_millis(200)),
        )
        .unwrap();

    let defaulted = runtime
        .execute_flow(&"nap".into(), json!({}), FlowOptions::default())
        .await
        .unwrap();
    assert!(!defaulted.success);
    assert!(matches!(
        defaulted.error,
        Some(ReflowError::FlowTimeout { timeout_ms: 50, .. })
    ));

    let own = runtime
        .execute_flow(&"long-nap".into(), json!({}), FlowOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        own.error,
        Some(ReflowError::FlowTimeout { timeout_ms: 200, .. })
    ));
    assert_eq!(runtime.telemetry().counter(telemetry::FLOWS_FAILED), 2);
}

#[tokio::test]
async fn looping_flows_are_rejected() {
    let runtime = runtime();
    let err = runtime
        .register_flow(
            Flow::new("loop")
                .with_step(FlowStep::task("a", "noop").then("b"))
                .with_step(FlowStep::task("b", "noop").then("a"))
                .with_timeout(Duration::from_millis(100)),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert!(runtime.get_flow(&"loop".into()).is_none());
}

#[tokio::test]
async fn distributed_tier_serves_evicted_lookups() {
    let mut config = RuntimeConfig::testing();
    config.cache.local_capacity = 1;
    let distributed = Arc::new(InMemoryDistributedCache::new());
    let runtime = ReflowRuntime::builder()
        .with_config(config)
        .with_distributed_cache(distributed.clone())
        .build()
        .unwrap();
    runtime.register_process(order_process()).unwrap();

    let first = runtime
        .create_process(
            &ProcessId::new("order-process"),
            order_context("a"),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    runtime
        .create_process(
            &ProcessId::new("order-process"),
            order_context("b"),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    // `first` was evicted locally but still lives in the distributed tier
    let fetched = runtime.get_process(&first.id).await.unwrap();
    assert_eq!(fetched.id, first.id);
    let stats = runtime.cache_stats();
    assert_eq!(stats.local_capacity, 1);
    assert_eq!(stats.distributed_hits, 1);
    assert!(stats.evictions >= 1);
}

#[tokio::test]
async fn instances_survive_save_and_restore() {
    let store = InMemoryStateStore::new();

    let original = runtime();
    let order = original
        .create_process(
            &ProcessId::new("order-process"),
            order_context("5"),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    original
        .transition_process(&order.id, "START", None)
        .await
        .unwrap();
    assert_eq!(original.save_instances(&store).await.unwrap(), 1);
    original.shutdown();

    let restarted = runtime();
    assert_eq!(restarted.restore_instances(&store).await.unwrap(), 1);
    let restored = restarted.get_process(&order.id).await.unwrap();
    assert_eq!(restored.state, "processing");
    assert_eq!(restored.history.len(), 1);

    let completed = restarted
        .transition_process(&order.id, "COMPLETE", None)
        .await
        .unwrap();
    assert!(completed.is_applied());
}

#[tokio::test]
async fn restore_from_empty_store_loads_nothing() {
    let runtime = runtime();
    assert_eq!(
        runtime
            .restore_instances(&InMemoryStateStore::new())
            .await
            .unwrap(),
        0
    );
}

#[test]
fn runtime_is_usable_from_sync_code() {
    let runtime = runtime();
    let order = tokio_test::block_on(runtime.create_process(
        &ProcessId::new("order-process"),
        order_context("sync"),
        CreateOptions::default(),
    ))
    .unwrap();

    let result = tokio_test::block_on(runtime.transition_process(&order.id, "START", None))
        .unwrap();
    assert!(result.is_applied());
    assert_eq!(runtime.processes_in_state(&"order-process".into(), "processing").len(), 1);
}
