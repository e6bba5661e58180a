//! The Reflow runtime: composition root of bus, engines, cache and
//! telemetry

use crate::config::RuntimeConfig;
use crate::store::{StateStore, INSTANCES_KEY};
use crate::telemetry::{self, MetricsSink, NoopMetricsSink, RuntimeTelemetry, TelemetrySnapshot};
use crate::transaction::Transaction;
use reflow_cache::{DistributedCacheProvider, TieredCache, TieredCacheStats};
use reflow_engine::{
    CreateOptions, EventBus, ExecuteOptions, FlowEngine, FlowOptions, FlowResult,
    HandlerResult, InstanceRepository, ProcessEngine, ProcessHooks, Subscription, TaskManager,
    TaskMiddleware, TransitionResult,
};
use reflow_types::{
    events, Context, Event, Flow, FlowId, InstanceId, ProcessDefinition, ProcessId,
    ProcessInstance, ReflowError, ReflowResult, TaskDefinition, TaskId, TransactionId, WILDCARD,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const SOURCE: &str = "runtime";

/// Cache key of a memoized process lookup
pub fn process_cache_key(id: &InstanceId) -> String {
    format!("process:{}", id)
}

/// Cache key of a memoized task result: task id plus the SHA-256 of the
/// input's compact JSON (object keys are sorted, so equal inputs agree)
pub fn task_result_key(task_id: &TaskId, input: &Value) -> String {
    let digest = Sha256::digest(input.to_string().as_bytes());
    format!("task:{}:{}", task_id, hex::encode(digest))
}

/// The Reflow runtime
///
/// Cheap to clone; clones share every component.
#[derive(Clone)]
pub struct ReflowRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,

    // ── Engines ──────────────────────────────────────────────────────
    bus: EventBus,
    repository: Arc<InstanceRepository>,
    processes: ProcessEngine,
    tasks: Arc<TaskManager>,
    flows: FlowEngine,

    // ── Caching and observability ────────────────────────────────────
    cache: TieredCache,
    telemetry: Arc<RuntimeTelemetry>,

    shutdown: AtomicBool,
}

/// Assembles a [`ReflowRuntime`] with optional collaborators
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    distributed: Option<Arc<dyn DistributedCacheProvider>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    hooks: Vec<Arc<dyn ProcessHooks>>,
}

impl RuntimeBuilder {
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_distributed_cache(mut self, provider: Arc<dyn DistributedCacheProvider>) -> Self {
        self.distributed = Some(provider);
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    pub fn with_process_hooks(mut self, hooks: Arc<dyn ProcessHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn build(self) -> ReflowResult<ReflowRuntime> {
        let config = self.config;
        if config.cache.local_capacity == 0 {
            return Err(ReflowError::validation(
                "cache.local_capacity must be at least 1",
            ));
        }

        tracing::info!("Bootstrapping Reflow runtime");

        let bus = EventBus::new();
        let repository = Arc::new(InstanceRepository::new());

        let processes = self
            .hooks
            .into_iter()
            .fold(ProcessEngine::new(Arc::clone(&repository), bus.clone()), |engine, hooks| {
                engine.with_hooks(hooks)
            });

        let tasks = Arc::new(
            TaskManager::new(bus.clone()).with_default_timeout(config.tasks.default_timeout()),
        );
        let flows = FlowEngine::new(Arc::clone(&tasks), bus.clone())
            .with_default_timeout(Some(config.flows.default_timeout()))
            .with_trace_by_default(config.flows.trace_by_default);

        let mut cache = TieredCache::new(config.cache.local_capacity);
        if let Some(ttl) = config.cache.distributed_ttl() {
            cache = cache.with_default_ttl(ttl);
        }
        if let Some(provider) = self.distributed {
            tracing::debug!("Distributed cache tier enabled");
            cache = cache.with_distributed(provider);
        }

        let sink = self
            .metrics_sink
            .unwrap_or_else(|| Arc::new(NoopMetricsSink));
        let telemetry = Arc::new(RuntimeTelemetry::new(&config.telemetry, sink));

        let inner = RuntimeInner {
            config,
            bus,
            repository,
            processes,
            tasks,
            flows,
            cache,
            telemetry,
            shutdown: AtomicBool::new(false),
        };
        let runtime = ReflowRuntime {
            inner: Arc::new(inner),
        };
        runtime.install_bus_observers();

        tracing::info!("Reflow runtime bootstrapped");
        Ok(runtime)
    }
}

impl ReflowRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Bootstrap with `config` and no optional collaborators
    pub fn bootstrap(config: RuntimeConfig) -> ReflowResult<Self> {
        Self::builder().with_config(config).build()
    }

    fn install_bus_observers(&self) {
        // Retries happen inside the task manager, which reports them on the bus
        let counters = Arc::clone(&self.inner.telemetry);
        let _ = self.inner.bus.subscribe(events::TASK_RETRY, move |_| {
            counters.increment(telemetry::TASKS_RETRIED);
            Ok(())
        });

        if self.inner.config.telemetry.log_events {
            let _ = self.inner.bus.subscribe(WILDCARD, |event| {
                tracing::debug!(
                    event_type = %event.event_type,
                    source = event.source.as_deref().unwrap_or("-"),
                    payload = %event.payload,
                    "Event"
                );
                Ok(())
            });
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> ReflowResult<()> {
        if self.is_shut_down() {
            return Err(ReflowError::validation("runtime is shut down"));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // REGISTRATION
    // ═══════════════════════════════════════════════════════════════════

    pub fn register_process(&self, definition: ProcessDefinition) -> ReflowResult<()> {
        self.ensure_running()?;
        self.inner.processes.register_definition(definition)
    }

    pub fn get_definition(&self, id: &ProcessId) -> Option<Arc<ProcessDefinition>> {
        self.inner.processes.get_definition(id)
    }

    pub fn register_task(&self, definition: TaskDefinition) -> ReflowResult<()> {
        self.ensure_running()?;
        self.inner.tasks.register_task(definition);
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<Arc<TaskDefinition>> {
        self.inner.tasks.get_task(id)
    }

    pub fn register_flow(&self, flow: Flow) -> ReflowResult<()> {
        self.ensure_running()?;
        self.inner.flows.register_flow(flow)
    }

    pub fn get_flow(&self, id: &FlowId) -> Option<Arc<Flow>> {
        self.inner.flows.get_flow(id)
    }

    pub fn add_task_middleware(&self, middleware: Arc<dyn TaskMiddleware>) -> ReflowResult<()> {
        self.ensure_running()?;
        self.inner.tasks.add_middleware(middleware);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // EVENTS
    // ═══════════════════════════════════════════════════════════════════

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(event_type, handler)
    }

    pub fn subscribe_async<F, Fut>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.bus.subscribe_async(event_type, handler)
    }

    pub fn emit(&self, event: Event) {
        self.inner.bus.emit(event);
    }

    // ═══════════════════════════════════════════════════════════════════
    // PROCESSES
    // ═══════════════════════════════════════════════════════════════════

    pub async fn create_process(
        &self,
        process_id: &ProcessId,
        context: Context,
        options: CreateOptions,
    ) -> ReflowResult<ProcessInstance> {
        self.ensure_running()?;
        let instance = self
            .inner
            .processes
            .create_process(process_id, context, options)?;
        self.inner.telemetry.increment(telemetry::PROCESSES_CREATED);
        self.cache_process(&instance).await;
        Ok(instance)
    }

    /// Look up an instance, memoized in the tiered cache
    pub async fn get_process(&self, id: &InstanceId) -> ReflowResult<ProcessInstance> {
        let key = process_cache_key(id);
        if self.inner.config.cache.cache_process_lookups {
            if let Some(instance) = self.inner.cache.get_as::<ProcessInstance>(&key).await {
                self.inner.telemetry.increment(telemetry::CACHE_HITS);
                return Ok(instance);
            }
            self.inner.telemetry.increment(telemetry::CACHE_MISSES);
        }

        let instance = self.inner.processes.get_process(id)?;
        self.cache_process(&instance).await;
        Ok(instance)
    }

    pub fn get_all_processes(&self) -> Vec<ProcessInstance> {
        self.inner.processes.get_all_processes()
    }

    pub fn processes_in_state(&self, process_id: &ProcessId, state: &str) -> Vec<ProcessInstance> {
        self.inner.processes.processes_in_state(process_id, state)
    }

    pub async fn transition_process(
        &self,
        id: &InstanceId,
        event_type: &str,
        payload: Option<Value>,
    ) -> ReflowResult<TransitionResult> {
        self.ensure_running()?;
        let result = self
            .inner
            .processes
            .transition_process(id, event_type, payload)?;

        if result.is_applied() {
            self.inner.telemetry.increment(telemetry::TRANSITIONS_APPLIED);
            // Re-read so an overlapping transition cannot leave an older copy cached
            if let Some(current) = self.inner.repository.get(id) {
                self.cache_process(&current).await;
            }
        } else {
            self.inner.telemetry.increment(telemetry::TRANSITIONS_REJECTED);
        }
        Ok(result)
    }

    pub async fn delete_process(&self, id: &InstanceId) -> ReflowResult<ProcessInstance> {
        self.ensure_running()?;
        let removed = self.inner.processes.delete_process(id)?;
        self.inner.cache.delete(&process_cache_key(id)).await;
        self.inner.telemetry.increment(telemetry::PROCESSES_DELETED);
        Ok(removed)
    }

    async fn cache_process(&self, instance: &ProcessInstance) {
        if !self.inner.config.cache.cache_process_lookups {
            return;
        }
        if let Err(e) = self
            .inner
            .cache
            .set_as(&process_cache_key(&instance.id), instance)
            .await
        {
            tracing::warn!(instance_id = %instance.id, error = %e, "Failed to cache process instance");
        }
    }

    async fn invalidate_processes<'a>(&self, ids: impl IntoIterator<Item = &'a InstanceId>) {
        for id in ids {
            self.inner.cache.delete(&process_cache_key(id)).await;
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // TASKS AND FLOWS
    // ═══════════════════════════════════════════════════════════════════

    /// Execute a task. Results of tasks marked `cache_results` are
    /// memoized by input when result caching is enabled.
    ///
    /// Calls that skip validation never read or write the memo, and the
    /// input schema is checked before a memoized result is served.
    pub async fn execute_task(
        &self,
        task_id: &TaskId,
        input: Value,
        context: Value,
        options: ExecuteOptions,
    ) -> ReflowResult<Value> {
        self.ensure_running()?;

        let cache_key = self.task_cache_key(task_id, &input, &options)?;
        if let Some(key) = &cache_key {
            if let Some(cached) = self.inner.cache.get(key).await {
                self.inner.telemetry.increment(telemetry::CACHE_HITS);
                tracing::debug!(task_id = %task_id, "Task result served from cache");
                return Ok(cached);
            }
            self.inner.telemetry.increment(telemetry::CACHE_MISSES);
        }

        let clock = Instant::now();
        let result = self
            .inner
            .tasks
            .execute_task(task_id, input, context, options)
            .await;
        self.inner
            .telemetry
            .task_finished(result.is_ok(), clock.elapsed().as_millis() as u64);

        if let (Some(key), Ok(output)) = (&cache_key, &result) {
            self.inner.cache.set(key, output.clone()).await;
        }
        result
    }

    fn task_cache_key(
        &self,
        task_id: &TaskId,
        input: &Value,
        options: &ExecuteOptions,
    ) -> ReflowResult<Option<String>> {
        if options.skip_validation || !self.inner.config.cache.cache_task_results {
            return Ok(None);
        }
        let Some(definition) = self
            .inner
            .tasks
            .get_task(task_id)
            .filter(|definition| definition.cache_results)
        else {
            return Ok(None);
        };
        if let Some(schema) = &definition.input_schema {
            schema.validate(input)?;
        }
        Ok(Some(task_result_key(task_id, input)))
    }

    pub async fn execute_flow(
        &self,
        flow_id: &FlowId,
        input: Value,
        options: FlowOptions,
    ) -> ReflowResult<FlowResult> {
        self.ensure_running()?;
        let clock = Instant::now();
        let result = self.inner.flows.execute_flow(flow_id, input, options).await?;
        self.inner
            .telemetry
            .flow_finished(result.success, clock.elapsed().as_millis() as u64);
        Ok(result)
    }

    // ═══════════════════════════════════════════════════════════════════
    // TRANSACTIONS
    // ═══════════════════════════════════════════════════════════════════

    /// Snapshot every process instance and open a transaction
    pub fn begin_transaction(&self) -> ReflowResult<Transaction> {
        self.ensure_running()?;
        let snapshot = self.inner.repository.all();
        let transaction = Transaction::begin(self.clone(), snapshot);

        tracing::info!(transaction_id = %transaction.id(), "Transaction begun");
        self.emit_transaction_event(events::TRANSACTION_BEGUN, transaction.id());
        Ok(transaction)
    }

    pub(crate) fn transaction_committed(&self, id: &TransactionId, operations: usize) {
        tracing::info!(transaction_id = %id, operations, "Transaction committed");
        self.inner
            .telemetry
            .increment(telemetry::TRANSACTIONS_COMMITTED);
        self.emit_transaction_event(events::TRANSACTION_COMMITTED, id);
    }

    /// Put the instance store back to `snapshot` and drop affected cache
    /// entries
    pub(crate) async fn rolled_back(&self, id: &TransactionId, snapshot: Vec<ProcessInstance>) {
        let affected: BTreeSet<InstanceId> = self
            .inner
            .repository
            .all()
            .into_iter()
            .chain(snapshot.iter().cloned())
            .map(|instance| instance.id)
            .collect();

        let restored = snapshot.len();
        self.inner.repository.restore(snapshot);
        self.invalidate_processes(&affected).await;

        tracing::info!(transaction_id = %id, restored, "Transaction rolled back");
        self.inner
            .telemetry
            .increment(telemetry::TRANSACTIONS_ROLLED_BACK);
        self.emit_transaction_event(events::TRANSACTION_ROLLED_BACK, id);
    }

    fn emit_transaction_event(&self, event_type: &str, id: &TransactionId) {
        self.inner.bus.emit(
            Event::new(event_type)
                .with_source(SOURCE)
                .with_payload(json!({ "transactionId": id })),
        );
    }

    // ═══════════════════════════════════════════════════════════════════
    // PERSISTENCE
    // ═══════════════════════════════════════════════════════════════════

    pub fn export_instances(&self) -> Vec<ProcessInstance> {
        self.inner.processes.export_instances()
    }

    /// Upsert persisted instances. Returns how many were loaded.
    pub async fn load_instances(&self, instances: Vec<ProcessInstance>) -> ReflowResult<usize> {
        self.ensure_running()?;
        let ids: Vec<InstanceId> = instances.iter().map(|i| i.id.clone()).collect();
        let count = self.inner.processes.load_instances(instances);
        self.invalidate_processes(&ids).await;
        Ok(count)
    }

    pub async fn save_instances(&self, store: &dyn StateStore) -> ReflowResult<usize> {
        let instances = self.export_instances();
        let count = instances.len();
        let document =
            serde_json::to_value(&instances).map_err(|e| ReflowError::Storage(e.to_string()))?;
        store.set(INSTANCES_KEY, document).await?;
        tracing::info!(count, "Saved process instances");
        Ok(count)
    }

    pub async fn restore_instances(&self, store: &dyn StateStore) -> ReflowResult<usize> {
        let Some(document) = store.get(INSTANCES_KEY).await? else {
            tracing::debug!("No saved process instances");
            return Ok(0);
        };
        let instances: Vec<ProcessInstance> =
            serde_json::from_value(document).map_err(|e| ReflowError::Storage(e.to_string()))?;
        let count = self.load_instances(instances).await?;
        tracing::info!(count, "Restored process instances");
        Ok(count)
    }

    // ═══════════════════════════════════════════════════════════════════
    // OBSERVABILITY AND LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════

    pub fn cache(&self) -> &TieredCache {
        &self.inner.cache
    }

    pub fn cache_stats(&self) -> TieredCacheStats {
        self.inner.cache.stats()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.inner.telemetry.snapshot()
    }

    /// Stop accepting mutating calls, drop all bus subscriptions and flush
    /// telemetry. Calling it again is a no-op.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            tracing::warn!("Runtime already shut down");
            return;
        }
        tracing::info!("Shutting down Reflow runtime");

        self.inner.bus.clear();
        self.inner.telemetry.gauge(
            telemetry::CACHE_LOCAL_ENTRIES,
            self.inner.cache.stats().local_entries as f64,
        );
        self.inner.telemetry.flush();

        tracing::info!("Reflow runtime shutdown complete");
    }
}

impl std::fmt::Debug for ReflowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflowRuntime")
            .field("instances", &self.inner.repository.len())
            .field("cache", &self.inner.cache)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
