//! Flow engine: executes linked walks of task, condition, parallel and
//! wait steps
//!
//! Execution starts at the first step and follows `next` pointers. Branch
//! lists (condition and parallel) execute each listed step by itself; they
//! do not follow that step's `next` chain.
//!
//! The flow timeout drops the walk future, so in-flight steps are cancelled
//! at their next await point and the partial trace is still reported.

use crate::event_bus::EventBus;
use crate::task::{ExecuteOptions, TaskManager};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use reflow_types::events;
use reflow_types::{
    set_path, Context, Event, Flow, FlowId, FlowStep, InputBinding, InputSource, OutputBinding,
    PathRoot, ReflowError, ReflowResult, StepId, StepKind, TaskId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SOURCE: &str = "flow-engine";

/// Per-call options for `execute_flow`
#[derive(Clone, Debug, Default)]
pub struct FlowOptions {
    /// Overrides the flow's own timeout and the engine default
    pub timeout: Option<Duration>,
    /// Record a per-step trace; `None` uses the engine default
    pub trace: Option<bool>,
    /// Initial `variables`
    pub variables: Context,
}

impl FlowOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_trace(mut self) -> Self {
        self.trace = Some(true);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// One executed step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub step_id: StepId,
    pub step_type: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a flow execution. Step failures land here, not in `Err`.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<ReflowError>,
    pub trace: Option<Vec<TraceEntry>>,
}

/// Mutable state threaded through one execution
#[derive(Clone, Debug)]
struct ExecutionState {
    input: Value,
    output: Value,
    variables: Value,
    trace: Option<Vec<TraceEntry>>,
}

impl ExecutionState {
    fn new(input: Value, variables: Context, trace: bool) -> Self {
        Self {
            input,
            output: Value::Object(Map::new()),
            variables: Value::Object(variables),
            trace: trace.then(Vec::new),
        }
    }

    /// Isolated copy for a parallel branch
    fn fork(&self) -> Self {
        Self {
            input: self.input.clone(),
            output: Value::Object(Map::new()),
            variables: self.variables.clone(),
            trace: self.trace.as_ref().map(|_| Vec::new()),
        }
    }

    /// What condition predicates see as their second argument
    fn view(&self) -> Value {
        json!({
            "input": self.input,
            "output": self.output,
            "variables": self.variables,
        })
    }

    fn root(&self, root: PathRoot) -> &Value {
        match root {
            PathRoot::Input => &self.input,
            PathRoot::Variables => &self.variables,
            PathRoot::Output => &self.output,
        }
    }

    fn root_mut(&mut self, root: PathRoot) -> ReflowResult<&mut Value> {
        match root {
            PathRoot::Input => Err(ReflowError::validation("flow input is read-only")),
            PathRoot::Variables => Ok(&mut self.variables),
            PathRoot::Output => Ok(&mut self.output),
        }
    }

    fn resolve_input(&self, bindings: &[InputBinding]) -> Value {
        let mut task_input = Value::Object(Map::new());
        for binding in bindings {
            let value = match &binding.source {
                InputSource::Literal(value) => value.clone(),
                InputSource::Path(path) => path
                    .lookup(self.root(path.root))
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            let key: Vec<&str> = binding.key.split('.').collect();
            set_path(&mut task_input, &key, value);
        }
        task_input
    }

    fn apply_output(
        &mut self,
        step_id: &StepId,
        bindings: &[OutputBinding],
        result: Value,
    ) -> ReflowResult<()> {
        if bindings.is_empty() {
            set_path(&mut self.variables, &[step_id.as_str()], result);
            return Ok(());
        }
        for binding in bindings {
            let value = reflow_types::get_path(&result, &binding.from)
                .cloned()
                .unwrap_or(Value::Null);
            binding.to.assign(self.root_mut(binding.to.root)?, value);
        }
        Ok(())
    }
}

/// Registry and executor of flows
pub struct FlowEngine {
    flows: DashMap<FlowId, Arc<Flow>>,
    tasks: Arc<TaskManager>,
    bus: EventBus,
    default_timeout: Option<Duration>,
    trace_by_default: bool,
}

impl FlowEngine {
    pub fn new(tasks: Arc<TaskManager>, bus: EventBus) -> Self {
        Self {
            flows: DashMap::new(),
            tasks,
            bus,
            default_timeout: None,
            trace_by_default: false,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_trace_by_default(mut self, trace: bool) -> Self {
        self.trace_by_default = trace;
        self
    }

    pub fn register_flow(&self, flow: Flow) -> ReflowResult<()> {
        flow.validate()?;
        let id = flow.id.clone();
        if self.flows.insert(id.clone(), Arc::new(flow)).is_some() {
            tracing::warn!(flow_id = %id, "Replaced existing flow");
        } else {
            tracing::info!(flow_id = %id, "Registered flow");
        }
        Ok(())
    }

    pub fn get_flow(&self, id: &FlowId) -> Option<Arc<Flow>> {
        self.flows.get(id).map(|f| Arc::clone(f.value()))
    }

    pub fn flow_ids(&self) -> Vec<FlowId> {
        let mut ids: Vec<FlowId> = self.flows.iter().map(|f| f.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Run a registered flow.
    ///
    /// Only an unknown flow id is an `Err`; step failures and timeouts are
    /// reported through `FlowResult`.
    pub async fn execute_flow(
        &self,
        flow_id: &FlowId,
        input: Value,
        options: FlowOptions,
    ) -> ReflowResult<FlowResult> {
        let flow = self
            .get_flow(flow_id)
            .ok_or_else(|| ReflowError::FlowNotFound(flow_id.to_string()))?;

        let trace = options.trace.unwrap_or(self.trace_by_default);
        let mut state = ExecutionState::new(input, options.variables, trace);
        let timeout = options.timeout.or(flow.timeout).or(self.default_timeout);

        tracing::info!(flow_id = %flow_id, "Flow started");
        self.emit(events::FLOW_STARTED, json!({"flowId": flow_id}));
        let clock = Instant::now();

        let start = flow.first_step().map(|s| s.id.clone());
        let walk = self.walk(&flow, start, &mut state);
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, walk).await {
                Ok(result) => result,
                Err(_) => Err(ReflowError::FlowTimeout {
                    flow_id: flow_id.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => walk.await,
        };
        let duration_ms = clock.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                tracing::info!(flow_id = %flow_id, duration_ms, "Flow completed");
                self.emit(
                    events::FLOW_COMPLETED,
                    json!({"flowId": flow_id, "durationMs": duration_ms}),
                );
                Ok(FlowResult {
                    success: true,
                    output: state.output,
                    error: None,
                    trace: state.trace,
                })
            }
            Err(error) => {
                tracing::warn!(flow_id = %flow_id, duration_ms, error = %error, "Flow failed");
                self.emit(
                    events::FLOW_FAILED,
                    json!({
                        "flowId": flow_id,
                        "durationMs": duration_ms,
                        "error": error.to_string(),
                        "kind": error.kind(),
                    }),
                );
                Ok(FlowResult {
                    success: false,
                    output: state.output,
                    error: Some(error),
                    trace: state.trace,
                })
            }
        }
    }

    /// Follow `next` pointers from `start`
    async fn walk(
        &self,
        flow: &Flow,
        start: Option<StepId>,
        state: &mut ExecutionState,
    ) -> ReflowResult<()> {
        let mut current = start;
        while let Some(step_id) = current {
            let step = lookup_step(flow, &step_id)?;
            if let Err(error) = self.run_step(flow, step, state).await {
                if !step.continue_on_error {
                    return Err(error);
                }
                tracing::debug!(flow_id = %flow.id, step_id = %step.id, "Continuing past failed step");
            }
            current = step.next.clone();
        }
        Ok(())
    }

    /// Run each listed step in order. Stops at the first failure unless
    /// `continue_on_error`, in which case the first failure is returned
    /// after the whole list ran.
    async fn run_branch(
        &self,
        flow: &Flow,
        branch: &[StepId],
        state: &mut ExecutionState,
        continue_on_error: bool,
    ) -> ReflowResult<()> {
        let mut first_error = None;
        for step_id in branch {
            let step = lookup_step(flow, step_id)?;
            if let Err(error) = self.run_step(flow, step, state).await {
                if !continue_on_error {
                    return Err(error);
                }
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn run_step<'a>(
        &'a self,
        flow: &'a Flow,
        step: &'a FlowStep,
        state: &'a mut ExecutionState,
    ) -> BoxFuture<'a, ReflowResult<()>> {
        async move {
            let started_at = Utc::now();
            let clock = Instant::now();
            tracing::debug!(flow_id = %flow.id, step_id = %step.id, step_type = step.kind.name(), "Running step");

            let result = match &step.kind {
                StepKind::Task {
                    task_id,
                    input_mapping,
                    output_mapping,
                } => {
                    self.run_task(flow, step, task_id, input_mapping, output_mapping, state)
                        .await
                }
                StepKind::Condition {
                    predicate,
                    true_branch,
                    false_branch,
                } => {
                    let taken = predicate(&state.input, &state.view());
                    tracing::debug!(step_id = %step.id, taken, "Condition evaluated");
                    let branch = if taken { true_branch } else { false_branch };
                    self.run_branch(flow, branch, state, step.continue_on_error)
                        .await
                }
                StepKind::Parallel { branches } => {
                    self.run_parallel(flow, branches, state, step.continue_on_error)
                        .await
                }
                StepKind::Wait { duration } => {
                    tokio::time::sleep(*duration).await;
                    Ok(())
                }
            };

            let duration_ms = clock.elapsed().as_millis() as u64;
            self.record(flow, step, state, started_at, duration_ms, &result);
            result
        }
        .boxed()
    }

    async fn run_task(
        &self,
        flow: &Flow,
        step: &FlowStep,
        task_id: &TaskId,
        input_mapping: &[InputBinding],
        output_mapping: &[OutputBinding],
        state: &mut ExecutionState,
    ) -> ReflowResult<()> {
        let task_input = if input_mapping.is_empty() {
            state.input.clone()
        } else {
            state.resolve_input(input_mapping)
        };
        let context = json!({
            "flowId": flow.id,
            "stepId": step.id,
            "variables": state.variables,
        });

        let result = self
            .tasks
            .execute_task(task_id, task_input, context, ExecuteOptions::default())
            .await?;
        state.apply_output(&step.id, output_mapping, result)
    }

    async fn run_parallel(
        &self,
        flow: &Flow,
        branches: &[Vec<StepId>],
        state: &mut ExecutionState,
        continue_on_error: bool,
    ) -> ReflowResult<()> {
        let forks: Vec<ExecutionState> = branches.iter().map(|_| state.fork()).collect();
        let runs = branches.iter().zip(forks).map(|(branch, mut fork)| async move {
            let result = self
                .run_branch(flow, branch, &mut fork, continue_on_error)
                .await;
            (fork, result)
        });

        // Every branch runs to completion even when a sibling fails
        let mut first_error = None;
        for (index, (fork, result)) in join_all(runs).await.into_iter().enumerate() {
            set_path(&mut state.output, &[format!("branch{index}")], fork.output);
            if let (Value::Object(parent), Value::Object(branch_vars)) =
                (&mut state.variables, fork.variables)
            {
                parent.extend(branch_vars);
            }
            if let (Some(trace), Some(branch_trace)) = (state.trace.as_mut(), fork.trace) {
                trace.extend(branch_trace);
            }
            if let Err(error) = result {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn record(
        &self,
        flow: &Flow,
        step: &FlowStep,
        state: &mut ExecutionState,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        result: &ReflowResult<()>,
    ) {
        let error = result.as_ref().err().map(ToString::to_string);
        let status = if error.is_some() {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };

        if let Some(trace) = state.trace.as_mut() {
            trace.push(TraceEntry {
                step_id: step.id.clone(),
                step_type: step.kind.name().to_string(),
                status,
                started_at,
                duration_ms,
                error: error.clone(),
            });
        }

        let event_type = match status {
            StepStatus::Completed => events::FLOW_STEP_COMPLETED,
            StepStatus::Failed => events::FLOW_STEP_FAILED,
        };
        self.emit(
            event_type,
            json!({
                "flowId": flow.id,
                "stepId": step.id,
                "stepType": step.kind.name(),
                "durationMs": duration_ms,
                "error": error,
            }),
        );
    }

    fn emit(&self, event_type: &str, payload: Value) {
        self.bus.emit(
            Event::new(event_type)
                .with_source(SOURCE)
                .with_payload(payload),
        );
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("flows", &self.flow_ids())
            .field("default_timeout", &self.default_timeout)
            .field("trace_by_default", &self.trace_by_default)
            .finish()
    }
}

fn lookup_step<'a>(flow: &'a Flow, id: &StepId) -> ReflowResult<&'a FlowStep> {
    flow.step(id).ok_or_else(|| {
        ReflowError::validation(format!("flow '{}' has no step '{}'", flow.id, id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflow_types::{ErrorKind, TaskDefinition};
    use std::sync::Mutex;

    fn engines() -> (Arc<TaskManager>, FlowEngine) {
        let bus = EventBus::new();
        let tasks = Arc::new(TaskManager::new(bus.clone()));
        tasks.register_task(TaskDefinition::from_fn("total", |input: Value, _ctx| async move {
            let sum: i64 = input["items"]
                .as_array()
                .map(|items| items.iter().filter_map(Value::as_i64).sum())
                .unwrap_or(0);
            Ok(json!({"total": sum, "currency": input["currency"]}))
        }));
        tasks.register_task(TaskDefinition::from_fn("echo", |input: Value, _ctx| async move {
            Ok(input)
        }));
        tasks.register_task(TaskDefinition::from_fn("fail", |_input, ctx| async move {
            Err::<Value, _>(ReflowError::task_failed(ctx.task_id.as_str(), "declined"))
        }));
        let flows = FlowEngine::new(Arc::clone(&tasks), bus);
        (tasks, flows)
    }

    #[tokio::test]
    async fn test_mappings_thread_values_through_steps() {
        let (_tasks, flows) = engines();
        flows
            .register_flow(
                Flow::new("checkout")
                    .with_step(
                        FlowStep::task("sum", "total")
                            .with_input(InputBinding::parse("items", "input.order.items").unwrap())
                            .with_input(InputBinding::parse("currency", "'EUR'").unwrap())
                            .with_output(OutputBinding::parse("total", "variables.amount").unwrap())
                            .then("receipt"),
                    )
                    .with_step(
                        FlowStep::task("receipt", "echo")
                            .with_input(InputBinding::parse("charged", "variables.amount").unwrap())
                            .with_output(OutputBinding::parse("", "output.receipt").unwrap()),
                    ),
            )
            .unwrap();

        let result = flows
            .execute_flow(
                &FlowId::new("checkout"),
                json!({"order": {"items": [2, 3, 5]}}),
                FlowOptions::default(),
            )
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output, json!({"receipt": {"charged": 10}}));
        assert!(result.trace.is_none());
    }

    #[tokio::test]
    async fn test_unmapped_task_gets_flow_input_and_stores_by_step_id() {
        let (_tasks, flows) = engines();
        flows
            .register_flow(
                Flow::new("f")
                    .with_step(FlowStep::task("first", "echo").then("second"))
                    .with_step(
                        FlowStep::task("second", "echo")
                            .with_input(InputBinding::parse("copy", "variables.first.x").unwrap())
                            .with_output(OutputBinding::parse("copy", "output.copy").unwrap()),
                    ),
            )
            .unwrap();

        let result = flows
            .execute_flow(&FlowId::new("f"), json!({"x": 1}), FlowOptions::default())
            .await
            .unwrap();
        assert_eq!(result.output, json!({"copy": 1}));
    }

    #[tokio::test]
    async fn test_condition_selects_branch() {
        let (_tasks, flows) = engines();
        let flow = Flow::new("route")
            .with_step(FlowStep::condition(
                "big?",
                |input, _ctx| input["amount"].as_i64().unwrap_or(0) > 100,
                vec![StepId::new("big")],
                vec![StepId::new("small")],
            ))
            .with_step(
                FlowStep::task("big", "echo")
                    .with_input(InputBinding::literal("route", json!("manual")))
                    .with_output(OutputBinding::parse("route", "output.route").unwrap()),
            )
            .with_step(
                FlowStep::task("small", "echo")
                    .with_input(InputBinding::literal("route", json!("auto")))
                    .with_output(OutputBinding::parse("route", "output.route").unwrap()),
            );
        flows.register_flow(flow).unwrap();

        let big = flows
            .execute_flow(&FlowId::new("route"), json!({"amount": 500}), FlowOptions::default())
            .await
            .unwrap();
        assert_eq!(big.output, json!({"route": "manual"}));

        let small = flows
            .execute_flow(&FlowId::new("route"), json!({"amount": 5}), FlowOptions::default())
            .await
            .unwrap();
        assert_eq!(small.output, json!({"route": "auto"}));
    }

    #[tokio::test]
    async fn test_condition_sees_execution_context() {
        let (_tasks, flows) = engines();
        let seen = Arc::new(Mutex::new(Value::Null));
        let s = Arc::clone(&seen);
        flows
            .register_flow(
                Flow::new("f").with_step(FlowStep::condition(
                    "c",
                    move |_input, ctx| {
                        *s.lock().unwrap() = ctx.clone();
                        true
                    },
                    vec![],
                    vec![],
                )),
            )
            .unwrap();

        flows
            .execute_flow(
                &FlowId::new("f"),
                json!({"a": 1}),
                FlowOptions::default().with_variable("v", json!(2)),
            )
            .await
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            json!({"input": {"a": 1}, "output": {}, "variables": {"v": 2}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_branches_run_concurrently_and_merge() {
        let (_tasks, flows) = engines();
        flows
            .register_flow(
                Flow::new("fan-out")
                    .with_step(FlowStep::parallel(
                        "both",
                        vec![
                            vec![StepId::new("wait-a"), StepId::new("a")],
                            vec![StepId::new("wait-b"), StepId::new("b")],
                        ],
                    ))
                    .with_step(FlowStep::wait("wait-a", Duration::from_millis(100)))
                    .with_step(FlowStep::wait("wait-b", Duration::from_millis(100)))
                    .with_step(
                        FlowStep::task("a", "echo")
                            .with_input(InputBinding::literal("side", json!("a")))
                            .with_output(OutputBinding::parse("side", "output.side").unwrap()),
                    )
                    .with_step(FlowStep::task("b", "echo")),
            )
            .unwrap();

        let started = tokio::time::Instant::now();
        let result = flows
            .execute_flow(&FlowId::new("fan-out"), json!({"n": 1}), FlowOptions::default().with_trace())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(result.success);
        assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(200));
        assert_eq!(
            result.output,
            json!({"branch0": {"side": "a"}, "branch1": {}})
        );
        let trace = result.trace.unwrap();
        assert_eq!(trace.len(), 5);
        assert_eq!(trace.last().unwrap().step_type, "parallel");
    }

    #[tokio::test]
    async fn test_parallel_failure_waits_for_all_branches() {
        let (tasks, flows) = engines();
        let finished = Arc::new(Mutex::new(false));
        let f = Arc::clone(&finished);
        tasks.register_task(TaskDefinition::from_fn("slow-ok", move |_input, _ctx| {
            let f = Arc::clone(&f);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                *f.lock().unwrap() = true;
                Ok(Value::Null)
            }
        }));
        flows
            .register_flow(
                Flow::new("f")
                    .with_step(FlowStep::parallel(
                        "p",
                        vec![vec![StepId::new("bad")], vec![StepId::new("good")]],
                    ))
                    .with_step(FlowStep::task("bad", "fail"))
                    .with_step(FlowStep::task("good", "slow-ok")),
            )
            .unwrap();

        let result = flows
            .execute_flow(&FlowId::new("f"), json!({}), FlowOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error.unwrap().kind(),
            ErrorKind::TaskExecutionError
        );
        assert!(*finished.lock().unwrap());
    }

    #[tokio::test]
    async fn test_failure_aborts_walk_unless_continue_on_error() {
        let (_tasks, flows) = engines();
        let flow = |lenient: bool| {
            let failing = FlowStep::task("charge", "fail").then("notify");
            Flow::new(if lenient { "lenient" } else { "strict" })
                .with_step(if lenient { failing.continue_on_error() } else { failing })
                .with_step(
                    FlowStep::task("notify", "echo")
                        .with_input(InputBinding::literal("sent", json!(true)))
                        .with_output(OutputBinding::parse("sent", "output.sent").unwrap()),
                )
        };
        flows.register_flow(flow(false)).unwrap();
        flows.register_flow(flow(true)).unwrap();

        let strict = flows
            .execute_flow(&FlowId::new("strict"), json!({}), FlowOptions::default().with_trace())
            .await
            .unwrap();
        assert!(!strict.success);
        assert_eq!(strict.output, json!({}));
        let trace = strict.trace.unwrap();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].status, StepStatus::Failed);

        let lenient = flows
            .execute_flow(&FlowId::new("lenient"), json!({}), FlowOptions::default())
            .await
            .unwrap();
        assert!(lenient.success);
        assert_eq!(lenient.output, json!({"sent": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_timeout() {
        let (_tasks, flows) = engines();
        flows
            .register_flow(
                Flow::new("slow")
                    .with_step(FlowStep::wait("nap", Duration::from_secs(5)))
                    .with_timeout(Duration::from_millis(250)),
            )
            .unwrap();

        let result = flows
            .execute_flow(&FlowId::new("slow"), json!({}), FlowOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind(), ErrorKind::FlowTimeout);
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_flows() {
        let (_tasks, flows) = engines();
        let err = flows
            .execute_flow(&FlowId::new("nope"), json!({}), FlowOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FlowNotFound);

        let invalid = Flow::new("broken").with_step(FlowStep::task("a", "echo").then("ghost"));
        assert_eq!(
            flows.register_flow(invalid).unwrap_err().kind(),
            ErrorKind::ValidationError
        );
    }

    #[tokio::test]
    async fn test_step_events() {
        let (tasks, _flows) = engines();
        let bus = EventBus::new();
        let flows = FlowEngine::new(tasks, bus.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = bus.subscribe(reflow_types::WILDCARD, move |e| {
            s.lock().unwrap().push(e.event_type.clone());
            Ok(())
        });
        flows
            .register_flow(Flow::new("f").with_step(FlowStep::wait("w", Duration::from_millis(1))))
            .unwrap();

        flows
            .execute_flow(&FlowId::new("f"), json!({}), FlowOptions::default())
            .await
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                events::FLOW_STARTED,
                events::FLOW_STEP_COMPLETED,
                events::FLOW_COMPLETED
            ]
        );
    }
}
