//! Task manager: validated, time-boxed, retried task execution
//!
//! One `execute_task` call runs up to `1 + retry.max_attempts` attempts.
//! Each attempt runs the `before` middleware, the implementation (raced
//! against the timeout), output validation, the success or error handler
//! and finally the `after` middleware.
//!
//! A timed-out attempt drops the implementation future, which cancels it
//! at its next await point. Work it spawned elsewhere keeps running.

use crate::event_bus::{panic_message, EventBus};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use rand::Rng;
use reflow_types::events;
use reflow_types::{
    Event, ReflowError, ReflowResult, RetryPolicy, TaskContext, TaskDefinition, TaskId,
};
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

const SOURCE: &str = "task-manager";

/// One attempt of one task execution, as seen by middleware
#[derive(Clone, Debug)]
pub struct TaskInvocation {
    pub task_id: TaskId,
    pub execution_id: String,
    /// 1-indexed
    pub attempt: u32,
    pub input: Value,
    pub context: Value,
}

/// Cross-cutting behavior around every attempt
#[async_trait]
pub trait TaskMiddleware: Send + Sync {
    /// Runs before the implementation. An error fails the attempt.
    async fn before(&self, _invocation: &TaskInvocation) -> ReflowResult<()> {
        Ok(())
    }

    /// Runs after the attempt with its outcome
    async fn after(&self, _invocation: &TaskInvocation, _result: &ReflowResult<Value>) {}
}

/// Per-call overrides of the task definition
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    /// Skip input and output schema checks
    pub skip_validation: bool,
}

impl ExecuteOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn without_validation(mut self) -> Self {
        self.skip_validation = true;
        self
    }
}

/// Registry and executor of tasks
pub struct TaskManager {
    tasks: DashMap<TaskId, Arc<TaskDefinition>>,
    middleware: RwLock<Vec<Arc<dyn TaskMiddleware>>>,
    bus: EventBus,
    /// Applied when neither the call nor the definition sets a timeout
    default_timeout: Option<Duration>,
}

impl TaskManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            tasks: DashMap::new(),
            middleware: RwLock::new(Vec::new()),
            bus,
            default_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn register_task(&self, definition: TaskDefinition) {
        let id = definition.id.clone();
        if self.tasks.insert(id.clone(), Arc::new(definition)).is_some() {
            tracing::warn!(task_id = %id, "Replaced existing task definition");
        } else {
            tracing::info!(task_id = %id, "Registered task");
        }
    }

    pub fn unregister_task(&self, id: &TaskId) -> bool {
        self.tasks.remove(id).is_some()
    }

    pub fn get_task(&self, id: &TaskId) -> Option<Arc<TaskDefinition>> {
        self.tasks.get(id).map(|t| Arc::clone(t.value()))
    }

    pub fn has_task(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.tasks.iter().map(|t| t.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Append middleware; runs in registration order
    pub fn add_middleware(&self, middleware: Arc<dyn TaskMiddleware>) {
        self.middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(middleware);
    }

    fn middleware(&self) -> Vec<Arc<dyn TaskMiddleware>> {
        self.middleware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run a task to completion, retrying per its policy.
    ///
    /// Input validation failures are raised at once and never retried.
    /// After the last failed attempt the error is re-tagged as a task
    /// execution error unless it already has a more specific kind.
    pub async fn execute_task(
        &self,
        task_id: &TaskId,
        input: Value,
        context: Value,
        options: ExecuteOptions,
    ) -> ReflowResult<Value> {
        let definition = self
            .get_task(task_id)
            .ok_or_else(|| ReflowError::TaskNotFound(task_id.to_string()))?;

        if !options.skip_validation {
            if let Some(schema) = &definition.input_schema {
                schema.validate(&input)?;
            }
        }

        let timeout = options
            .timeout
            .or(definition.timeout)
            .or(self.default_timeout);
        let retry = options.retry.or_else(|| definition.retry.clone());
        let max_attempts = 1 + retry.as_ref().map_or(0, |r| r.max_attempts);
        let execution_id = uuid::Uuid::new_v4().to_string();
        let middleware = self.middleware();

        tracing::debug!(task_id = %task_id, execution_id = %execution_id, "Task started");
        self.emit(
            events::TASK_STARTED,
            json!({"taskId": task_id, "executionId": execution_id}),
        );

        let mut attempt = 1;
        loop {
            let invocation = TaskInvocation {
                task_id: task_id.clone(),
                execution_id: execution_id.clone(),
                attempt,
                input: input.clone(),
                context: context.clone(),
            };

            let error = match self
                .run_attempt(&definition, &invocation, timeout, &middleware, options.skip_validation)
                .await
            {
                Ok(output) => {
                    tracing::debug!(task_id = %task_id, attempt, "Task completed");
                    self.emit(
                        events::TASK_COMPLETED,
                        json!({"taskId": task_id, "executionId": execution_id, "attempt": attempt}),
                    );
                    return Ok(output);
                }
                Err(error) => error,
            };

            let policy = match &retry {
                Some(policy) if attempt < max_attempts && error.is_retryable() => policy,
                _ => {
                    tracing::error!(task_id = %task_id, attempt, error = %error, "Task failed");
                    self.emit(
                        events::TASK_FAILED,
                        json!({
                            "taskId": task_id,
                            "executionId": execution_id,
                            "attempt": attempt,
                            "error": error.to_string(),
                            "kind": error.kind(),
                        }),
                    );
                    return Err(error.into_task_error(task_id.as_str()));
                }
            };

            let delay = policy.delay_for_attempt(attempt, rand::thread_rng().gen_range(0.5..1.0));
            tracing::debug!(
                task_id = %task_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying task"
            );
            self.emit(
                events::TASK_RETRY,
                json!({
                    "taskId": task_id,
                    "executionId": execution_id,
                    "attempt": attempt,
                    "nextAttempt": attempt + 1,
                    "delayMs": delay.as_millis() as u64,
                    "error": error.to_string(),
                }),
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn run_attempt(
        &self,
        definition: &TaskDefinition,
        invocation: &TaskInvocation,
        timeout: Option<Duration>,
        middleware: &[Arc<dyn TaskMiddleware>],
        skip_validation: bool,
    ) -> ReflowResult<Value> {
        let mut result = Ok(Value::Null);
        for m in middleware {
            if let Err(e) = m.before(invocation).await {
                result = Err(e);
                break;
            }
        }

        if result.is_ok() {
            result = self.invoke(definition, invocation, timeout).await;
        }

        if !skip_validation {
            if let (Ok(output), Some(schema)) = (&result, &definition.output_schema) {
                if let Err(e) = schema.validate(output) {
                    result = Err(e);
                }
            }
        }

        match &result {
            Ok(output) => {
                if let Some(handler) = &definition.success_handler {
                    handler(output, &invocation.input);
                }
            }
            Err(error) => {
                tracing::debug!(
                    task_id = %invocation.task_id,
                    attempt = invocation.attempt,
                    error = %error,
                    "Task attempt failed"
                );
                if let Some(handler) = &definition.error_handler {
                    handler(error, &invocation.input);
                }
            }
        }

        for m in middleware {
            m.after(invocation, &result).await;
        }

        result
    }

    async fn invoke(
        &self,
        definition: &TaskDefinition,
        invocation: &TaskInvocation,
        timeout: Option<Duration>,
    ) -> ReflowResult<Value> {
        let ctx = TaskContext {
            task_id: invocation.task_id.clone(),
            execution_id: invocation.execution_id.clone(),
            attempt: invocation.attempt,
            context: invocation.context.clone(),
        };
        let task_id = invocation.task_id.as_str();
        let call = AssertUnwindSafe(
            definition
                .implementation
                .execute(invocation.input.clone(), ctx),
        )
        .catch_unwind()
        .map(move |outcome| {
            outcome.unwrap_or_else(|panic| {
                Err(ReflowError::task_failed(
                    task_id,
                    format!("task panicked: {}", panic_message(&*panic)),
                ))
            })
        });

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(ReflowError::TaskTimeout {
                    task_id: invocation.task_id.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => call.await,
        }
    }

    fn emit(&self, event_type: &str, payload: Value) {
        self.bus.emit(
            Event::new(event_type)
                .with_source(SOURCE)
                .with_payload(payload),
        );
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("tasks", &self.task_ids())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
