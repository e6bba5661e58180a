//! Task definitions: retryable units of work

use crate::{ReflowError, ReflowResult, RetryPolicy, Schema, TaskId};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// What a task implementation sees about the invocation
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// Unique per `execute_task` call, shared by all attempts
    pub execution_id: String,
    /// 1-indexed attempt number
    pub attempt: u32,
    /// Caller-supplied context (process context, flow variables, ...)
    pub context: Value,
}

/// The code behind a task
#[async_trait]
pub trait TaskImplementation: Send + Sync {
    async fn execute(&self, input: Value, ctx: TaskContext) -> ReflowResult<Value>;
}

/// Adapter turning an async closure into a [`TaskImplementation`]
pub struct TaskFn<F> {
    f: F,
}

impl<F> TaskFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskImplementation for TaskFn<F>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = ReflowResult<Value>> + Send + 'static,
{
    async fn execute(&self, input: Value, ctx: TaskContext) -> ReflowResult<Value> {
        (self.f)(input, ctx).await
    }
}

/// Called with the error and the input after every failed attempt
pub type ErrorHandler = Arc<dyn Fn(&ReflowError, &Value) + Send + Sync>;

/// Called with the output and the input after a successful attempt
pub type SuccessHandler = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

/// A registered unit of work
#[derive(Clone)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub implementation: Arc<dyn TaskImplementation>,
    pub input_schema: Option<Schema>,
    pub output_schema: Option<Schema>,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub error_handler: Option<ErrorHandler>,
    pub success_handler: Option<SuccessHandler>,
    /// Results may be memoized by input
    pub cache_results: bool,
}

impl TaskDefinition {
    pub fn new(id: impl Into<TaskId>, implementation: Arc<dyn TaskImplementation>) -> Self {
        Self {
            id: id.into(),
            implementation,
            input_schema: None,
            output_schema: None,
            timeout: None,
            retry: None,
            error_handler: None,
            success_handler: None,
            cache_results: false,
        }
    }

    /// Define a task from an async closure
    pub fn from_fn<F, Fut>(id: impl Into<TaskId>, f: F) -> Self
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReflowResult<Value>> + Send + 'static,
    {
        Self::new(id, Arc::new(TaskFn::new(f)))
    }

    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ReflowError, &Value) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_success_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.success_handler = Some(Arc::new(handler));
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache_results = true;
        self
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("input_schema", &self.input_schema)
            .field("output_schema", &self.output_schema)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("cache_results", &self.cache_results)
            .finish()
    }
}
