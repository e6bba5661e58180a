//! Snapshot transactions
//!
//! `begin_transaction` copies every process instance. Operations run
//! through the transaction apply to the runtime immediately and are
//! recorded. `commit` keeps them and drops the snapshot; `rollback` puts
//! the whole instance store back to the snapshot, which also reverts
//! changes made outside the transaction in the meantime.
//!
//! Rollback waits for operations already in flight and restores after
//! them; commit refuses to run while one is in flight.

use crate::runtime::ReflowRuntime;
use chrono::{DateTime, Utc};
use reflow_engine::{CreateOptions, ExecuteOptions, TransitionResult};
use reflow_types::{
    Context, InstanceId, ProcessId, ProcessInstance, ReflowError, ReflowResult, TaskId,
    TransactionId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Pending,
    Committed,
    RolledBack,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransactionState::Pending => "PENDING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::RolledBack => "ROLLED_BACK",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CreateProcess,
    TransitionProcess,
    ExecuteTask,
}

/// A recorded operation and what it returned
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionOperation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub params: Value,
    pub result: Value,
}

struct TransactionInner {
    state: TransactionState,
    operations: Vec<TransactionOperation>,
    snapshot: Option<Vec<ProcessInstance>>,
}

/// Handle returned by [`ReflowRuntime::begin_transaction`]
pub struct Transaction {
    id: TransactionId,
    began_at: DateTime<Utc>,
    runtime: ReflowRuntime,
    inner: Mutex<TransactionInner>,
    /// Held shared by operations, exclusively by commit and rollback
    in_flight: RwLock<()>,
}

impl Transaction {
    pub(crate) fn begin(runtime: ReflowRuntime, snapshot: Vec<ProcessInstance>) -> Self {
        Self {
            id: TransactionId::generate(),
            began_at: Utc::now(),
            runtime,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Pending,
                operations: Vec::new(),
                snapshot: Some(snapshot),
            }),
            in_flight: RwLock::new(()),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn began_at(&self) -> DateTime<Utc> {
        self.began_at
    }

    pub fn state(&self) -> TransactionState {
        self.lock().state
    }

    pub fn operations(&self) -> Vec<TransactionOperation> {
        self.lock().operations.clone()
    }

    /// Instances captured at `begin_transaction`; gone once terminal
    pub fn snapshot_len(&self) -> Option<usize> {
        self.lock().snapshot.as_ref().map(Vec::len)
    }

    pub async fn create_process(
        &self,
        process_id: &ProcessId,
        context: Context,
        options: CreateOptions,
    ) -> ReflowResult<ProcessInstance> {
        let _operation = self.in_flight.read().await;
        self.ensure_pending()?;
        let params = json!({ "processId": process_id, "context": context });
        let instance = self
            .runtime
            .create_process(process_id, context, options)
            .await?;
        self.record(OperationType::CreateProcess, params, to_json(&instance))?;
        Ok(instance)
    }

    pub async fn transition_process(
        &self,
        id: &InstanceId,
        event_type: &str,
        payload: Option<Value>,
    ) -> ReflowResult<TransitionResult> {
        let _operation = self.in_flight.read().await;
        self.ensure_pending()?;
        let params = json!({ "instanceId": id, "eventType": event_type, "payload": payload });
        let result = self
            .runtime
            .transition_process(id, event_type, payload)
            .await?;
        self.record(
            OperationType::TransitionProcess,
            params,
            json!({ "instance": to_json(&result.instance), "outcome": to_json(&result.outcome) }),
        )?;
        Ok(result)
    }

    pub async fn execute_task(
        &self,
        task_id: &TaskId,
        input: Value,
        context: Value,
        options: ExecuteOptions,
    ) -> ReflowResult<Value> {
        let _operation = self.in_flight.read().await;
        self.ensure_pending()?;
        let params = json!({ "taskId": task_id, "input": input });
        let output = self
            .runtime
            .execute_task(task_id, input, context, options)
            .await?;
        self.record(OperationType::ExecuteTask, params, output.clone())?;
        Ok(output)
    }

    /// Keep every applied change and discard the snapshot
    pub fn commit(&self) -> ReflowResult<()> {
        let Ok(_exclusive) = self.in_flight.try_write() else {
            return Err(ReflowError::validation(format!(
                "transaction {} has an operation in flight",
                self.id
            )));
        };
        let operations = {
            let mut inner = self.lock();
            self.check_pending(&inner)?;
            inner.state = TransactionState::Committed;
            inner.snapshot = None;
            inner.operations.len()
        };
        self.runtime.transaction_committed(&self.id, operations);
        Ok(())
    }

    /// Restore every process instance to the snapshot, after any
    /// operation in flight has finished
    pub async fn rollback(&self) -> ReflowResult<()> {
        let _exclusive = self.in_flight.write().await;
        let snapshot = {
            let mut inner = self.lock();
            self.check_pending(&inner)?;
            inner.state = TransactionState::RolledBack;
            inner.snapshot.take().unwrap_or_default()
        };
        self.runtime.rolled_back(&self.id, snapshot).await;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, TransactionInner> {
        // Every critical section is a plain field update
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_pending(&self) -> ReflowResult<()> {
        let inner = self.lock();
        self.check_pending(&inner)
    }

    fn check_pending(&self, inner: &TransactionInner) -> ReflowResult<()> {
        match inner.state {
            TransactionState::Pending => Ok(()),
            state => Err(ReflowError::validation(format!(
                "transaction {} is {}",
                self.id, state
            ))),
        }
    }

    fn record(&self, op_type: OperationType, params: Value, result: Value) -> ReflowResult<()> {
        let mut inner = self.lock();
        self.check_pending(&inner)?;
        inner.operations.push(TransactionOperation {
            op_type,
            params,
            result,
        });
        tracing::debug!(transaction_id = %self.id, op = ?op_type, "Recorded transaction operation");
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state() == TransactionState::Pending {
            tracing::warn!(transaction_id = %self.id, "Transaction dropped while pending; changes are kept");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("operations", &inner.operations.len())
            .field("began_at", &self.began_at)
            .finish()
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
