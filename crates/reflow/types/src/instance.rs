//! Process instances: running executions of process definitions
//!
//! An instance is created by the process engine and mutated only through
//! transitions. Its `history` grows by exactly one entry per applied
//! transition.

use crate::{Context, InstanceId, ProcessId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One applied transition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub from: String,
    pub to: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
}

/// A running, stateful execution of a process definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInstance {
    pub id: InstanceId,
    pub process_id: ProcessId,
    pub state: String,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Context,
}

impl ProcessInstance {
    pub fn new(
        id: InstanceId,
        process_id: ProcessId,
        state: impl Into<String>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            process_id,
            state: state.into(),
            context,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: Context::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Context) -> Self {
        self.metadata = metadata;
        self
    }

    /// Record a state change. The caller has already validated the target.
    pub fn record_transition(&mut self, to: &str, event: &str) {
        let now = Utc::now();
        self.history.push(HistoryEntry {
            from: self.state.clone(),
            to: to.to_string(),
            event: event.to_string(),
            timestamp: now,
        });
        self.state = to.to_string();
        self.updated_at = now;
    }

    /// Shallow-merge an object payload into the context
    pub fn merge_context(&mut self, payload: &serde_json::Value) {
        if let Some(fields) = payload.as_object() {
            for (key, value) in fields {
                self.context.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn transition_count(&self) -> usize {
        self.history.len()
    }
}
