//! Persistence contract for process instances
//!
//! The runtime defines what is saved (the serialized instance list), not
//! where. Any key-value backend implementing [`StateStore`] can hold it.

use async_trait::async_trait;
use dashmap::DashMap;
use reflow_types::ReflowResult;
use serde_json::Value;

/// Key under which `save_instances` writes the instance list
pub const INSTANCES_KEY: &str = "reflow:instances";

/// Minimal async key-value store of JSON documents
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> ReflowResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> ReflowResult<()>;

    async fn delete(&self, key: &str) -> ReflowResult<bool>;
}

/// In-memory state store for development and testing
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    documents: DashMap<String, Value>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> ReflowResult<Option<Value>> {
        Ok(self.documents.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> ReflowResult<()> {
        self.documents.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> ReflowResult<bool> {
        Ok(self.documents.remove(key).is_some())
    }
}
