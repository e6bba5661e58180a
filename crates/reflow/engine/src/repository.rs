//! Instance repository: the authoritative store of process instances
//!
//! Owned by the runtime and injected into the process engine, so several
//! runtimes can coexist in one process without sharing state.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reflow_types::{InstanceId, ProcessId, ProcessInstance};

/// Concurrent map of process instances keyed by id
#[derive(Debug, Default)]
pub struct InstanceRepository {
    instances: DashMap<InstanceId, ProcessInstance>,
}

impl InstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, returning the previous instance
    pub fn insert(&self, instance: ProcessInstance) -> Option<ProcessInstance> {
        self.instances.insert(instance.id.clone(), instance)
    }

    /// Insert only if the id is free; the check and the insert share one
    /// entry lock. Returns `false` when the id is taken.
    pub fn insert_new(&self, instance: ProcessInstance) -> bool {
        match self.instances.entry(instance.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(instance);
                true
            }
        }
    }

    pub fn get(&self, id: &InstanceId) -> Option<ProcessInstance> {
        self.instances.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.contains_key(id)
    }

    pub fn remove(&self, id: &InstanceId) -> Option<ProcessInstance> {
        self.instances.remove(id).map(|(_, instance)| instance)
    }

    /// Run `f` while holding the entry lock for `id`.
    ///
    /// Concurrent updates of the same instance are serialized; `f` must not
    /// touch the repository entry for the same id.
    pub fn update<F, R>(&self, id: &InstanceId, f: F) -> Option<R>
    where
        F: FnOnce(&mut ProcessInstance) -> R,
    {
        self.instances.get_mut(id).map(|mut entry| f(entry.value_mut()))
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Every instance, oldest first (ties broken by id)
    pub fn all(&self) -> Vec<ProcessInstance> {
        let mut instances: Vec<ProcessInstance> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        instances.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        instances
    }

    pub fn filter<P>(&self, predicate: P) -> Vec<ProcessInstance>
    where
        P: Fn(&ProcessInstance) -> bool,
    {
        self.all().into_iter().filter(|i| predicate(i)).collect()
    }

    pub fn in_state(&self, process_id: &ProcessId, state: &str) -> Vec<ProcessInstance> {
        self.filter(|i| &i.process_id == process_id && i.state == state)
    }

    /// Replace the whole contents with `instances`
    pub fn restore(&self, instances: Vec<ProcessInstance>) {
        self.instances.clear();
        for instance in instances {
            self.insert(instance);
        }
    }

    pub fn clear(&self) {
        self.instances.clear();
    }
}
