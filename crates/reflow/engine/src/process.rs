//! Process engine: creates instances and drives their state machines
//!
//! A transition is applied while the repository holds the instance's entry
//! lock, so overlapping transitions on one instance are serialized and
//! `history.len()` always equals the number of applied transitions.
//! Events are emitted only after the lock is released.

use crate::event_bus::EventBus;
use crate::repository::InstanceRepository;
use dashmap::DashMap;
use reflow_types::events;
use reflow_types::{
    Context, Event, InstanceId, ProcessDefinition, ProcessId, ProcessInstance, ReflowError,
    ReflowResult, Transition,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

const SOURCE: &str = "process-engine";

/// Per-call options for `create_process`
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// Use this id instead of a generated one
    pub instance_id: Option<InstanceId>,
    /// Start somewhere other than the definition's initial state
    pub initial_state: Option<String>,
    pub metadata: Context,
}

impl CreateOptions {
    pub fn with_instance_id(mut self, id: impl Into<InstanceId>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn with_initial_state(mut self, state: impl Into<String>) -> Self {
        self.initial_state = Some(state.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// What a transition attempt did
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied { from: String, to: String },
    NoMatch { reason: String },
}

/// Result of `transition_process`. A failed match is not an error.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionResult {
    pub instance: ProcessInstance,
    pub outcome: TransitionOutcome,
}

impl TransitionResult {
    pub fn is_applied(&self) -> bool {
        matches!(self.outcome, TransitionOutcome::Applied { .. })
    }

    /// The instance, or `INVALID_TRANSITION` when nothing matched
    pub fn into_applied(self) -> ReflowResult<ProcessInstance> {
        match self.outcome {
            TransitionOutcome::Applied { .. } => Ok(self.instance),
            TransitionOutcome::NoMatch { reason } => Err(ReflowError::InvalidTransition(reason)),
        }
    }
}

/// Lifecycle hooks wrapped around the core transition algorithm.
///
/// Hooks run under the instance lock and must not call back into the
/// engine for the same instance.
pub trait ProcessHooks: Send + Sync {
    fn on_exit_state(&self, _instance: &ProcessInstance, _state: &str, _event: &Event) {}

    fn on_enter_state(&self, _instance: &ProcessInstance, _state: &str, _event: &Event) {}

    /// Extra guard consulted after a transition has been selected
    fn can_transition(
        &self,
        _instance: &ProcessInstance,
        _transition: &Transition,
        _event: &Event,
    ) -> bool {
        true
    }

    fn after_transition(&self, _instance: &ProcessInstance, _from: &str, _to: &str, _event: &Event) {
    }
}

/// Owns process definitions and drives instances through them
pub struct ProcessEngine {
    definitions: DashMap<ProcessId, Arc<ProcessDefinition>>,
    instances: Arc<InstanceRepository>,
    bus: EventBus,
    hooks: Vec<Arc<dyn ProcessHooks>>,
}

impl ProcessEngine {
    pub fn new(instances: Arc<InstanceRepository>, bus: EventBus) -> Self {
        Self {
            definitions: DashMap::new(),
            instances,
            bus,
            hooks: Vec::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ProcessHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn repository(&self) -> &Arc<InstanceRepository> {
        &self.instances
    }

    // ── Definitions ──────────────────────────────────────────────────

    pub fn register_definition(&self, definition: ProcessDefinition) -> ReflowResult<()> {
        definition.validate()?;
        let id = definition.id.clone();
        if self
            .definitions
            .insert(id.clone(), Arc::new(definition))
            .is_some()
        {
            tracing::warn!(process_id = %id, "Replaced existing process definition");
        } else {
            tracing::info!(process_id = %id, "Registered process definition");
        }
        Ok(())
    }

    pub fn get_definition(&self, id: &ProcessId) -> Option<Arc<ProcessDefinition>> {
        self.definitions.get(id).map(|d| Arc::clone(d.value()))
    }

    pub fn definition_ids(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self.definitions.iter().map(|d| d.key().clone()).collect();
        ids.sort();
        ids
    }

    fn definition(&self, id: &ProcessId) -> ReflowResult<Arc<ProcessDefinition>> {
        self.get_definition(id)
            .ok_or_else(|| ReflowError::ProcessDefinitionNotFound(id.to_string()))
    }

    // ── Instances ────────────────────────────────────────────────────

    pub fn create_process(
        &self,
        process_id: &ProcessId,
        context: Context,
        options: CreateOptions,
    ) -> ReflowResult<ProcessInstance> {
        let definition = self.definition(process_id)?;

        if let Some(schema) = &definition.context_schema {
            schema.validate(&Value::Object(context.clone()))?;
        }

        let state = options
            .initial_state
            .unwrap_or_else(|| definition.initial_state.clone());
        if !definition.has_state(&state) {
            return Err(ReflowError::validation(format!(
                "initial state '{}' is not a state of process '{}'",
                state, process_id
            )));
        }

        let id = options.instance_id.unwrap_or_else(InstanceId::generate);
        let instance = ProcessInstance::new(id, process_id.clone(), state, context)
            .with_metadata(options.metadata);
        if !self.instances.insert_new(instance.clone()) {
            return Err(ReflowError::validation(format!(
                "process instance '{}' already exists",
                instance.id
            )));
        }

        let created = Event::new(events::PROCESS_CREATED).with_source(SOURCE);
        for hook in &self.hooks {
            hook.on_enter_state(&instance, &instance.state, &created);
        }

        tracing::info!(
            instance_id = %instance.id,
            process_id = %process_id,
            state = %instance.state,
            "Process instance created"
        );
        self.bus.emit(created.with_payload(json!({
            "instanceId": instance.id,
            "processId": instance.process_id,
            "state": instance.state,
        })));

        Ok(instance)
    }

    pub fn get_process(&self, id: &InstanceId) -> ReflowResult<ProcessInstance> {
        self.instances
            .get(id)
            .ok_or_else(|| ReflowError::ProcessNotFound(id.to_string()))
    }

    pub fn get_all_processes(&self) -> Vec<ProcessInstance> {
        self.instances.all()
    }

    pub fn processes_in_state(&self, process_id: &ProcessId, state: &str) -> Vec<ProcessInstance> {
        self.instances.in_state(process_id, state)
    }

    pub fn delete_process(&self, id: &InstanceId) -> ReflowResult<ProcessInstance> {
        let removed = self
            .instances
            .remove(id)
            .ok_or_else(|| ReflowError::ProcessNotFound(id.to_string()))?;

        tracing::info!(instance_id = %id, "Process instance deleted");
        self.bus.emit(
            Event::new(events::PROCESS_DELETED)
                .with_source(SOURCE)
                .with_payload(json!({
                    "instanceId": removed.id,
                    "processId": removed.process_id,
                    "state": removed.state,
                })),
        );
        Ok(removed)
    }

    /// Upsert instances from a persisted snapshot. Returns how many loaded.
    ///
    /// Instances whose definition is not registered, or whose state is not
    /// one of its definition's states, are skipped.
    pub fn load_instances(&self, instances: Vec<ProcessInstance>) -> usize {
        let mut count = 0;
        for instance in instances {
            let known = self
                .get_definition(&instance.process_id)
                .is_some_and(|definition| definition.has_state(&instance.state));
            if !known {
                tracing::warn!(
                    instance_id = %instance.id,
                    process_id = %instance.process_id,
                    state = %instance.state,
                    "Skipped instance with unknown definition or state"
                );
                continue;
            }
            self.instances.insert(instance);
            count += 1;
        }
        tracing::debug!(count, "Loaded process instances");
        count
    }

    pub fn export_instances(&self) -> Vec<ProcessInstance> {
        self.instances.all()
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Fire `event_type` at an instance.
    ///
    /// The first transition (definition order) whose source and event match
    /// and whose guard passes is applied. No match leaves the instance
    /// untouched and yields `TransitionOutcome::NoMatch`.
    pub fn transition_process(
        &self,
        id: &InstanceId,
        event_type: &str,
        payload: Option<Value>,
    ) -> ReflowResult<TransitionResult> {
        let process_id = self
            .instances
            .get(id)
            .map(|i| i.process_id)
            .ok_or_else(|| ReflowError::ProcessNotFound(id.to_string()))?;
        let definition = self.definition(&process_id)?;

        let event = Event::new(event_type)
            .with_payload(payload.unwrap_or(Value::Null))
            .with_source(SOURCE)
            .normalized();

        let result = self
            .instances
            .update(id, |instance| self.apply(&definition, instance, &event))
            // Deleted between the lookup and the lock
            .ok_or_else(|| ReflowError::ProcessNotFound(id.to_string()))?;

        match &result.outcome {
            TransitionOutcome::Applied { from, to } => {
                tracing::info!(
                    instance_id = %id,
                    from = %from,
                    to = %to,
                    event = %event_type,
                    "Process transitioned"
                );
                self.bus.emit(
                    Event::new(events::PROCESS_STATE_CHANGED)
                        .with_source(SOURCE)
                        .with_payload(json!({
                            "instanceId": id,
                            "processId": process_id,
                            "from": from,
                            "to": to,
                            "event": event_type,
                        })),
                );
            }
            TransitionOutcome::NoMatch { reason } => {
                tracing::debug!(instance_id = %id, event = %event_type, reason = %reason, "Transition rejected");
                self.bus.emit(
                    Event::new(events::PROCESS_TRANSITION_REJECTED)
                        .with_source(SOURCE)
                        .with_payload(json!({
                            "instanceId": id,
                            "processId": process_id,
                            "state": result.instance.state,
                            "event": event_type,
                            "reason": reason,
                        })),
                );
            }
        }

        Ok(result)
    }

    fn apply(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        event: &Event,
    ) -> TransitionResult {
        let from = instance.state.clone();
        let selected = definition
            .candidate_transitions(&from, &event.event_type)
            .find(|t| t.guard_passes(&instance.context, event));

        let Some(transition) = selected else {
            return TransitionResult {
                instance: instance.clone(),
                outcome: TransitionOutcome::NoMatch {
                    reason: format!(
                        "no transition from '{}' on '{}'",
                        from, event.event_type
                    ),
                },
            };
        };

        if self
            .hooks
            .iter()
            .any(|h| !h.can_transition(instance, transition, event))
        {
            return TransitionResult {
                instance: instance.clone(),
                outcome: TransitionOutcome::NoMatch {
                    reason: format!(
                        "transition from '{}' to '{}' on '{}' vetoed",
                        from, transition.to, event.event_type
                    ),
                },
            };
        }

        for hook in &self.hooks {
            hook.on_exit_state(instance, &from, event);
        }

        instance.merge_context(&event.payload);
        if let Some(action) = &transition.action {
            action(&mut instance.context, event);
        }
        instance.record_transition(&transition.to, &event.event_type);

        for hook in &self.hooks {
            hook.on_enter_state(instance, &transition.to, event);
        }
        for hook in &self.hooks {
            hook.after_transition(instance, &from, &transition.to, event);
        }

        let to = transition.to.clone();
        TransitionResult {
            instance: instance.clone(),
            outcome: TransitionOutcome::Applied { from, to },
        }
    }
}

impl std::fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("definitions", &self.definition_ids())
            .field("instances", &self.instances.len())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
