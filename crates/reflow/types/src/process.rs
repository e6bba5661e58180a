//! Process definitions: named state machines
//!
//! A ProcessDefinition is authored outside the runtime and is read-only to
//! the engine. Transitions are evaluated in definition order; the first
//! transition whose source matches, whose event matches and whose guard
//! passes wins.

use crate::{Context, Event, ProcessId, ReflowError, ReflowResult, Schema, WILDCARD};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

// ── States ───────────────────────────────────────────────────────────

/// A state a process instance can occupy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl StateDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

// ── Transitions ──────────────────────────────────────────────────────

/// Which states a transition may fire from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionSource {
    /// `'*'`: any state
    Any,
    /// Exactly one state
    State(String),
    /// Any of the listed states
    OneOf(Vec<String>),
}

impl TransitionSource {
    pub fn matches(&self, state: &str) -> bool {
        match self {
            TransitionSource::Any => true,
            TransitionSource::State(s) => s == state,
            TransitionSource::OneOf(states) => states.iter().any(|s| s == state),
        }
    }

    /// Explicitly named source states (empty for `Any`)
    pub fn named_states(&self) -> Vec<&str> {
        match self {
            TransitionSource::Any => Vec::new(),
            TransitionSource::State(s) => vec![s.as_str()],
            TransitionSource::OneOf(states) => states.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for TransitionSource {
    fn from(value: &str) -> Self {
        if value == WILDCARD {
            TransitionSource::Any
        } else {
            TransitionSource::State(value.to_string())
        }
    }
}

impl<const N: usize> From<[&str; N]> for TransitionSource {
    fn from(value: [&str; N]) -> Self {
        TransitionSource::OneOf(value.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Vec<String>> for TransitionSource {
    fn from(value: Vec<String>) -> Self {
        TransitionSource::OneOf(value)
    }
}

/// Guard predicate over the instance context and the triggering event
pub type Guard = Arc<dyn Fn(&Context, &Event) -> bool + Send + Sync>;

/// Side effect run after the payload is merged into the context
pub type Action = Arc<dyn Fn(&mut Context, &Event) + Send + Sync>;

/// A rule moving an instance from one state to another on a named event
#[derive(Clone)]
pub struct Transition {
    pub from: TransitionSource,
    pub to: String,
    pub on: String,
    pub guard: Option<Guard>,
    pub action: Option<Action>,
}

impl Transition {
    pub fn new(
        from: impl Into<TransitionSource>,
        to: impl Into<String>,
        on: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            on: on.into(),
            guard: None,
            action: None,
        }
    }

    pub fn with_guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&Context, &Event) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn with_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut Context, &Event) + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }

    /// Source and event both match
    pub fn applies_to(&self, state: &str, event_type: &str) -> bool {
        self.on == event_type && self.from.matches(state)
    }

    /// Guard absent or passing
    pub fn guard_passes(&self, context: &Context, event: &Event) -> bool {
        self.guard.as_ref().map_or(true, |g| g(context, event))
    }
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("on", &self.on)
            .field("guard", &self.guard.is_some())
            .field("action", &self.action.is_some())
            .finish()
    }
}

// ── Process Definition ───────────────────────────────────────────────

/// A named state machine definition
#[derive(Clone, Debug)]
pub struct ProcessDefinition {
    pub id: ProcessId,
    pub states: Vec<StateDefinition>,
    pub initial_state: String,
    pub transitions: Vec<Transition>,
    pub context_schema: Option<Schema>,
}

impl ProcessDefinition {
    pub fn new(id: impl Into<ProcessId>, initial_state: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            states: Vec::new(),
            initial_state: initial_state.into(),
            transitions: Vec::new(),
            context_schema: None,
        }
    }

    pub fn with_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states
            .extend(states.into_iter().map(|s| StateDefinition::new(s)));
        self
    }

    pub fn with_state(mut self, state: StateDefinition) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_context_schema(mut self, schema: Schema) -> Self {
        self.context_schema = Some(schema);
        self
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.states.iter().any(|s| s.name == name)
    }

    /// Transitions whose source matches `state` and whose `on` equals
    /// `event_type`, in definition order
    pub fn candidate_transitions<'a>(
        &'a self,
        state: &'a str,
        event_type: &'a str,
    ) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions
            .iter()
            .filter(move |t| t.applies_to(state, event_type))
    }

    /// Structural validation performed at registration time
    pub fn validate(&self) -> ReflowResult<()> {
        if self.states.is_empty() {
            return Err(ReflowError::validation(format!(
                "process '{}' declares no states",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for state in &self.states {
            if !seen.insert(state.name.as_str()) {
                return Err(ReflowError::validation(format!(
                    "process '{}' declares state '{}' twice",
                    self.id, state.name
                )));
            }
        }

        if !self.has_state(&self.initial_state) {
            return Err(ReflowError::validation(format!(
                "initial state '{}' is not a state of process '{}'",
                self.initial_state, self.id
            )));
        }

        for transition in &self.transitions {
            if !self.has_state(&transition.to) {
                return Err(ReflowError::validation(format!(
                    "transition on '{}' targets unknown state '{}'",
                    transition.on, transition.to
                )));
            }
            if let Some(unknown) = transition
                .from
                .named_states()
                .into_iter()
                .find(|s| !self.has_state(s))
            {
                return Err(ReflowError::validation(format!(
                    "transition on '{}' starts from unknown state '{}'",
                    transition.on, unknown
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn order_process() -> ProcessDefinition {
        ProcessDefinition::new("order-process", "created")
            .with_states(["created", "processing", "completed", "cancelled"])
            .with_transition(Transition::new("created", "processing", "START"))
            .with_transition(Transition::new("processing", "completed", "COMPLETE"))
            .with_transition(Transition::new("*", "cancelled", "CANCEL"))
    }

    #[test]
    fn test_source_matching() {
        assert!(TransitionSource::Any.matches("anything"));
        assert!(TransitionSource::from("created").matches("created"));
        assert!(!TransitionSource::from("created").matches("processing"));
        assert_eq!(TransitionSource::from("*"), TransitionSource::Any);

        let many = TransitionSource::from(["a", "b"]);
        assert!(many.matches("b"));
        assert!(!many.matches("c"));
    }

    #[test]
    fn test_candidate_transitions_in_order() {
        let def = order_process();
        let found: Vec<_> = def.candidate_transitions("created", "START").collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].to, "processing");

        let cancel: Vec<_> = def.candidate_transitions("processing", "CANCEL").collect();
        assert_eq!(cancel.len(), 1);

        assert_eq!(def.candidate_transitions("completed", "START").count(), 0);
    }

    #[test]
    fn test_guard_defaults_to_pass() {
        let t = Transition::new("a", "b", "GO");
        assert!(t.guard_passes(&Context::new(), &Event::new("GO")));

        let blocked = t.with_guard(|_, _| false);
        assert!(!blocked.guard_passes(&Context::new(), &Event::new("GO")));
    }

    #[test]
    fn test_validate() {
        assert!(order_process().validate().is_ok());

        let bad_initial = ProcessDefinition::new("p", "nowhere").with_states(["a"]);
        assert_eq!(
            bad_initial.validate().unwrap_err().kind(),
            ErrorKind::ValidationError
        );

        let bad_target = ProcessDefinition::new("p", "a")
            .with_states(["a"])
            .with_transition(Transition::new("a", "b", "GO"));
        assert!(bad_target.validate().is_err());

        let bad_source = ProcessDefinition::new("p", "a")
            .with_states(["a", "b"])
            .with_transition(Transition::new(["a", "zzz"], "b", "GO"));
        assert!(bad_source.validate().is_err());

        let duplicate = ProcessDefinition::new("p", "a").with_states(["a", "a"]);
        assert!(duplicate.validate().is_err());
    }
}
