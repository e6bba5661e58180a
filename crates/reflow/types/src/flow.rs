//! Flows: multi-step workflows
//!
//! A flow is a linked walk: execution starts at the first step and follows
//! each step's `next` pointer. Branching is expressed by dedicated step
//! kinds (condition, parallel) that execute lists of other steps.

use crate::{FlowId, InputBinding, OutputBinding, ReflowError, ReflowResult, StepId, TaskId};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding a condition step: `(flow input, execution context)`.
///
/// The execution context is passed as `{"input", "output", "variables"}`.
pub type ConditionPredicate = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// What a step does
#[derive(Clone)]
pub enum StepKind {
    Task {
        task_id: TaskId,
        input_mapping: Vec<InputBinding>,
        output_mapping: Vec<OutputBinding>,
    },
    Condition {
        predicate: ConditionPredicate,
        true_branch: Vec<StepId>,
        false_branch: Vec<StepId>,
    },
    Parallel {
        branches: Vec<Vec<StepId>>,
    },
    Wait {
        duration: Duration,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Task { .. } => "task",
            StepKind::Condition { .. } => "condition",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Wait { .. } => "wait",
        }
    }

    /// Step ids this kind executes as sub-steps
    fn referenced_steps(&self) -> Vec<&StepId> {
        match self {
            StepKind::Condition {
                true_branch,
                false_branch,
                ..
            } => true_branch.iter().chain(false_branch.iter()).collect(),
            StepKind::Parallel { branches } => branches.iter().flatten().collect(),
            StepKind::Task { .. } | StepKind::Wait { .. } => Vec::new(),
        }
    }
}

impl std::fmt::Debug for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Task {
                task_id,
                input_mapping,
                output_mapping,
            } => f
                .debug_struct("Task")
                .field("task_id", task_id)
                .field("input_mapping", input_mapping)
                .field("output_mapping", output_mapping)
                .finish(),
            StepKind::Condition {
                true_branch,
                false_branch,
                ..
            } => f
                .debug_struct("Condition")
                .field("true_branch", true_branch)
                .field("false_branch", false_branch)
                .finish_non_exhaustive(),
            StepKind::Parallel { branches } => f
                .debug_struct("Parallel")
                .field("branches", branches)
                .finish(),
            StepKind::Wait { duration } => {
                f.debug_struct("Wait").field("duration", duration).finish()
            }
        }
    }
}

/// One step of a flow
#[derive(Clone, Debug)]
pub struct FlowStep {
    pub id: StepId,
    pub next: Option<StepId>,
    /// Keep walking when this step fails
    pub continue_on_error: bool,
    pub kind: StepKind,
}

impl FlowStep {
    pub fn new(id: impl Into<StepId>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            next: None,
            continue_on_error: false,
            kind,
        }
    }

    pub fn task(id: impl Into<StepId>, task_id: impl Into<TaskId>) -> Self {
        Self::new(
            id,
            StepKind::Task {
                task_id: task_id.into(),
                input_mapping: Vec::new(),
                output_mapping: Vec::new(),
            },
        )
    }

    pub fn condition<F>(
        id: impl Into<StepId>,
        predicate: F,
        true_branch: Vec<StepId>,
        false_branch: Vec<StepId>,
    ) -> Self
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        Self::new(
            id,
            StepKind::Condition {
                predicate: Arc::new(predicate),
                true_branch,
                false_branch,
            },
        )
    }

    pub fn parallel(id: impl Into<StepId>, branches: Vec<Vec<StepId>>) -> Self {
        Self::new(id, StepKind::Parallel { branches })
    }

    pub fn wait(id: impl Into<StepId>, duration: Duration) -> Self {
        Self::new(id, StepKind::Wait { duration })
    }

    pub fn then(mut self, next: impl Into<StepId>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Add an input binding (task steps only; ignored otherwise)
    pub fn with_input(mut self, binding: InputBinding) -> Self {
        if let StepKind::Task { input_mapping, .. } = &mut self.kind {
            input_mapping.push(binding);
        }
        self
    }

    /// Add an output binding (task steps only; ignored otherwise)
    pub fn with_output(mut self, binding: OutputBinding) -> Self {
        if let StepKind::Task { output_mapping, .. } = &mut self.kind {
            output_mapping.push(binding);
        }
        self
    }
}

/// A multi-step workflow
#[derive(Clone, Debug)]
pub struct Flow {
    pub id: FlowId,
    pub steps: Vec<FlowStep>,
    /// Overall time limit; the runtime default applies when absent
    pub timeout: Option<Duration>,
}

impl Flow {
    pub fn new(id: impl Into<FlowId>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_step(mut self, step: FlowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn step(&self, id: &StepId) -> Option<&FlowStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn first_step(&self) -> Option<&FlowStep> {
        self.steps.first()
    }

    /// Check ids are unique, every reference resolves and no walk loops
    pub fn validate(&self) -> ReflowResult<()> {
        if self.steps.is_empty() {
            return Err(ReflowError::validation(format!(
                "flow '{}' has no steps",
                self.id
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(&step.id) {
                return Err(ReflowError::validation(format!(
                    "flow '{}' declares step '{}' twice",
                    self.id, step.id
                )));
            }
        }

        for step in &self.steps {
            let references = step.next.iter().chain(step.kind.referenced_steps());
            for reference in references {
                if !ids.contains(reference) {
                    return Err(ReflowError::validation(format!(
                        "step '{}' of flow '{}' references unknown step '{}'",
                        step.id, self.id, reference
                    )));
                }
                if reference == &step.id {
                    return Err(ReflowError::validation(format!(
                        "step '{}' of flow '{}' references itself",
                        step.id, self.id
                    )));
                }
            }
        }

        if let Some(step_id) = self.find_cycle() {
            return Err(ReflowError::validation(format!(
                "flow '{}' loops back to step '{}'",
                self.id, step_id
            )));
        }

        Ok(())
    }

    /// Depth-first search over `next` and branch references
    fn find_cycle(&self) -> Option<&StepId> {
        let mut marks = HashMap::new();
        self.steps
            .iter()
            .find_map(|step| self.visit(&step.id, &mut marks))
    }

    fn visit<'a>(
        &'a self,
        id: &'a StepId,
        marks: &mut HashMap<&'a StepId, Mark>,
    ) -> Option<&'a StepId> {
        match marks.get(id) {
            Some(Mark::Visiting) => return Some(id),
            Some(Mark::Done) => return None,
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        if let Some(step) = self.step(id) {
            for reference in step.next.iter().chain(step.kind.referenced_steps()) {
                if let Some(looped) = self.visit(reference, marks) {
                    return Some(looped);
                }
            }
        }
        marks.insert(id, Mark::Done);
        None
    }
}

#[derive(Clone, Copy)]
enum Mark {
    Visiting,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_valid_flow() {
        let flow = Flow::new("f")
            .with_step(FlowStep::task("a", "task-a").then("b"))
            .with_step(FlowStep::parallel(
                "b",
                vec![vec![StepId::new("c")], vec![StepId::new("d")]],
            ))
            .with_step(FlowStep::wait("c", Duration::from_millis(1)))
            .with_step(FlowStep::task("d", "task-d"));
        assert!(flow.validate().is_ok());
        assert_eq!(flow.first_step().unwrap().id, StepId::new("a"));
        assert_eq!(flow.step(&StepId::new("d")).unwrap().kind.name(), "task");
    }

    #[test]
    fn test_rejects_unknown_reference() {
        let flow = Flow::new("f").with_step(FlowStep::task("a", "t").then("missing"));
        let err = flow.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_rejects_duplicates_and_empty() {
        assert!(Flow::new("f").validate().is_err());
        let dup = Flow::new("f")
            .with_step(FlowStep::task("a", "t"))
            .with_step(FlowStep::task("a", "t"));
        assert!(dup.validate().is_err());
    }

    #[test]
    fn test_rejects_self_branch() {
        let flow = Flow::new("f").with_step(FlowStep::condition(
            "c",
            |_, _| true,
            vec![StepId::new("c")],
            vec![],
        ));
        assert!(flow.validate().is_err());
    }

    #[test]
    fn test_rejects_cycles() {
        let looped = Flow::new("loop")
            .with_step(FlowStep::task("a", "t").then("b"))
            .with_step(FlowStep::task("b", "t").then("a"));
        let err = looped.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(err.to_string().contains("loops back"));

        let through_branch = Flow::new("f")
            .with_step(FlowStep::parallel("p", vec![vec![StepId::new("x")]]))
            .with_step(FlowStep::task("x", "t").then("p"));
        assert!(through_branch.validate().is_err());
    }

    #[test]
    fn test_shared_join_step_is_not_a_cycle() {
        let flow = Flow::new("diamond")
            .with_step(FlowStep::condition(
                "c",
                |_, _| true,
                vec![StepId::new("left")],
                vec![StepId::new("right")],
            ).then("join"))
            .with_step(FlowStep::task("left", "t").then("join"))
            .with_step(FlowStep::task("right", "t").then("join"))
            .with_step(FlowStep::task("join", "t"));
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn test_bindings_only_apply_to_tasks() {
        let binding = InputBinding::parse("id", "input.id").unwrap();
        let wait = FlowStep::wait("w", Duration::from_millis(1)).with_input(binding.clone());
        assert!(matches!(wait.kind, StepKind::Wait { .. }));

        let task = FlowStep::task("t", "task").with_input(binding);
        match task.kind {
            StepKind::Task { input_mapping, .. } => assert_eq!(input_mapping.len(), 1),
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
