//! Well-known event types emitted by the runtime

pub const PROCESS_CREATED: &str = "process.created";
pub const PROCESS_STATE_CHANGED: &str = "process.state_changed";
pub const PROCESS_TRANSITION_REJECTED: &str = "process.transition_rejected";
pub const PROCESS_DELETED: &str = "process.deleted";

pub const TASK_STARTED: &str = "task.started";
pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";
pub const TASK_RETRY: &str = "task.retry";

pub const FLOW_STARTED: &str = "flow.started";
pub const FLOW_STEP_COMPLETED: &str = "flow.step.completed";
pub const FLOW_STEP_FAILED: &str = "flow.step.failed";
pub const FLOW_COMPLETED: &str = "flow.completed";
pub const FLOW_FAILED: &str = "flow.failed";

pub const TRANSACTION_BEGUN: &str = "transaction.begun";
pub const TRANSACTION_COMMITTED: &str = "transaction.committed";
pub const TRANSACTION_ROLLED_BACK: &str = "transaction.rolled_back";
