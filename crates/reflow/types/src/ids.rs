//! Identifiers for Reflow entities
//!
//! Definitions (processes, tasks, flows, steps) are named by their authors,
//! so their ids are plain strings. Instances and transactions are minted by
//! the runtime from a v4 uuid.

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a process definition (e.g. `order-process`)
    ProcessId
);
string_id!(
    /// Identifier of a registered task
    TaskId
);
string_id!(
    /// Identifier of a registered flow
    FlowId
);
string_id!(
    /// Identifier of a step within a flow
    StepId
);
string_id!(
    /// Unique identifier for a process instance
    InstanceId
);
string_id!(
    /// Unique identifier for a transaction
    TransactionId
);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// First eight characters, for log lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((cut, _)) => &self.0[..cut],
            None => &self.0,
        }
    }
}

impl TransactionId {
    pub fn generate() -> Self {
        Self(format!("tx-{}", uuid::Uuid::new_v4()))
    }
}
