//! Pluggable value schemas
//!
//! Schema authoring and migration live outside the runtime. The runtime only
//! needs a yes/no answer (plus a reason) for a JSON value, so a schema is a
//! named predicate.

use crate::{ReflowError, ReflowResult};
use serde_json::Value;
use std::sync::Arc;

type ValidateFn = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

/// A named validator over JSON values
#[derive(Clone)]
pub struct Schema {
    name: String,
    validate: Arc<ValidateFn>,
}

impl Schema {
    /// Wrap an arbitrary validation function
    pub fn custom<F>(name: impl Into<String>, validate: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            validate: Arc::new(validate),
        }
    }

    /// Accept only JSON objects that carry every listed field
    pub fn object_with_required<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        let name = format!("object({})", fields.join(", "));
        Self::custom(name, move |value| {
            let object = value
                .as_object()
                .ok_or_else(|| format!("expected an object, got {}", type_name(value)))?;
            let missing: Vec<&str> = fields
                .iter()
                .filter(|f| !object.contains_key(f.as_str()))
                .map(String::as_str)
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(format!("missing required field(s): {}", missing.join(", ")))
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate a value, mapping failures to `VALIDATION_ERROR`
    pub fn validate(&self, value: &Value) -> ReflowResult<()> {
        (self.validate)(value)
            .map_err(|reason| ReflowError::Validation(format!("{}: {}", self.name, reason)))
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema").field("name", &self.name).finish()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
