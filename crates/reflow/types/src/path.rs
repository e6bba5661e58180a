//! Value paths: typed lenses into a flow execution
//!
//! Step bindings address data with dotted descriptors such as
//! `input.order.id`, `variables.total` or `output.receipt`. Descriptors are
//! parsed once, when the flow is built, into a [`ValuePath`]; at run time a
//! path reads through its root and writes create intermediate objects.

use crate::{ReflowError, ReflowResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The container a path starts from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathRoot {
    Input,
    Variables,
    Output,
}

impl PathRoot {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "input" => Some(PathRoot::Input),
            "variables" => Some(PathRoot::Variables),
            "output" => Some(PathRoot::Output),
            _ => None,
        }
    }
}

/// A parsed dotted path rooted at `input`, `variables` or `output`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuePath {
    pub root: PathRoot,
    pub segments: Vec<String>,
}

impl ValuePath {
    pub fn parse(descriptor: &str) -> ReflowResult<Self> {
        let mut parts = descriptor.split('.');
        let head = parts.next().unwrap_or_default();
        let root = PathRoot::parse(head).ok_or_else(|| {
            ReflowError::validation(format!(
                "path '{}' must start with input, variables or output",
                descriptor
            ))
        })?;
        let segments: Vec<String> = parts.map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(ReflowError::validation(format!(
                "path '{}' has an empty segment",
                descriptor
            )));
        }
        Ok(Self { root, segments })
    }

    pub fn variables(segments: &[&str]) -> Self {
        Self {
            root: PathRoot::Variables,
            segments: segments.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn output(segments: &[&str]) -> Self {
        Self {
            root: PathRoot::Output,
            segments: segments.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Read the value this path points at, starting from its root value
    pub fn lookup<'a>(&self, root_value: &'a Value) -> Option<&'a Value> {
        get_path(root_value, &self.segments)
    }

    /// Write `value` at this path, creating intermediate objects
    pub fn assign(&self, root_value: &mut Value, value: Value) {
        set_path(root_value, &self.segments, value);
    }
}

impl std::fmt::Display for ValuePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root = match self.root {
            PathRoot::Input => "input",
            PathRoot::Variables => "variables",
            PathRoot::Output => "output",
        };
        f.write_str(root)?;
        for segment in &self.segments {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

/// Navigate object keys (and array indices) below `value`
pub fn get_path<'a, S: AsRef<str>>(value: &'a Value, segments: &[S]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| {
        let segment = segment.as_ref();
        match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}

/// Write below `value`, replacing non-object intermediates with objects
pub fn set_path<S: AsRef<str>>(value: &mut Value, segments: &[S], new_value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *value = new_value;
        return;
    };
    let mut current = value;
    for segment in parents {
        current = ensure_object(current)
            .entry(segment.as_ref().to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(current).insert(last.as_ref().to_string(), new_value);
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

// ── Bindings ─────────────────────────────────────────────────────────

/// Where a task input field comes from
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InputSource {
    Literal(Value),
    Path(ValuePath),
}

impl InputSource {
    /// Parse the descriptor form: quoted text is a literal string,
    /// anything else is a path
    pub fn parse(descriptor: &str) -> ReflowResult<Self> {
        let trimmed = descriptor.trim();
        if let Some(inner) = strip_quotes(trimmed) {
            return Ok(InputSource::Literal(Value::String(inner.to_string())));
        }
        ValuePath::parse(trimmed).map(InputSource::Path)
    }
}

fn strip_quotes(s: &str) -> Option<&str> {
    if s.len() < 2 {
        return None;
    }
    ['\'', '"']
        .into_iter()
        .find(|q| s.starts_with(*q) && s.ends_with(*q))
        .map(|_| &s[1..s.len() - 1])
}

/// Builds one field of a task's input
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    /// Dotted key inside the task input
    pub key: String,
    pub source: InputSource,
}

impl InputBinding {
    pub fn parse(key: impl Into<String>, descriptor: &str) -> ReflowResult<Self> {
        Ok(Self {
            key: key.into(),
            source: InputSource::parse(descriptor)?,
        })
    }

    pub fn literal(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            source: InputSource::Literal(value),
        }
    }
}

/// Copies part of a task result into the flow's variables or output
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputBinding {
    /// Dotted path inside the task result; empty means the whole result
    pub from: Vec<String>,
    pub to: ValuePath,
}

impl OutputBinding {
    pub fn parse(from: &str, to: &str) -> ReflowResult<Self> {
        let to = ValuePath::parse(to)?;
        if to.root == PathRoot::Input {
            return Err(ReflowError::validation(format!(
                "output binding cannot write to '{}': input is read-only",
                to
            )));
        }
        let from = from
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self { from, to })
    }
}
