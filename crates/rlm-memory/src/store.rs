use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use rlm_core::{Result, RlmError};

/// Named values produced during a session.
///
/// Starts empty. Values are arbitrary JSON; writes overwrite. Reads never
/// mutate, so `final_var` can be repeated and returns the same value each time.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    vars: BTreeMap<String, Value>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite `name`.
    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        debug!(var = %name, "set_var");
        self.vars.insert(name, value);
    }

    /// The value of `name`, or `default` when unset. Never fails.
    pub fn get_var(&self, name: &str, default: Value) -> Value {
        self.vars.get(name).cloned().unwrap_or(default)
    }

    /// The full stored value of `name`, used as a session's terminal answer.
    pub fn final_var(&self, name: &str) -> Result<Value> {
        self.vars
            .get(name)
            .cloned()
            .ok_or_else(|| RlmError::VariableNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Variable names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    /// All variables as a JSON object.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.vars.clone().into_iter().collect())
    }
}

/// Text form of a stored value: strings verbatim, everything else as JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
