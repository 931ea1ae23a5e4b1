use serde::{Deserialize, Serialize};

/// A closed value type for event payloads and context flags. Concrete and
/// `Clone + Serialize` rather than a trait object, mirroring a small flags
/// map kept alongside instance state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    Str(String),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::I64(i)
                } else {
                    Value::Str(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(a) => Value::List(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => Value::Map(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

/// A point-in-time read of a running machine: the dotted active-state
/// string and the ordered context flags written by actions.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub state_string: String,
    pub context_data: Vec<(String, Value)>,
}

/// Joins a set of active leaf paths into the canonical state string: plain
/// dotted path for a single leaf, comma-joined region paths for a parallel
/// configuration. `leaves` must already be in document order.
pub fn format_state_string(leaves: &[&str]) -> String {
    leaves.join(",")
}
