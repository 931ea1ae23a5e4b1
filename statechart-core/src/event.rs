use crate::snapshot::Value;

/// A value on the wire: a name, an opaque payload, and an optional source
/// machine id. Events carry no identity of their own — two events with the
/// same fields are indistinguishable.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    pub source_machine_id: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self { name: name.into(), payload, source_machine_id: None }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_machine_id = Some(source.into());
        self
    }
}
