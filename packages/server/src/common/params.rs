//! Job-class and algorithm parameters as a tagged sum type.
//!
//! The scheduler never interprets parameter values; it carries them from the
//! admin layer to the clients (job-class parameters) or to the optimization
//! algorithm. Plugins describe the parameters they accept with
//! [`ParameterStub`]s so the admin layer can render forms.

use serde::{Deserialize, Serialize};

/// A single typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    DurationSecs(u64),
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterValue::Text(_) => ParameterKind::Text,
            ParameterValue::Integer(_) => ParameterKind::Integer,
            ParameterValue::Float(_) => ParameterKind::Float,
            ParameterValue::Boolean(_) => ParameterKind::Boolean,
            ParameterValue::DurationSecs(_) => ParameterKind::Duration,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParameterValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ParameterValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            ParameterValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

/// A named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParameterValue,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: ParameterValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, ParameterValue::Text(value.into()))
    }

    pub fn integer(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, ParameterValue::Integer(value))
    }

    pub fn boolean(name: impl Into<String>, value: bool) -> Self {
        Self::new(name, ParameterValue::Boolean(value))
    }
}

/// An ordered list of named parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterList(Vec<Parameter>);

impl ParameterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, parameter: Parameter) {
        self.0.push(parameter);
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ParameterValue::as_text)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<Parameter> for ParameterList {
    fn from_iter<T: IntoIterator<Item = Parameter>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Expected type of a parameter, for stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Text,
    Integer,
    Float,
    Boolean,
    Duration,
}

/// Schema entry advertised by a plugin: one parameter it accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterStub {
    pub name: String,
    pub display_name: String,
    pub kind: ParameterKind,
    pub required: bool,
}

impl ParameterStub {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        kind: ParameterKind,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            kind,
            required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_lookup_by_name() {
        let params: ParameterList = [
            Parameter::text("metric", "throughput"),
            Parameter::boolean("maximize", true),
        ]
        .into_iter()
        .collect();

        assert_eq!(params.text("metric"), Some("throughput"));
        assert_eq!(params.get("maximize").unwrap().as_boolean(), Some(true));
        assert!(params.get("missing").is_none());
    }

    #[test]
    fn values_roundtrip_through_json() {
        let params: ParameterList = [
            Parameter::integer("warmup", 5),
            Parameter::new("ratio", ParameterValue::Float(0.75)),
        ]
        .into_iter()
        .collect();

        let json = serde_json::to_string(&params).unwrap();
        let back: ParameterList = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn kind_matches_value() {
        assert_eq!(
            ParameterValue::DurationSecs(30).kind(),
            ParameterKind::Duration
        );
    }
}
