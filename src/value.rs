use crate::error::Error;
use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A recursive tagged value, used for trace environments and any
/// free-form attribute data attached to IR objects.
///
/// Deep copy is [`Clone`]; structural equality is [`PartialEq`]
/// (maps compare entry-wise, arrays compare element-wise).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(OrderedFloat<f64>),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(v.0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Appends an element to an array value.
    pub fn append(&mut self, element: Value) -> Result<(), Error> {
        match self {
            Value::Array(elements) => {
                elements.push(element);
                Ok(())
            }
            _ => Err(Error::invalid("append on a non-array value")),
        }
    }

    pub fn at(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Array(elements) => elements.get(index),
            _ => None,
        }
    }

    /// Inserts an entry into a map value, replacing any previous entry
    /// with the same key.
    pub fn insert<K: Into<String>>(&mut self, key: K, value: Value) -> Result<(), Error> {
        match self {
            Value::Map(entries) => {
                entries.insert(key.into(), value);
                Ok(())
            }
            _ => Err(Error::invalid("insert on a non-map value")),
        }
    }

    pub fn entry(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    pub fn foreach_entry<F: FnMut(&str, &Value)>(&self, mut f: F) {
        if let Value::Map(entries) = self {
            for (key, value) in entries.iter() {
                f(key, value);
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Array(elements) => elements.len(),
            Value::Map(entries) => entries.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(OrderedFloat(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// A trace environment: a map of string or integer entries, rendered
/// as a TSDL `env { ... };` block in the trace metadata.
///
/// The environment freezes together with its trace; a frozen
/// environment rejects every mutation.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct Environment {
    frozen: bool,
    entries: BTreeMap<String, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an entry. Only string and integer values are admissible in
    /// a CTF environment.
    pub fn set<K: Into<String>>(&mut self, name: K, value: Value) -> Result<(), Error> {
        if self.frozen {
            return Err(Error::Frozen("trace environment"));
        }
        if !matches!(value, Value::String(_) | Value::Integer(_)) {
            return Err(Error::invalid(
                "environment entries must be strings or integers",
            ));
        }
        self.entries.insert(name.into(), value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the environment as a TSDL `env` block.
    pub fn to_tsdl(&self) -> String {
        let body = self
            .entries
            .iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some(format!("\t{} = \"{}\";", k, s)),
                Value::Integer(i) => Some(format!("\t{} = {};", k, i)),
                _ => None,
            })
            .join("\n");
        if body.is_empty() {
            "env {\n};\n".to_owned()
        } else {
            format!("env {{\n{}\n}};\n", body)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deep_copy_and_structural_equality() {
        let mut map = Value::Map(Default::default());
        map.insert("pid", Value::from(1207_i64)).unwrap();
        let mut inner = Value::Array(vec![]);
        inner.append(Value::from("a")).unwrap();
        inner.append(Value::Null).unwrap();
        map.insert("tags", inner).unwrap();

        let copy = map.clone();
        assert_eq!(copy, map);

        let mut other = copy.clone();
        other.insert("pid", Value::from(1208_i64)).unwrap();
        assert_ne!(other, map);
    }

    #[test]
    fn equality_is_reflexive_and_symmetric() {
        let a = Value::Array(vec![Value::from(1.5), Value::from(true)]);
        let b = Value::Array(vec![Value::from(1.5), Value::from(true)]);
        assert_eq!(a, a);
        assert_eq!(a == b, b == a);
    }

    #[test]
    fn kind_mismatch_is_invalid() {
        let mut v = Value::from(23_i64);
        assert!(matches!(v.append(Value::Null), Err(Error::Invalid(_))));
        assert!(matches!(v.insert("k", Value::Null), Err(Error::Invalid(_))));
    }

    #[test]
    fn environment_rejects_non_scalar_entries() {
        let mut env = Environment::new();
        env.set("hostname", Value::from("devbox")).unwrap();
        env.set("tracer_major", Value::from(1_i64)).unwrap();
        assert!(matches!(
            env.set("bad", Value::Array(vec![])),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn frozen_environment_rejects_mutation() {
        let mut env = Environment::new();
        env.set("hostname", Value::from("devbox")).unwrap();
        env.freeze();
        assert!(matches!(
            env.set("hostname", Value::from("other")),
            Err(Error::Frozen(_))
        ));
        assert_eq!(env.get("hostname"), Some(&Value::from("devbox")));
    }

    #[test]
    fn tsdl_rendering() {
        let mut env = Environment::new();
        env.set("domain", Value::from("ust")).unwrap();
        env.set("tracer_major", Value::from(2_i64)).unwrap();
        assert_eq!(
            env.to_tsdl(),
            "env {\n\tdomain = \"ust\";\n\ttracer_major = 2;\n};\n"
        );
    }
}
