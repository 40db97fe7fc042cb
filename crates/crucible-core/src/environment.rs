//! Typed key/value experiment state.
//!
//! An [`Environment`] holds the mutable shared state of an experiment:
//! a map of variables plus an optional type declaration per key. Every
//! write through [`Environment::set`] is validated against the declared
//! [`TypeSpec`]; keys without a declaration accept any JSON value.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Declared type for an environment variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeSpec {
    String,
    Int,
    Float,
    Bool,
    Array,
    Object,
    /// Exact-string membership in a closed set, e.g. `enum:[OPEN,CLOSED]`.
    Enum(Vec<String>),
}

fn enum_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^enum:\[([^\]]*)\]$").expect("valid enum pattern"))
}

impl TypeSpec {
    /// Check a value against this type.
    ///
    /// Int accepts integral numbers only (3.0 passes, 3.1 does not).
    /// Object rejects arrays and null. Enum membership is exact-string match.
    pub fn validates(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Int => match value {
                Value::Number(n) => {
                    n.as_i64().is_some()
                        || n.as_u64().is_some()
                        || n.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
                }
                _ => false,
            },
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Enum(allowed) => value
                .as_str()
                .is_some_and(|s| allowed.iter().any(|a| a == s)),
        }
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Bool => f.write_str("bool"),
            Self::Array => f.write_str("array"),
            Self::Object => f.write_str("object"),
            Self::Enum(values) => write!(f, "enum:[{}]", values.join(",")),
        }
    }
}

impl FromStr for TypeSpec {
    type Err = EnvironmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "bool" => Ok(Self::Bool),
            "array" => Ok(Self::Array),
            "object" => Ok(Self::Object),
            other => {
                if let Some(caps) = enum_pattern().captures(other) {
                    let values = caps[1]
                        .split(',')
                        .map(|v| v.trim().to_owned())
                        .filter(|v| !v.is_empty())
                        .collect();
                    Ok(Self::Enum(values))
                } else {
                    Err(EnvironmentError::UnknownTypeSpec(other.to_owned()))
                }
            }
        }
    }
}

impl Serialize for TypeSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TypeSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("type validation failed for \"{key}\": value {value} is not a valid {expected}")]
    TypeMismatch {
        key: String,
        expected: String,
        value: String,
    },

    #[error("unknown type spec: {0}")]
    UnknownTypeSpec(String),
}

/// Typed mutable key/value state shared across an experiment's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub variable_types: BTreeMap<String, TypeSpec>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a variable.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Write a variable, enforcing its declared type if one exists.
    /// Untyped keys accept any JSON value.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), EnvironmentError> {
        if let Some(spec) = self.variable_types.get(key) {
            if !spec.validates(&value) {
                return Err(EnvironmentError::TypeMismatch {
                    key: key.to_owned(),
                    expected: spec.to_string(),
                    value: value.to_string(),
                });
            }
        }
        let _ = self.variables.insert(key.to_owned(), value);
        Ok(())
    }

    /// Merge a JSON object into the variables, one typed `set` per key.
    /// The first type violation aborts the merge and is returned.
    pub fn merge(&mut self, updates: &Map<String, Value>) -> Result<(), EnvironmentError> {
        for (key, value) in updates {
            self.set(key, value.clone())?;
        }
        Ok(())
    }

    /// Fully detached clone: nested arrays and objects in the copy share
    /// no state with the source.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    /// Build the view a role sees.
    ///
    /// A non-empty whitelist keeps only the listed keys that exist (and
    /// their type declarations). An empty whitelist exposes the FULL
    /// variable set; the whitelist's documented purpose is restrictive,
    /// but empty-means-everything is the established behavior and plans
    /// depend on it.
    pub fn filtered(&self, whitelist: &[String]) -> Self {
        if whitelist.is_empty() {
            return self.deep_copy();
        }
        let mut filtered = Self::new();
        for key in whitelist {
            if let Some(value) = self.variables.get(key) {
                let _ = filtered.variables.insert(key.clone(), value.clone());
            }
            if let Some(spec) = self.variable_types.get(key) {
                let _ = filtered.variable_types.insert(key.clone(), spec.clone());
            }
        }
        filtered
    }

    /// Whether any variables are present.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
