//! Tool records: named sandboxed executables invocable by a model.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolId;

/// Tool names must be safe to use as function identifiers in the sandbox.
pub fn is_valid_tool_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_]+$").expect("valid tool name pattern"))
        .is_match(name)
}

/// A persisted tool: unique per (namespace, name).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRecord {
    pub id: ToolId,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-Schema-shaped parameter spec.
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    #[serde(default)]
    pub code: String,
    /// Absent means the tool ends the model turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_turn: Option<bool>,
}

fn default_parameters() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolRecord {
    /// Whether a call to this tool terminates the current model turn.
    /// Unknown/absent defaults to true.
    pub fn ends_turn(&self) -> bool {
        self.ends_turn.unwrap_or(true)
    }

    /// The definition advertised to the model.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// The subset of a tool the model sees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str, ends_turn: Option<bool>) -> ToolRecord {
        ToolRecord {
            id: ToolId::new(),
            namespace: "default".into(),
            name: name.into(),
            description: "test".into(),
            parameters: json!({"type": "object"}),
            code: "print('{}')".into(),
            ends_turn,
        }
    }

    #[test]
    fn ends_turn_defaults_to_true() {
        assert!(record("legacy_tool", None).ends_turn());
        assert!(record("terminal_tool", Some(true)).ends_turn());
        assert!(!record("chain_tool", Some(false)).ends_turn());
    }

    #[test]
    fn tool_name_charset() {
        assert!(is_valid_tool_name("update_env"));
        assert!(is_valid_tool_name("Tool2"));
        assert!(!is_valid_tool_name("bad-name"));
        assert!(!is_valid_tool_name("has space"));
        assert!(!is_valid_tool_name(""));
    }

    #[test]
    fn definition_excludes_code() {
        let def = record("search", None).definition();
        assert_eq!(def.name, "search");
        let json = serde_json::to_value(&def).unwrap();
        assert!(json.get("code").is_none());
    }

    #[test]
    fn parameters_default_is_empty_object_schema() {
        let record: ToolRecord = serde_json::from_value(json!({
            "id": "tool_x",
            "namespace": "default",
            "name": "bare"
        }))
        .unwrap();
        assert_eq!(record.parameters["type"], "object");
    }
}
