//! Lifecycle events for experiment execution.
//!
//! One [`ExperimentEvent`] vocabulary serves three consumers: lifecycle
//! hooks bind to an [`EventKind`], live stream consumers tap the bus, and
//! the LOG variant doubles as the structured logging channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::Environment;
use crate::ids::ExperimentId;
use crate::messages::ChatMessage;

/// Origin of a LOG event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSource {
    System,
    Hook,
    Role,
}

/// The fixed event vocabulary. Scripts bind to exactly one kind.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ExperimentStart,
    StepStart,
    RoleStart,
    ModelPrompt,
    ModelResponseChunk,
    ModelResponseComplete,
    ToolCall,
    ToolResult,
    StepEnd,
    ExperimentEnd,
    Log,
    BeforeToolCall,
    AfterToolCall,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&s)
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_owned()))
            .map_err(|_| format!("unknown event kind: {s}"))
    }
}

/// Lifecycle events emitted during experiment execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all_fields = "camelCase")]
pub enum ExperimentEvent {
    ExperimentStart {
        experiment_id: ExperimentId,
        plan_name: String,
    },

    StepStart {
        experiment_id: ExperimentId,
        step: u32,
    },

    RoleStart {
        experiment_id: ExperimentId,
        role: String,
    },

    ModelPrompt {
        experiment_id: ExperimentId,
        role: String,
        messages: Vec<ChatMessage>,
    },

    ModelResponseChunk {
        experiment_id: ExperimentId,
        role: String,
        chunk: String,
    },

    ModelResponseComplete {
        experiment_id: ExperimentId,
        role: String,
        text: String,
    },

    ToolCall {
        experiment_id: ExperimentId,
        tool: String,
        args: Value,
    },

    ToolResult {
        experiment_id: ExperimentId,
        tool: String,
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    StepEnd {
        experiment_id: ExperimentId,
        step: u32,
        environment_snapshot: Environment,
    },

    ExperimentEnd {
        experiment_id: ExperimentId,
        result: String,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    Log {
        experiment_id: ExperimentId,
        step: u32,
        source: LogSource,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    BeforeToolCall {
        experiment_id: ExperimentId,
        tool: String,
        args: Value,
    },

    AfterToolCall {
        experiment_id: ExperimentId,
        tool: String,
        result: Value,
    },
}

impl ExperimentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ExperimentStart { .. } => EventKind::ExperimentStart,
            Self::StepStart { .. } => EventKind::StepStart,
            Self::RoleStart { .. } => EventKind::RoleStart,
            Self::ModelPrompt { .. } => EventKind::ModelPrompt,
            Self::ModelResponseChunk { .. } => EventKind::ModelResponseChunk,
            Self::ModelResponseComplete { .. } => EventKind::ModelResponseComplete,
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::ToolResult { .. } => EventKind::ToolResult,
            Self::StepEnd { .. } => EventKind::StepEnd,
            Self::ExperimentEnd { .. } => EventKind::ExperimentEnd,
            Self::Log { .. } => EventKind::Log,
            Self::BeforeToolCall { .. } => EventKind::BeforeToolCall,
            Self::AfterToolCall { .. } => EventKind::AfterToolCall,
        }
    }

    pub fn experiment_id(&self) -> &ExperimentId {
        match self {
            Self::ExperimentStart { experiment_id, .. }
            | Self::StepStart { experiment_id, .. }
            | Self::RoleStart { experiment_id, .. }
            | Self::ModelPrompt { experiment_id, .. }
            | Self::ModelResponseChunk { experiment_id, .. }
            | Self::ModelResponseComplete { experiment_id, .. }
            | Self::ToolCall { experiment_id, .. }
            | Self::ToolResult { experiment_id, .. }
            | Self::StepEnd { experiment_id, .. }
            | Self::ExperimentEnd { experiment_id, .. }
            | Self::Log { experiment_id, .. }
            | Self::BeforeToolCall { experiment_id, .. }
            | Self::AfterToolCall { experiment_id, .. } => experiment_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_accessor_matches_variant() {
        let id = ExperimentId::new();
        let event = ExperimentEvent::StepStart {
            experiment_id: id.clone(),
            step: 3,
        };
        assert_eq!(event.kind(), EventKind::StepStart);
        assert_eq!(event.experiment_id(), &id);
    }

    #[test]
    fn serde_tag_is_screaming_snake() {
        let event = ExperimentEvent::BeforeToolCall {
            experiment_id: ExperimentId::new(),
            tool: "search".into(),
            args: json!({}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "BEFORE_TOOL_CALL");
        assert_eq!(json["tool"], "search");
    }

    #[test]
    fn event_kind_display_and_parse() {
        for kind in [
            EventKind::ExperimentStart,
            EventKind::ModelResponseChunk,
            EventKind::AfterToolCall,
            EventKind::Log,
        ] {
            let s = kind.to_string();
            let parsed: EventKind = s.parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert_eq!(EventKind::ExperimentStart.to_string(), "EXPERIMENT_START");
        assert!("NOT_A_KIND".parse::<EventKind>().is_err());
    }

    #[test]
    fn log_event_roundtrip() {
        let event = ExperimentEvent::Log {
            experiment_id: ExperimentId::new(),
            step: 1,
            source: LogSource::Hook,
            message: "hook failed".into(),
            data: Some(json!({"error": "boom"})),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"HOOK\""));
        let parsed: ExperimentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn experiment_end_omits_absent_error() {
        let event = ExperimentEvent::ExperimentEnd {
            experiment_id: ExperimentId::new(),
            result: "done".into(),
            duration_ms: 12,
            error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("error"));
    }
}
