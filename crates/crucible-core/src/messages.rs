//! Chat history types exchanged with model providers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model, recorded on the assistant turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_name: String,
    /// Parsed arguments, or a raw JSON string when the backend produced
    /// malformed argument JSON.
    pub args: Value,
}

/// One message in a role's running conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Present on assistant turns that requested tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolInvocation>>,
    /// Present on tool turns: the name of the tool that produced the result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: None,
            name: None,
        }
    }

    pub fn assistant_with_tools(content: impl Into<String>, calls: Vec<ToolInvocation>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: Some(calls),
            name: None,
        }
    }

    pub fn tool_result(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: None,
            name: Some(tool_name.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, ChatRole::System);
        assert_eq!(ChatMessage::user("u").role, ChatRole::User);
        assert_eq!(ChatMessage::assistant("a").role, ChatRole::Assistant);
        assert_eq!(ChatMessage::tool_result("t", "r").role, ChatRole::Tool);
    }

    #[test]
    fn tool_result_carries_name() {
        let msg = ChatMessage::tool_result("calculator", "42");
        assert_eq!(msg.name.as_deref(), Some("calculator"));
        assert_eq!(msg.content, "42");
    }

    #[test]
    fn role_serde_is_lowercase() {
        let json = serde_json::to_string(&ChatRole::Assistant).unwrap();
        assert_eq!(json, r#""assistant""#);
    }

    #[test]
    fn plain_message_omits_optional_fields() {
        let json = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
        assert!(!json.contains("toolCalls"));
        assert!(!json.contains("name"));
    }

    #[test]
    fn assistant_with_tools_roundtrip() {
        let msg = ChatMessage::assistant_with_tools(
            "",
            vec![ToolInvocation {
                tool_name: "search".into(),
                args: json!({"q": "rust"}),
            }],
        );
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }
}
