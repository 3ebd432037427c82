use serde::{Deserialize, Serialize};
use serde_json::Value;

use lm_assist_types::RecordKind;

/// One line of a session file, discriminated by its `type` field.
///
/// The envelope conventions are mixed at the source: user/assistant/progress
/// records use camelCase, while `result` and parts of `system/init` use
/// snake_case. Aliases accept both spellings where the writer has wavered.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "kebab-case")]
pub enum SessionLine {
    System(SystemRecord),
    User(UserRecord),
    Assistant(AssistantRecord),
    Result(ResultRecord),
    Progress(ProgressRecord),
    Summary(SummaryRecord),
    FileHistorySnapshot(SnapshotRecord),
    #[serde(other)]
    Unknown,
}

impl SessionLine {
    pub fn kind(&self) -> RecordKind {
        match self {
            SessionLine::System(_) => RecordKind::System,
            SessionLine::User(_) => RecordKind::User,
            SessionLine::Assistant(_) => RecordKind::Assistant,
            SessionLine::Result(_) => RecordKind::Result,
            SessionLine::Progress(_) => RecordKind::Progress,
            SessionLine::Summary(_) => RecordKind::Summary,
            SessionLine::FileHistorySnapshot(_) => RecordKind::FileHistorySnapshot,
            SessionLine::Unknown => RecordKind::Unknown,
        }
    }

    pub fn timestamp(&self) -> Option<&str> {
        match self {
            SessionLine::System(r) => r.timestamp.as_deref(),
            SessionLine::User(r) => r.timestamp.as_deref(),
            SessionLine::Assistant(r) => r.timestamp.as_deref(),
            SessionLine::Result(r) => r.timestamp.as_deref(),
            SessionLine::Progress(r) => r.timestamp.as_deref(),
            SessionLine::Summary(r) => r.timestamp.as_deref(),
            SessionLine::FileHistorySnapshot(r) => r.timestamp.as_deref(),
            SessionLine::Unknown => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionLine::System(r) => r.session_id.as_deref(),
            SessionLine::User(r) => r.session_id.as_deref(),
            SessionLine::Assistant(r) => r.session_id.as_deref(),
            SessionLine::Result(r) => r.session_id.as_deref(),
            SessionLine::Progress(r) => r.session_id.as_deref(),
            _ => None,
        }
    }

    pub fn cwd(&self) -> Option<&str> {
        match self {
            SessionLine::System(r) => r.cwd.as_deref(),
            SessionLine::User(r) => r.cwd.as_deref(),
            SessionLine::Assistant(r) => r.cwd.as_deref(),
            _ => None,
        }
    }

    pub fn team_name(&self) -> Option<&str> {
        match self {
            SessionLine::System(r) => r.team_name.as_deref(),
            SessionLine::User(r) => r.team_name.as_deref(),
            SessionLine::Assistant(r) => r.team_name.as_deref(),
            _ => None,
        }
    }

    /// Claude Code version from the record envelope.
    pub fn version(&self) -> Option<&str> {
        match self {
            SessionLine::System(r) => r.claude_code_version.as_deref(),
            SessionLine::User(r) => r.version.as_deref(),
            SessionLine::Assistant(r) => r.version.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SystemRecord {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default, rename = "sessionId", alias = "session_id")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, rename = "mcp_servers", alias = "mcpServers")]
    pub mcp_servers: Vec<Value>,
    #[serde(default, rename = "permissionMode", alias = "permission_mode")]
    pub permission_mode: Option<String>,
    #[serde(
        default,
        rename = "claude_code_version",
        alias = "claudeCodeVersion",
        alias = "version"
    )]
    pub claude_code_version: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default, rename = "teamName")]
    pub team_name: Option<String>,
}

impl SystemRecord {
    /// Server names from the init record's `mcp_servers` entries, which are
    /// either bare strings or `{name, status}` objects.
    pub fn mcp_server_names(&self) -> Vec<String> {
        self.mcp_servers
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => map
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(|n| n.to_string()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub parent_uuid: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub is_meta: bool,
    #[serde(default)]
    pub message: Option<UserMessage>,
    /// Top-level tool result payload; carries `newTodos` for TodoWrite.
    #[serde(default)]
    pub tool_use_result: Option<Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UserMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, deserialize_with = "deserialize_user_content")]
    pub content: Vec<UserContent>,
}

fn deserialize_user_content<'de, D>(deserializer: D) -> Result<Vec<UserContent>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrArray {
        String(String),
        Array(Vec<UserContent>),
    }

    match StringOrArray::deserialize(deserializer)? {
        StringOrArray::String(s) => Ok(vec![UserContent::Text { text: s }]),
        StringOrArray::Array(arr) => Ok(arr),
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum UserContent {
    Text {
        text: String,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<Value>,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        #[serde(default)]
        source: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

impl UserContent {
    /// Flatten a tool-result body to text. Bodies are either a plain string
    /// or an array of `{type: "text"}` blocks.
    pub fn result_text(content: &Option<Value>) -> Option<String> {
        match content {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(blocks)) => {
                let parts: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| {
                        if b.get("type").and_then(|t| t.as_str()) == Some("text") {
                            b.get("text").and_then(|t| t.as_str())
                        } else {
                            None
                        }
                    })
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssistantRecord {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub parent_uuid: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub message: Option<AssistantMessage>,
    #[serde(default)]
    pub is_api_error_message: bool,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<AssistantContent>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageRecord>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum AssistantContent {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

/// `message.usage` on assistant records and `usage` on result records,
/// snake_case at the source.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct UsageRecord {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl UsageRecord {
    pub fn to_usage(self) -> lm_assist_types::TokenUsage {
        lm_assist_types::TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ResultRecord {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub duration_api_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<UsageRecord>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub errors: Vec<Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, rename = "parentToolUseID", alias = "parentToolUseId")]
    pub parent_tool_use_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
}

impl ProgressRecord {
    pub fn data_type(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get("type"))
            .and_then(|t| t.as_str())
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get("agentId").or_else(|| d.get("agent_id")))
            .and_then(|a| a.as_str())
    }

    /// Human-readable progress text, wherever the payload put it.
    pub fn text(&self) -> Option<&str> {
        let data = self.data.as_ref()?;
        for key in ["message", "content", "text"] {
            if let Some(s) = data.get(key).and_then(|v| v.as_str()) {
                return Some(s);
            }
        }
        None
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRecord {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub leaf_uuid: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_content_string_form() {
        let line: SessionLine = serde_json::from_str(
            r#"{"type":"user","sessionId":"s1","timestamp":"2026-01-01T00:00:00Z","message":{"role":"user","content":"hello"}}"#,
        )
        .unwrap();
        match line {
            SessionLine::User(u) => {
                let msg = u.message.unwrap();
                assert!(
                    matches!(&msg.content[0], UserContent::Text { text } if text == "hello")
                );
            }
            _ => panic!("expected user record"),
        }
    }

    #[test]
    fn test_unknown_record_type_tolerated() {
        let line: SessionLine =
            serde_json::from_str(r#"{"type":"queue-operation","operation":"enqueue"}"#).unwrap();
        assert!(matches!(line, SessionLine::Unknown));
    }

    #[test]
    fn test_assistant_tool_use_block() {
        let line: SessionLine = serde_json::from_str(
            r#"{"type":"assistant","sessionId":"s1","message":{"id":"m1","model":"claude-sonnet-4-5","content":[{"type":"tool_use","id":"tu_1","name":"Bash","input":{"command":"ls"}}],"usage":{"input_tokens":10,"output_tokens":5}}}"#,
        )
        .unwrap();
        match line {
            SessionLine::Assistant(a) => {
                let msg = a.message.unwrap();
                assert!(matches!(
                    &msg.content[0],
                    AssistantContent::ToolUse { name, .. } if name == "Bash"
                ));
                assert_eq!(msg.usage.unwrap().input_tokens, 10);
            }
            _ => panic!("expected assistant record"),
        }
    }

    #[test]
    fn test_result_record_snake_case() {
        let line: SessionLine = serde_json::from_str(
            r#"{"type":"result","subtype":"success","session_id":"s1","is_error":false,"duration_ms":1200,"num_turns":4,"total_cost_usd":0.05,"usage":{"input_tokens":100,"output_tokens":40}}"#,
        )
        .unwrap();
        match line {
            SessionLine::Result(r) => {
                assert_eq!(r.subtype.as_deref(), Some("success"));
                assert_eq!(r.num_turns, Some(4));
                assert!((r.total_cost_usd.unwrap() - 0.05).abs() < 1e-9);
            }
            _ => panic!("expected result record"),
        }
    }

    #[test]
    fn test_progress_agent_accessors() {
        let line: SessionLine = serde_json::from_str(
            r#"{"type":"progress","sessionId":"s1","parentToolUseID":"tu_x","data":{"type":"agent_progress","agentId":"a9afc2c","message":"exploring"}}"#,
        )
        .unwrap();
        match line {
            SessionLine::Progress(p) => {
                assert_eq!(p.data_type(), Some("agent_progress"));
                assert_eq!(p.agent_id(), Some("a9afc2c"));
                assert_eq!(p.parent_tool_use_id.as_deref(), Some("tu_x"));
                assert_eq!(p.text(), Some("exploring"));
            }
            _ => panic!("expected progress record"),
        }
    }
}
