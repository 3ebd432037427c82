use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::TaskRecord;
use crate::usage::TokenUsage;

/// Derived session status, computed on read (never stored).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Error,
    Running,
    Interrupted,
    Idle,
    #[default]
    Stale,
}

/// Coarse kind of the raw record at a given line, used for tail-shape
/// inspection by the status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    System,
    User,
    Assistant,
    Result,
    Progress,
    Summary,
    FileHistorySnapshot,
    Unknown,
}

/// A user turn containing real text (tool-result-only user records do not
/// produce one of these).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPrompt {
    pub text: String,
    pub line_index: u64,
    pub turn_index: u32,
    pub user_prompt_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One assistant text block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponse {
    pub text: String,
    pub line_index: u64,
    pub turn_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_api_error: bool,
    /// Request id extracted from the API error body, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingBlock {
    pub text: String,
    pub line_index: u64,
    pub turn_index: u32,
}

/// A structured tool call made by the assistant. `line_index` is the line of
/// the assistant record that contains the call, never of its later result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub line_index: u64,
    pub turn_index: u32,
}

/// Progress record retained for inspection (text capped at 500 chars).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub text: String,
    pub line_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Todo entry from `TodoWrite`; deduplicated by content, latest status wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub content: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
    pub line_index: u64,
}

/// Plan derived from `EnterPlanMode` / `ExitPlanMode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub allowed_prompts: Vec<String>,
    pub line_index: u64,
    pub turn_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// Invocation of the subagent-spawning `Task` tool, anchored to the parent
/// session's indices. The runtime `agent_id` binds later, from an
/// `agent_progress` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentInvocation {
    pub tool_use_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub status: SubagentStatus,
    /// Result text from the tool result, truncated to 2000 chars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub line_index: u64,
    pub turn_index: u32,
    pub user_prompt_index: u32,
    /// Parent message uuid, mirrored from the subagent file header once
    /// the file is discovered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
}

/// One section of a compact/continuation summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactSection {
    pub title: String,
    pub body: String,
}

/// A user record marking context compaction, parsed into its numbered
/// sections. `compact_order` is 0, 1, 2… in file order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactMessage {
    pub line_index: u64,
    pub turn_index: u32,
    pub compact_order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_request: Option<String>,
    #[serde(default)]
    pub key_concepts: Vec<String>,
    #[serde(default)]
    pub sections: Vec<CompactSection>,
}

/// `Teammate` tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    pub line_index: u64,
    pub turn_index: u32,
}

/// `SendMessage` tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub line_index: u64,
    pub turn_index: u32,
}

/// Tool result echoed back in a user record, retained (capped) so
/// conversation views can summarize tool output without a raw re-read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultRecord {
    pub tool_use_id: String,
    pub text: String,
    #[serde(default)]
    pub is_error: bool,
    pub line_index: u64,
}

/// A raw (schema-loose) record, kept separately from the structured view
/// because not all consumers need the full line payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub line_index: u64,
    pub record_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub json: Value,
}

/// The per-file incremental structured view of one session.
///
/// Extended in place as the agent appends; every array is ordered by
/// `line_index` and indexes never change once assigned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub user_prompts: Vec<UserPrompt>,
    #[serde(default)]
    pub responses: Vec<AssistantResponse>,
    #[serde(default)]
    pub thinking: Vec<ThinkingBlock>,
    #[serde(default)]
    pub tool_uses: Vec<ToolUse>,
    #[serde(default)]
    pub tool_results: Vec<ToolResultRecord>,
    #[serde(default)]
    pub progress_updates: Vec<ProgressUpdate>,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub todos: Vec<TodoItem>,
    #[serde(default)]
    pub plans: Vec<PlanRecord>,
    #[serde(default)]
    pub subagents: Vec<SubagentInvocation>,
    #[serde(default)]
    pub compact_messages: Vec<CompactMessage>,
    #[serde(default)]
    pub team_operations: Vec<TeamOperation>,
    #[serde(default)]
    pub team_messages: Vec<TeamMessage>,

    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub user_prompt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,

    /// Derived on read; see the status state machine.
    #[serde(default = "default_status")]
    pub status: SessionStatus,

    /// Line index of the last successfully parsed record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_line_index: Option<u64>,
    /// Byte position just past the last complete newline consumed.
    #[serde(default)]
    pub last_byte_offset: u64,
    /// Malformed (skipped) line count.
    #[serde(default)]
    pub malformed_lines: u64,
    /// File size at the time of the last extension, for validation.
    #[serde(default)]
    pub file_size: u64,
    /// File mtime (ms since epoch) at the time of the last extension.
    #[serde(default)]
    pub modified_at_ms: i64,
}

fn default_status() -> SessionStatus {
    SessionStatus::Stale
}

impl SessionSnapshot {
    /// Effective tool list: the distinct tool names actually used, falling
    /// back to the init-record tool list for sessions without tool calls.
    pub fn effective_tools(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for tu in &self.tool_uses {
            if !seen.contains(&tu.name) {
                seen.push(tu.name.clone());
            }
        }
        if seen.is_empty() {
            return self.tools.clone();
        }
        seen
    }
}

/// Summary row for the project session listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListing {
    pub session_id: String,
    pub project_path: String,
    pub file_path: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// First 200 chars of the last real user message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user_message: Option<String>,
    pub user_prompt_count: u32,
    pub task_count: usize,
    pub plan_count: usize,
    /// Subagent file count read from disk, not from Task tool calls.
    pub agent_file_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<String>,
    pub status: SessionStatus,
}

/// One row per directory under the projects root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectListing {
    /// Canonical path, re-derived from the `cwd` field of a scanned record
    /// whenever possible (the encoded directory name is ambiguous).
    pub project_path: String,
    pub encoded_key: String,
    pub session_count: usize,
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}
