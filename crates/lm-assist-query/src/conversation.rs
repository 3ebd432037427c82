use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use lm_assist_types::{CompactMessage, Result, SessionSnapshot, ToolResultRecord};

use crate::service::SessionService;

const FULL_RESULT_CAP: usize = 2000;
const SUMMARY_SNIPPET_CAP: usize = 150;
const MODIFIED_SNIPPET_CAP: usize = 100;

/// How much tool output a conversation view carries per tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolDetail {
    #[default]
    None,
    Summary,
    Full,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationRequest {
    pub session_id: String,
    pub cwd: Option<String>,
    pub tool_detail: ToolDetail,
    /// Keep only the last N messages.
    pub last_n: Option<usize>,
    /// Older-message pagination: only messages strictly before this line.
    pub before_line: Option<u64>,
    pub from_turn_index: Option<u32>,
    pub to_turn_index: Option<u32>,
}

impl ConversationRequest {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

/// One chat-renderable message. Assistant messages coalesce their text
/// blocks with the tool calls of the same turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub role: String,
    pub text: String,
    pub turn_index: u32,
    pub line_index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ConversationToolCall>,
}

impl SessionService {
    /// Flat, ordered message list suitable for chat rendering.
    pub async fn conversation(
        &self,
        request: ConversationRequest,
    ) -> Result<Vec<ConversationMessage>> {
        let path = self.resolve(&request.session_id, request.cwd.as_deref())?;
        let snapshot = self.cache().snapshot(&path).await?;

        let mut messages = build_messages(&snapshot, request.tool_detail);

        if let Some(from) = request.from_turn_index {
            messages.retain(|m| m.turn_index >= from);
        }
        if let Some(to) = request.to_turn_index {
            messages.retain(|m| m.turn_index <= to);
        }
        if let Some(before) = request.before_line {
            messages.retain(|m| m.line_index < before);
        }
        if let Some(n) = request.last_n
            && messages.len() > n
        {
            messages.drain(..messages.len() - n);
        }

        Ok(messages)
    }

    /// Every compact/continuation message, in file order.
    pub async fn compact_messages(
        &self,
        session_id: &str,
        cwd: Option<&str>,
    ) -> Result<Vec<CompactMessage>> {
        let path = self.resolve(session_id, cwd)?;
        let snapshot = self.cache().snapshot(&path).await?;
        Ok(snapshot.compact_messages)
    }

    /// Lightweight catch-up slicing by line index.
    pub async fn messages_from(
        &self,
        session_id: &str,
        cwd: Option<&str>,
        from_line_index: u64,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationMessage>> {
        let path = self.resolve(session_id, cwd)?;
        let snapshot = self.cache().snapshot(&path).await?;

        let mut messages = build_messages(&snapshot, ToolDetail::None);
        messages.retain(|m| m.line_index >= from_line_index);
        if let Some(limit) = limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }
}

fn build_messages(snapshot: &SessionSnapshot, detail: ToolDetail) -> Vec<ConversationMessage> {
    let mut messages: Vec<ConversationMessage> = Vec::new();

    for prompt in &snapshot.user_prompts {
        messages.push(ConversationMessage {
            role: "user".to_string(),
            text: prompt.text.clone(),
            turn_index: prompt.turn_index,
            line_index: prompt.line_index,
            timestamp: prompt.timestamp,
            tool_calls: Vec::new(),
        });
    }

    // Assistant turns coalesce: text blocks join, tool calls attach.
    for response in &snapshot.responses {
        match messages
            .iter_mut()
            .find(|m| m.role == "assistant" && m.turn_index == response.turn_index)
        {
            Some(existing) => {
                if !existing.text.is_empty() {
                    existing.text.push_str("\n\n");
                }
                existing.text.push_str(&response.text);
            }
            None => messages.push(ConversationMessage {
                role: "assistant".to_string(),
                text: response.text.clone(),
                turn_index: response.turn_index,
                line_index: response.line_index,
                timestamp: response.timestamp,
                tool_calls: Vec::new(),
            }),
        }
    }

    for tool_use in &snapshot.tool_uses {
        let result = snapshot
            .tool_results
            .iter()
            .find(|r| r.tool_use_id == tool_use.id);

        let call = ConversationToolCall {
            id: tool_use.id.clone(),
            name: tool_use.name.clone(),
            input: tool_use.input.clone(),
            result_summary: match detail {
                ToolDetail::Summary => result.map(|r| summarize_result(&tool_use.name, r)),
                _ => None,
            },
            result: match detail {
                ToolDetail::Full => result.map(|r| truncate(&r.text, FULL_RESULT_CAP)),
                _ => None,
            },
            is_error: result.is_some_and(|r| r.is_error),
        };

        match messages
            .iter_mut()
            .find(|m| m.role == "assistant" && m.turn_index == tool_use.turn_index)
        {
            Some(existing) => existing.tool_calls.push(call),
            None => messages.push(ConversationMessage {
                role: "assistant".to_string(),
                text: String::new(),
                turn_index: tool_use.turn_index,
                line_index: tool_use.line_index,
                timestamp: None,
                tool_calls: vec![call],
            }),
        }
    }

    messages.sort_by_key(|m| (m.turn_index, m.line_index));
    messages
}

/// Tool-specific one-line result summaries.
fn summarize_result(tool_name: &str, result: &ToolResultRecord) -> String {
    let line_count = result.text.lines().count();
    match tool_name {
        "Read" | "NotebookEdit" => format!("Read {} lines", line_count),
        "Bash" => format!("{} lines of output", line_count),
        "Glob" | "Grep" => format!("{} matches found", line_count),
        "Write" | "Edit" => {
            if result.text.trim().is_empty() {
                "File modified".to_string()
            } else {
                truncate(&result.text, MODIFIED_SNIPPET_CAP)
            }
        }
        _ => truncate(&result.text, SUMMARY_SNIPPET_CAP),
    }
}

fn truncate(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        s.to_string()
    } else {
        s.chars().take(cap).collect()
    }
}
