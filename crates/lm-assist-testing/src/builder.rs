use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

/// Builds a session JSONL file line by line.
///
/// Timestamps advance one second per record from the base time so derived
/// durations and status classification are deterministic.
pub struct SessionFileBuilder {
    session_id: String,
    cwd: String,
    lines: Vec<String>,
    next_ts: DateTime<Utc>,
}

impl SessionFileBuilder {
    pub fn new(session_id: &str, cwd: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            cwd: cwd.to_string(),
            lines: Vec::new(),
            next_ts: Utc::now(),
        }
    }

    /// Set the timestamp of the next record; later records keep advancing
    /// from here.
    pub fn starting_at(mut self, ts: DateTime<Utc>) -> Self {
        self.next_ts = ts;
        self
    }

    fn take_ts(&mut self) -> String {
        let ts = self.next_ts;
        self.next_ts += Duration::seconds(1);
        ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    fn push(&mut self, value: Value) {
        self.lines.push(value.to_string());
    }

    pub fn system_init(mut self, model: &str, tools: &[&str]) -> Self {
        let ts = self.take_ts();
        let session_id = self.session_id.clone();
        self.push(json!({
            "type": "system",
            "subtype": "init",
            "sessionId": session_id,
            "cwd": self.cwd,
            "model": model,
            "tools": tools,
            "mcp_servers": [{"name": "filesystem", "status": "connected"}],
            "permissionMode": "default",
            "claude_code_version": "2.3.0",
            "timestamp": ts,
            "uuid": Uuid::new_v4().to_string(),
        }));
        self
    }

    pub fn user_text(mut self, text: &str) -> Self {
        let ts = self.take_ts();
        let session_id = self.session_id.clone();
        self.push(json!({
            "type": "user",
            "sessionId": session_id,
            "cwd": self.cwd,
            "timestamp": ts,
            "uuid": Uuid::new_v4().to_string(),
            "message": {"role": "user", "content": text},
        }));
        self
    }

    pub fn assistant_text(self, text: &str) -> Self {
        self.assistant_content(json!([{"type": "text", "text": text}]), Some((100, 20)))
    }

    pub fn assistant_tool_use(self, id: &str, name: &str, input: Value) -> Self {
        self.assistant_content(
            json!([{"type": "tool_use", "id": id, "name": name, "input": input}]),
            Some((50, 10)),
        )
    }

    pub fn assistant_content(mut self, content: Value, usage: Option<(u64, u64)>) -> Self {
        let ts = self.take_ts();
        let session_id = self.session_id.clone();
        let mut message = json!({
            "id": format!("msg_{}", self.lines.len()),
            "model": "claude-sonnet-4-5",
            "content": content,
        });
        if let Some((input, output)) = usage {
            message["usage"] = json!({"input_tokens": input, "output_tokens": output});
        }
        self.push(json!({
            "type": "assistant",
            "sessionId": session_id,
            "cwd": self.cwd,
            "timestamp": ts,
            "uuid": Uuid::new_v4().to_string(),
            "message": message,
        }));
        self
    }

    pub fn tool_result(mut self, tool_use_id: &str, text: &str, is_error: bool) -> Self {
        let ts = self.take_ts();
        let session_id = self.session_id.clone();
        self.push(json!({
            "type": "user",
            "sessionId": session_id,
            "cwd": self.cwd,
            "timestamp": ts,
            "uuid": Uuid::new_v4().to_string(),
            "message": {
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": text,
                    "is_error": is_error,
                }],
            },
        }));
        self
    }

    pub fn todo_result(mut self, tool_use_id: &str, todos: Value) -> Self {
        let ts = self.take_ts();
        let session_id = self.session_id.clone();
        self.push(json!({
            "type": "user",
            "sessionId": session_id,
            "timestamp": ts,
            "uuid": Uuid::new_v4().to_string(),
            "message": {
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": "Todos updated",
                }],
            },
            "toolUseResult": {"newTodos": todos},
        }));
        self
    }

    pub fn progress_agent(mut self, parent_tool_use_id: &str, agent_id: &str, text: &str) -> Self {
        let ts = self.take_ts();
        let session_id = self.session_id.clone();
        self.push(json!({
            "type": "progress",
            "sessionId": session_id,
            "timestamp": ts,
            "uuid": Uuid::new_v4().to_string(),
            "parentToolUseID": parent_tool_use_id,
            "data": {"type": "agent_progress", "agentId": agent_id, "message": text},
        }));
        self
    }

    pub fn result(mut self, subtype: &str, total_cost_usd: f64, num_turns: u32) -> Self {
        let ts = self.take_ts();
        let session_id = self.session_id.clone();
        self.push(json!({
            "type": "result",
            "subtype": subtype,
            "session_id": session_id,
            "is_error": subtype != "success",
            "duration_ms": 4500,
            "duration_api_ms": 3200,
            "num_turns": num_turns,
            "total_cost_usd": total_cost_usd,
            "usage": {"input_tokens": 1000, "output_tokens": 200},
            "timestamp": ts,
        }));
        self
    }

    /// Append a raw line verbatim (for malformed-input scenarios).
    pub fn raw_line(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    pub fn content(&self) -> String {
        if self.lines.is_empty() {
            String::new()
        } else {
            format!("{}\n", self.lines.join("\n"))
        }
    }

    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.content())?;
        Ok(())
    }

    /// Append this builder's lines to an existing file, for incremental
    /// extension scenarios.
    pub fn append_to(&self, path: &Path) -> anyhow::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
        file.write_all(self.content().as_bytes())?;
        Ok(())
    }
}
