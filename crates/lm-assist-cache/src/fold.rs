use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lm_assist_ingest::{
    AssistantContent, AssistantRecord, IndexedRecord, ProgressRecord, ResultRecord, SessionLine,
    SystemRecord, UserContent, UserRecord, parse_timestamp,
};
use lm_assist_types::{
    AssistantResponse, COMPACT_MARKER, PlanRecord, ProgressUpdate, RecordKind, SessionSnapshot,
    SubagentInvocation, SubagentStatus, TaskRecord, TaskStatus, TeamMessage, TeamOperation,
    ThinkingBlock, TodoItem, TokenUsage, ToolResultRecord, ToolUse, UserPrompt, estimate_cost,
};

use crate::compact::parse_compact_message;
use crate::status::{StatusInputs, classify};

const SUBAGENT_RESULT_CAP: usize = 2000;
const PROGRESS_TEXT_CAP: usize = 500;

static TASK_CREATED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Task #(\d+) created successfully").unwrap());
static REQUEST_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""request_id"\s*:\s*"([^"]+)""#).unwrap());

/// Incremental extractor state: a running fold over parsed records.
///
/// The same code path serves full parses and mid-file resumes; feeding the
/// records of `[0, n)` and then `[n, m)` produces exactly the state of
/// feeding `[0, m)` at once. The whole struct serializes so a restart can
/// resume scanning at `next_byte_offset`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFold {
    snapshot: SessionSnapshot,

    // Reconciliation state
    pending_task_creates: BTreeMap<String, String>,
    tasks: BTreeMap<String, TaskRecord>,
    pending_subagents: BTreeMap<String, usize>,
    todos: BTreeMap<String, TodoItem>,

    // Authoritative result overrides
    result_usage: Option<TokenUsage>,
    result_num_turns: Option<u32>,
    result_cost: Option<f64>,
    result_success: bool,

    // Tail shape for the status machine
    tail_kind: Option<RecordKind>,
    tail_prev_kind: Option<RecordKind>,
    has_assistant: bool,

    compact_count: u32,

    /// Resume cursor: byte offset just past the last complete newline.
    pub next_byte_offset: u64,
    /// Resume cursor: physical line index of the next line.
    pub next_line_index: u64,
}

impl SessionFold {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk of parsed records plus the parser's resume cursors.
    pub fn extend(
        &mut self,
        records: &[IndexedRecord],
        next_byte_offset: u64,
        next_line_index: u64,
        malformed: u64,
    ) {
        for record in records {
            self.apply(record);
        }
        self.next_byte_offset = next_byte_offset;
        self.next_line_index = next_line_index;
        self.snapshot.malformed_lines += malformed;
        self.snapshot.last_byte_offset = next_byte_offset;
        if let Some(last) = records.last() {
            self.snapshot.last_line_index = Some(last.line_index);
        }
    }

    /// Record the file identity seen at extension time, for validation.
    pub fn stamp(&mut self, file_size: u64, modified_at_ms: i64) {
        self.snapshot.file_size = file_size;
        self.snapshot.modified_at_ms = modified_at_ms;
    }

    pub fn file_size(&self) -> u64 {
        self.snapshot.file_size
    }

    pub fn modified_at_ms(&self) -> i64 {
        self.snapshot.modified_at_ms
    }

    pub fn cwd(&self) -> Option<&str> {
        self.snapshot.cwd.as_deref()
    }

    pub fn has_records(&self) -> bool {
        self.snapshot.last_line_index.is_some()
    }

    fn apply(&mut self, record: &IndexedRecord) {
        let line_index = record.line_index;

        if let Some(ts) = record.line.timestamp().and_then(parse_timestamp) {
            if self.snapshot.first_timestamp.is_none() {
                self.snapshot.first_timestamp = Some(ts);
            }
            if self.snapshot.last_timestamp.is_none_or(|last| ts > last) {
                self.snapshot.last_timestamp = Some(ts);
            }
        }

        // Session identity fields on first sight, from any record.
        if self.snapshot.session_id.is_empty()
            && let Some(id) = record.line.session_id()
        {
            self.snapshot.session_id = id.to_string();
        }
        if self.snapshot.cwd.is_none() {
            self.snapshot.cwd = record.line.cwd().map(|s| s.to_string());
        }
        if self.snapshot.team_name.is_none() {
            self.snapshot.team_name = record.line.team_name().map(|s| s.to_string());
        }
        if self.snapshot.version.is_none() {
            self.snapshot.version = record.line.version().map(|s| s.to_string());
        }

        match &record.line {
            SessionLine::System(r) => self.apply_system(r),
            SessionLine::User(r) => self.apply_user(r, line_index),
            SessionLine::Assistant(r) => self.apply_assistant(r, line_index),
            SessionLine::Progress(r) => self.apply_progress(r, line_index),
            SessionLine::Result(r) => self.apply_result(r),
            SessionLine::Summary(_) | SessionLine::FileHistorySnapshot(_) | SessionLine::Unknown => {
            }
        }

        // Progress and bookkeeping records do not move the tail shape.
        let kind = record.line.kind();
        if matches!(
            kind,
            RecordKind::User | RecordKind::Assistant | RecordKind::System | RecordKind::Result
        ) {
            self.tail_prev_kind = self.tail_kind;
            self.tail_kind = Some(kind);
        }
    }

    fn apply_system(&mut self, r: &SystemRecord) {
        if r.subtype.as_deref() == Some("init") {
            if self.snapshot.model.is_none() {
                self.snapshot.model = r.model.clone();
            }
            if self.snapshot.version.is_none() {
                self.snapshot.version = r.claude_code_version.clone();
            }
            if self.snapshot.permission_mode.is_none() {
                self.snapshot.permission_mode = r.permission_mode.clone();
            }
            if self.snapshot.tools.is_empty() {
                self.snapshot.tools = r.tools.clone();
            }
            if self.snapshot.mcp_servers.is_empty() {
                self.snapshot.mcp_servers = r.mcp_server_names();
            }
            return;
        }

        if self.snapshot.system_prompt.is_none()
            && let Some(content) = &r.content
            && !content.contains("<command-name>")
            && !content.contains("<local-command-stdout>")
        {
            self.snapshot.system_prompt = Some(content.clone());
        }
    }

    fn apply_user(&mut self, r: &UserRecord, line_index: u64) {
        self.snapshot.num_turns += 1;
        let turn_index = self.snapshot.num_turns;
        let timestamp = r.timestamp.as_deref().and_then(parse_timestamp);

        let text = r.message.as_ref().and_then(|m| {
            m.content.iter().find_map(|c| match c {
                UserContent::Text { text } if !text.trim().is_empty() => Some(text.clone()),
                _ => None,
            })
        });

        if let Some(text) = text {
            self.snapshot.user_prompt_count += 1;
            let user_prompt_index = self.snapshot.user_prompt_count;

            if text.starts_with(COMPACT_MARKER) {
                let order = self.compact_count;
                self.compact_count += 1;
                self.snapshot.compact_messages.push(parse_compact_message(
                    &text, line_index, turn_index, order,
                ));
            }

            self.snapshot.user_prompts.push(UserPrompt {
                text,
                line_index,
                turn_index,
                user_prompt_index,
                timestamp,
            });
        }

        // Tool results resolve pending task creates and subagents.
        if let Some(message) = &r.message {
            for content in &message.content {
                let UserContent::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } = content
                else {
                    continue;
                };
                let result_text = UserContent::result_text(content);

                if let Some(text) = &result_text {
                    self.snapshot.tool_results.push(ToolResultRecord {
                        tool_use_id: tool_use_id.clone(),
                        text: truncate_chars(text, SUBAGENT_RESULT_CAP),
                        is_error: *is_error,
                        line_index,
                    });
                }

                if let Some(text) = &result_text
                    && let Some(caps) = TASK_CREATED_RE.captures(text)
                {
                    self.resolve_task_id(tool_use_id, &caps[1]);
                }

                if let Some(idx) = self.pending_subagents.get(tool_use_id).copied()
                    && let Some(invocation) = self.snapshot.subagents.get_mut(idx)
                {
                    invocation.status = if *is_error {
                        SubagentStatus::Error
                    } else {
                        SubagentStatus::Completed
                    };
                    invocation.result = result_text.map(|t| truncate_chars(&t, SUBAGENT_RESULT_CAP));
                    self.pending_subagents.remove(tool_use_id);
                }
            }
        }

        // TodoWrite results surface the new todo list at the top level.
        if let Some(new_todos) = r
            .tool_use_result
            .as_ref()
            .and_then(|v| v.get("newTodos"))
            .and_then(Value::as_array)
        {
            for todo in new_todos {
                self.apply_todo(todo, line_index);
            }
        }
    }

    fn apply_assistant(&mut self, r: &AssistantRecord, line_index: u64) {
        self.snapshot.num_turns += 1;
        let turn_index = self.snapshot.num_turns;
        let timestamp = r.timestamp.as_deref().and_then(parse_timestamp);
        self.has_assistant = true;

        let Some(message) = &r.message else {
            return;
        };

        if self.snapshot.model.is_none() {
            self.snapshot.model = message.model.clone();
        }

        if let Some(usage) = &message.usage {
            self.snapshot.usage.add(&usage.to_usage());
        }

        for content in &message.content {
            match content {
                AssistantContent::Text { text } => {
                    let request_id = if r.is_api_error_message {
                        r.request_id.clone().or_else(|| {
                            REQUEST_ID_RE.captures(text).map(|c| c[1].to_string())
                        })
                    } else {
                        None
                    };
                    self.snapshot.responses.push(AssistantResponse {
                        text: text.clone(),
                        line_index,
                        turn_index,
                        timestamp,
                        is_api_error: r.is_api_error_message,
                        request_id,
                    });
                }
                AssistantContent::Thinking { thinking } => {
                    self.snapshot.thinking.push(ThinkingBlock {
                        text: thinking.clone(),
                        line_index,
                        turn_index,
                    });
                }
                AssistantContent::ToolUse { id, name, input } => {
                    self.apply_tool_use(id, name, input, line_index, turn_index);
                }
                AssistantContent::Unknown => {}
            }
        }
    }

    fn apply_tool_use(
        &mut self,
        id: &str,
        name: &str,
        input: &Value,
        line_index: u64,
        turn_index: u32,
    ) {
        self.snapshot.tool_uses.push(ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input: input.clone(),
            line_index,
            turn_index,
        });

        match name {
            "TaskCreate" => self.apply_task_create(id, input, line_index, turn_index),
            "TaskUpdate" => self.apply_task_update(input, line_index, turn_index),
            "Task" => {
                let prompt = str_field(input, "prompt").unwrap_or_default();
                let idx = self.snapshot.subagents.len();
                self.snapshot.subagents.push(SubagentInvocation {
                    tool_use_id: id.to_string(),
                    prompt,
                    description: str_field(input, "description"),
                    subagent_type: str_field(input, "subagent_type"),
                    agent_id: None,
                    status: SubagentStatus::Pending,
                    result: None,
                    line_index,
                    turn_index,
                    user_prompt_index: self.snapshot.user_prompt_count,
                    parent_uuid: None,
                });
                self.pending_subagents.insert(id.to_string(), idx);
            }
            "Teammate" => {
                let team_name = str_field(input, "team_name").or_else(|| str_field(input, "name"));
                if let Some(name) = &team_name
                    && self.snapshot.team_name.is_none()
                {
                    self.snapshot.team_name = Some(name.clone());
                }
                self.snapshot.team_operations.push(TeamOperation {
                    operation: str_field(input, "operation"),
                    team_name,
                    line_index,
                    turn_index,
                });
            }
            "SendMessage" => {
                self.snapshot.team_messages.push(TeamMessage {
                    to: str_field(input, "to"),
                    summary: str_field(input, "summary"),
                    line_index,
                    turn_index,
                });
            }
            "EnterPlanMode" | "ExitPlanMode" => {
                let allowed_prompts = input
                    .get("allowedPrompts")
                    .or_else(|| input.get("allowed_prompts"))
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|p| match p {
                                Value::String(s) => Some(s.clone()),
                                Value::Object(map) => map
                                    .get("prompt")
                                    .and_then(Value::as_str)
                                    .map(|s| s.to_string()),
                                _ => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                self.snapshot.plans.push(PlanRecord {
                    title: str_field(input, "title"),
                    file: str_field(input, "file").or_else(|| str_field(input, "planFile")),
                    summary: str_field(input, "summary").or_else(|| str_field(input, "plan")),
                    allowed_prompts,
                    line_index,
                    turn_index,
                });
            }
            "TodoWrite" => {
                if let Some(todos) = input.get("todos").and_then(Value::as_array) {
                    for todo in todos {
                        self.apply_todo(todo, line_index);
                    }
                }
            }
            _ => {}
        }
    }

    fn apply_task_create(&mut self, tool_use_id: &str, input: &Value, line_index: u64, turn_index: u32) {
        let temp_id = TaskRecord::pending_id(tool_use_id);
        let task = TaskRecord {
            id: temp_id.clone(),
            subject: str_field(input, "subject").unwrap_or_default(),
            description: str_field(input, "description").unwrap_or_default(),
            status: TaskStatus::Pending,
            owner: str_field(input, "owner"),
            blocks: Vec::new(),
            blocked_by: Vec::new(),
            metadata: input
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            line_index,
            turn_index,
        };
        self.tasks.insert(temp_id.clone(), task);
        self.pending_task_creates
            .insert(tool_use_id.to_string(), temp_id);
    }

    /// Re-key a pending task to the id assigned by the tool result.
    /// Idempotent: a repeated marker for the same tool-use id is a no-op,
    /// and no duplicate task ever coexists.
    fn resolve_task_id(&mut self, tool_use_id: &str, assigned_id: &str) {
        let Some(temp_id) = self.pending_task_creates.remove(tool_use_id) else {
            return;
        };
        let Some(mut task) = self.tasks.remove(&temp_id) else {
            return;
        };
        task.id = assigned_id.to_string();
        // An update may have arrived under the assigned id already; the
        // created fields win only where the existing entry is empty.
        if let Some(existing) = self.tasks.get(assigned_id) {
            let mut merged = existing.clone();
            if merged.subject.is_empty() {
                merged.subject = task.subject;
            }
            if merged.description.is_empty() {
                merged.description = task.description;
            }
            self.tasks.insert(assigned_id.to_string(), merged);
        } else {
            self.tasks.insert(assigned_id.to_string(), task);
        }
    }

    fn apply_task_update(&mut self, input: &Value, line_index: u64, turn_index: u32) {
        let Some(task_id) = input
            .get("taskId")
            .or_else(|| input.get("task_id"))
            .and_then(value_as_id)
        else {
            return;
        };

        let task = self
            .tasks
            .entry(task_id.clone())
            .or_insert_with(|| TaskRecord {
                id: task_id.clone(),
                subject: String::new(),
                description: String::new(),
                status: TaskStatus::Pending,
                owner: None,
                blocks: Vec::new(),
                blocked_by: Vec::new(),
                metadata: serde_json::Map::new(),
                line_index,
                turn_index,
            });

        if let Some(subject) = str_field(input, "subject") {
            task.subject = subject;
        }
        if let Some(description) = str_field(input, "description") {
            task.description = description;
        }
        if let Some(status) = str_field(input, "status").and_then(|s| TaskStatus::parse(&s)) {
            task.status = status;
        }
        if let Some(owner) = str_field(input, "owner") {
            task.owner = Some(owner);
        }
        if let Some(metadata) = input.get("metadata").and_then(Value::as_object) {
            for (k, v) in metadata {
                if v.is_null() {
                    task.metadata.remove(k);
                } else {
                    task.metadata.insert(k.clone(), v.clone());
                }
            }
        }
        for (field, list) in [("addBlocks", true), ("addBlockedBy", false)] {
            if let Some(ids) = input.get(field).and_then(Value::as_array) {
                for id in ids.iter().filter_map(value_as_id) {
                    let target = if list {
                        &mut task.blocks
                    } else {
                        &mut task.blocked_by
                    };
                    if !target.contains(&id) {
                        target.push(id);
                    }
                }
            }
        }
    }

    fn apply_todo(&mut self, todo: &Value, line_index: u64) {
        let Some(content) = todo.get("content").and_then(Value::as_str) else {
            return;
        };
        let status = todo
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("pending")
            .to_string();
        let active_form = todo
            .get("activeForm")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        // Dedup by content; the latest sighting wins.
        self.todos.insert(
            content.to_string(),
            TodoItem {
                content: content.to_string(),
                status,
                active_form,
                line_index,
            },
        );
    }

    fn apply_progress(&mut self, r: &ProgressRecord, line_index: u64) {
        if r.data_type() == Some("agent_progress")
            && let Some(parent_id) = &r.parent_tool_use_id
            && let Some(idx) = self.pending_subagents.get(parent_id).copied()
            && let Some(invocation) = self.snapshot.subagents.get_mut(idx)
        {
            if invocation.agent_id.is_none() {
                invocation.agent_id = r.agent_id().map(|s| s.to_string());
            }
            if invocation.status == SubagentStatus::Pending {
                invocation.status = SubagentStatus::Running;
            }
        }

        if let Some(text) = r.text() {
            self.snapshot.progress_updates.push(ProgressUpdate {
                text: truncate_chars(text, PROGRESS_TEXT_CAP),
                line_index,
                parent_tool_use_id: r.parent_tool_use_id.clone(),
                timestamp: r.timestamp.as_deref().and_then(parse_timestamp),
            });
        }
    }

    fn apply_result(&mut self, r: &ResultRecord) {
        self.snapshot.completed = true;
        self.snapshot.result_subtype = r.subtype.clone();
        self.snapshot.result_text = r.result.clone();
        self.snapshot.errors = r
            .errors
            .iter()
            .map(|e| match e {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        self.result_success = !r.is_error && r.subtype.as_deref() == Some("success");
        if let Some(usage) = &r.usage {
            self.result_usage = Some(usage.to_usage());
        }
        self.result_num_turns = r.num_turns;
        self.result_cost = r.total_cost_usd;
        if let Some(duration) = r.duration_ms {
            self.snapshot.duration_ms = Some(duration);
        }
    }

    /// Produce the finished view: reconciled tables flattened, cheap
    /// post-parse computations refreshed, status classified against `now`.
    pub fn view(&self, now: DateTime<Utc>) -> SessionSnapshot {
        let mut snapshot = self.snapshot.clone();

        snapshot.tasks = self.tasks.values().cloned().collect();
        snapshot
            .tasks
            .sort_by_key(|t| (t.id.parse::<u64>().unwrap_or(u64::MAX), t.line_index));

        snapshot.todos = self.todos.values().cloned().collect();
        snapshot.todos.sort_by_key(|t| t.line_index);

        if let Some(usage) = &self.result_usage {
            snapshot.usage = *usage;
        }
        if let Some(num_turns) = self.result_num_turns {
            snapshot.num_turns = num_turns;
        }

        if snapshot.duration_ms.is_none()
            && let (Some(first), Some(last)) = (snapshot.first_timestamp, snapshot.last_timestamp)
        {
            snapshot.duration_ms = (last - first).num_milliseconds().try_into().ok();
        }

        snapshot.cost_usd = self.result_cost.or_else(|| {
            snapshot
                .model
                .as_ref()
                .filter(|_| !snapshot.usage.is_empty())
                .map(|model| estimate_cost(model, &snapshot.usage))
        });

        let file_mtime = ms_to_datetime(snapshot.modified_at_ms);
        let last_activity = match (file_mtime, snapshot.last_timestamp) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        snapshot.status = classify(
            &StatusInputs {
                has_result: snapshot.completed,
                result_success: self.result_success,
                last_activity,
                tail_kind: self.tail_kind,
                tail_prev_kind: self.tail_prev_kind,
                has_assistant: self.has_assistant,
            },
            now,
        );

        snapshot
    }
}

fn str_field(input: &Value, field: &str) -> Option<String> {
    input
        .get(field)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

/// Task ids arrive as strings or numbers depending on the tool caller.
fn value_as_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        s.to_string()
    } else {
        s.chars().take(cap).collect()
    }
}

fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        None
    } else {
        DateTime::from_timestamp_millis(ms)
    }
}
