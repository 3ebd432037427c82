use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use lm_assist_types::{
    BlockingEvent, BlockingKind, BlockingStatus, ChunkKind, Error, EventMetadata, ExecutionQuery,
    ExecutionRecord, ExecutionStatus, FileChangeSummary, OutputChunk, Result, StoredEvent,
    TierStats, TokenUsage,
};

use crate::persist::{append_event_line, load_json_array, save_json_array, save_json_file};

/// Execution store tuning and persistence location.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_events: usize,
    pub max_executions: usize,
    pub cleanup_age_ms: u64,
    pub persist_enabled: bool,
    /// `{projectPath}/.lm-assist`
    pub state_dir: PathBuf,
}

impl StoreConfig {
    pub fn for_project(project_path: &std::path::Path) -> Self {
        Self {
            max_events: 10_000,
            max_executions: 1_000,
            cleanup_age_ms: 7 * 24 * 60 * 60 * 1000,
            persist_enabled: true,
            state_dir: project_path.join(lm_assist_types::STATE_DIR),
        }
    }
}

/// Events fanned out to subscribers.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    ExecutionStart(ExecutionRecord),
    ExecutionComplete(ExecutionRecord),
    ExecutionError(ExecutionRecord),
    Output {
        execution_id: String,
        chunk: OutputChunk,
    },
    Blocking(BlockingEvent),
}

type Listener = Box<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Default)]
struct StoreState {
    executions: Vec<ExecutionRecord>,
    events: Vec<StoredEvent>,
    blocking: Vec<BlockingEvent>,
    session_changes: HashMap<String, FileChangeSummary>,
    by_claude_session: HashMap<String, String>,
}

/// Ring-buffered tracker of live executions, their streamed output, raw
/// SDK events, and blocking decisions.
///
/// All mutation goes through one lock; reads snapshot under the lock and
/// release it before any I/O. Listeners run outside the lock and their
/// panics are swallowed so one bad subscriber cannot stall emission.
pub struct ExecutionStore {
    state: Mutex<StoreState>,
    listeners: Mutex<Vec<Listener>>,
    config: StoreConfig,
}

#[derive(Debug, Clone, Default)]
pub struct StartExecution {
    pub tier: Option<String>,
    pub agent_type: Option<String>,
    pub prompt: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompleteExecution {
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub usage: TokenUsage,
    pub cost_usd: Option<f64>,
    pub files_changed: Vec<String>,
    pub error: Option<String>,
}

impl ExecutionStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            listeners: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Listener) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn emit(&self, event: StoreEvent) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(&event);
            }));
            if result.is_err() {
                warn!("execution store listener panicked; continuing");
            }
        }
    }

    /// Create a running execution, evicting the oldest finished one when the
    /// ring is full. A ring full of unfinished work is back-pressure.
    pub async fn start_execution(&self, request: StartExecution) -> Result<ExecutionRecord> {
        let record = {
            let mut state = self.state.lock().unwrap();

            if state.executions.len() >= self.config.max_executions {
                let evict_at = state
                    .executions
                    .iter()
                    .position(|e| e.status.is_evictable());
                match evict_at {
                    Some(idx) => {
                        state.executions.remove(idx);
                    }
                    None => return Err(Error::OverCapacity(self.config.max_executions)),
                }
            }

            let record = ExecutionRecord {
                id: Uuid::new_v4().to_string(),
                claude_session_id: None,
                tier: request.tier,
                agent_type: request.agent_type,
                prompt: request.prompt,
                context: request.context,
                status: ExecutionStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
                duration_ms: None,
                output: None,
                chunks: Vec::new(),
                usage: TokenUsage::default(),
                cost_usd: None,
                files_changed: Vec::new(),
                event_ids: Vec::new(),
                session_changes: None,
                error: None,
            };
            state.executions.push(record.clone());
            record
        };

        self.log_lifecycle("execution_start", &record).await?;
        self.emit(StoreEvent::ExecutionStart(record.clone()));
        Ok(record)
    }

    /// Push a streamed output chunk onto a running execution.
    pub fn append_output(&self, execution_id: &str, chunk: OutputChunk) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let record = find_mut(&mut state.executions, execution_id)?;
            record.chunks.push(chunk.clone());
        }
        self.emit(StoreEvent::Output {
            execution_id: execution_id.to_string(),
            chunk,
        });
        Ok(())
    }

    /// Store a raw SDK event: indexed metadata, linked to its execution,
    /// translated into output chunks per event kind, appended to the log.
    pub async fn record_sdk_event(
        &self,
        execution_id: Option<&str>,
        kind: &str,
        payload: Value,
    ) -> Result<StoredEvent> {
        let event = StoredEvent {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.map(|s| s.to_string()),
            kind: kind.to_string(),
            metadata: extract_metadata(kind, &payload),
            payload,
            timestamp: Utc::now(),
        };

        let chunks = translate_event(&event);

        {
            let mut state = self.state.lock().unwrap();
            if state.events.len() >= self.config.max_events {
                state.events.remove(0);
            }
            state.events.push(event.clone());

            if let Some(id) = execution_id
                && let Ok(record) = find_mut(&mut state.executions, id)
            {
                record.event_ids.push(event.id.clone());
                record.chunks.extend(chunks.iter().cloned());
            }
        }

        if let Some(id) = execution_id {
            for chunk in chunks {
                self.emit(StoreEvent::Output {
                    execution_id: id.to_string(),
                    chunk,
                });
            }
        }

        self.append_event(&event).await?;
        Ok(event)
    }

    /// Finish an execution. Terminal statuses are monotone: completing an
    /// already-finished execution leaves it untouched.
    pub async fn complete_execution(
        &self,
        execution_id: &str,
        request: CompleteExecution,
    ) -> Result<ExecutionRecord> {
        let (record, changed) = {
            let mut state = self.state.lock().unwrap();
            let record = find_mut(&mut state.executions, execution_id)?;

            if record.status.is_terminal() {
                (record.clone(), false)
            } else {
                let now = Utc::now();
                record.status = request.status;
                record.completed_at = Some(now);
                record.duration_ms = (now - record.started_at).num_milliseconds().try_into().ok();
                record.output = request.output;
                record.usage = request.usage;
                record.cost_usd = request.cost_usd;
                record.files_changed = request.files_changed;
                record.error = request.error;
                (record.clone(), true)
            }
        };

        if changed {
            let lifecycle = if record.status == ExecutionStatus::Completed {
                "execution_complete"
            } else {
                "execution_error"
            };
            self.log_lifecycle(lifecycle, &record).await?;
            self.emit(if record.status == ExecutionStatus::Completed {
                StoreEvent::ExecutionComplete(record.clone())
            } else {
                StoreEvent::ExecutionError(record.clone())
            });
            self.save_executions().await?;
        }

        Ok(record)
    }

    /// Abort a running execution: cancellation event, terminal status,
    /// removal from the active set.
    pub async fn abort_execution(&self, execution_id: &str) -> Result<ExecutionRecord> {
        let record = {
            let mut state = self.state.lock().unwrap();
            let record = find_mut(&mut state.executions, execution_id)?;
            if !record.status.is_terminal() {
                record.status = ExecutionStatus::Cancelled;
                record.completed_at = Some(Utc::now());
            }
            record.clone()
        };
        self.log_lifecycle("execution_cancelled", &record).await?;
        Ok(record)
    }

    /// The true Claude session id is only learned from the runner's first
    /// event; patch and index it late.
    pub fn update_claude_session_id(&self, execution_id: &str, claude_session_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = find_mut(&mut state.executions, execution_id)?;
        record.claude_session_id = Some(claude_session_id.to_string());
        state
            .by_claude_session
            .insert(claude_session_id.to_string(), execution_id.to_string());
        Ok(())
    }

    pub async fn store_blocking_event(
        &self,
        execution_id: Option<&str>,
        kind: BlockingKind,
        request: Value,
    ) -> Result<BlockingEvent> {
        let event = BlockingEvent {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.map(|s| s.to_string()),
            kind,
            status: BlockingStatus::Pending,
            request,
            response: None,
            responded_by: None,
            created_at: Utc::now(),
            responded_at: None,
            wait_ms: None,
        };
        self.state.lock().unwrap().blocking.push(event.clone());
        self.emit(StoreEvent::Blocking(event.clone()));
        self.save_blocking().await?;
        Ok(event)
    }

    /// pending → responded. Anything else is a conflict the caller must see.
    pub async fn respond_blocking_event(
        &self,
        event_id: &str,
        response: Value,
        responded_by: Option<&str>,
    ) -> Result<BlockingEvent> {
        let event =
            self.transition_blocking(event_id, BlockingStatus::Responded, Some(response), responded_by)?;
        self.emit(StoreEvent::Blocking(event.clone()));
        self.save_blocking().await?;
        Ok(event)
    }

    /// pending → timed_out; unblocks waiters.
    pub async fn timeout_blocking_event(&self, event_id: &str) -> Result<BlockingEvent> {
        let event = self.transition_blocking(event_id, BlockingStatus::TimedOut, None, None)?;
        self.emit(StoreEvent::Blocking(event.clone()));
        self.save_blocking().await?;
        Ok(event)
    }

    /// pending → cancelled.
    pub async fn cancel_blocking_event(&self, event_id: &str) -> Result<BlockingEvent> {
        let event = self.transition_blocking(event_id, BlockingStatus::Cancelled, None, None)?;
        self.emit(StoreEvent::Blocking(event.clone()));
        self.save_blocking().await?;
        Ok(event)
    }

    fn transition_blocking(
        &self,
        event_id: &str,
        to: BlockingStatus,
        response: Option<Value>,
        responded_by: Option<&str>,
    ) -> Result<BlockingEvent> {
        let mut state = self.state.lock().unwrap();
        let event = state
            .blocking
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| Error::NotFound(event_id.to_string()))?;

        if event.status != BlockingStatus::Pending {
            return Err(Error::Conflict(format!(
                "blocking event {} is not pending",
                event_id
            )));
        }

        let now = Utc::now();
        event.status = to;
        event.response = response;
        event.responded_by = responded_by.map(|s| s.to_string());
        event.responded_at = Some(now);
        event.wait_ms = (now - event.created_at).num_milliseconds().try_into().ok();
        Ok(event.clone())
    }

    /// Attach the runner's tracked-change bundle to an execution.
    pub async fn store_session_changes(
        &self,
        execution_id: &str,
        summary: FileChangeSummary,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let record = find_mut(&mut state.executions, execution_id)?;
            record.session_changes = Some(summary.clone());
            state
                .session_changes
                .insert(execution_id.to_string(), summary);
        }
        self.save_session_changes().await?;
        Ok(())
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.state
            .lock()
            .unwrap()
            .executions
            .iter()
            .find(|e| e.id == execution_id)
            .cloned()
    }

    pub fn get_by_claude_session(&self, claude_session_id: &str) -> Option<ExecutionRecord> {
        let state = self.state.lock().unwrap();
        let id = state.by_claude_session.get(claude_session_id)?;
        state.executions.iter().find(|e| &e.id == id).cloned()
    }

    /// Filtered, paginated snapshot (newest first).
    pub fn query_executions(&self, query: &ExecutionQuery) -> Vec<ExecutionRecord> {
        let snapshot: Vec<ExecutionRecord> = {
            let state = self.state.lock().unwrap();
            state.executions.clone()
        };

        let mut matches: Vec<ExecutionRecord> = snapshot
            .into_iter()
            .filter(|e| {
                query.tier.as_ref().is_none_or(|t| e.tier.as_ref() == Some(t))
                    && query
                        .agent_type
                        .as_ref()
                        .is_none_or(|a| e.agent_type.as_ref() == Some(a))
                    && query.status.is_none_or(|s| e.status == s)
                    && query
                        .claude_session_id
                        .as_ref()
                        .is_none_or(|s| e.claude_session_id.as_ref() == Some(s))
                    && query.since.is_none_or(|since| e.started_at >= since)
                    && query.until.is_none_or(|until| e.started_at <= until)
            })
            .collect();

        matches.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let end = match query.limit {
            Some(limit) => (query.offset + limit).min(matches.len()),
            None => matches.len(),
        };
        if query.offset >= matches.len() {
            return Vec::new();
        }
        matches[query.offset..end].to_vec()
    }

    pub fn blocking_events(&self) -> Vec<BlockingEvent> {
        self.state.lock().unwrap().blocking.clone()
    }

    pub fn pending_blocking_events(&self) -> Vec<BlockingEvent> {
        self.state
            .lock()
            .unwrap()
            .blocking
            .iter()
            .filter(|e| e.status == BlockingStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn events_for_execution(&self, execution_id: &str) -> Vec<StoredEvent> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.execution_id.as_deref() == Some(execution_id))
            .cloned()
            .collect()
    }

    /// Aggregate stats per tier; executions without one land in "default".
    pub fn stats_by_tier(&self) -> HashMap<String, TierStats> {
        let snapshot: Vec<ExecutionRecord> = self.state.lock().unwrap().executions.clone();

        let mut stats: HashMap<String, TierStats> = HashMap::new();
        let mut durations: HashMap<String, (u64, u64)> = HashMap::new();

        for execution in &snapshot {
            let tier = execution
                .tier
                .clone()
                .unwrap_or_else(|| "default".to_string());
            let entry = stats.entry(tier.clone()).or_default();
            entry.total += 1;
            match execution.status {
                ExecutionStatus::Running | ExecutionStatus::Pending => entry.running += 1,
                ExecutionStatus::Completed => entry.completed += 1,
                ExecutionStatus::Failed | ExecutionStatus::Cancelled => entry.failed += 1,
            }
            entry.total_cost_usd += execution.cost_usd.unwrap_or(0.0);
            if let Some(d) = execution.duration_ms {
                let (sum, n) = durations.entry(tier).or_default();
                *sum += d;
                *n += 1;
            }
        }

        for (tier, (sum, n)) in durations {
            if let Some(entry) = stats.get_mut(&tier)
                && n > 0
            {
                entry.avg_duration_ms = Some(sum / n);
            }
        }

        stats
    }

    /// Drop finished executions older than the cleanup age.
    pub fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(self.config.cleanup_age_ms as i64);
        let mut state = self.state.lock().unwrap();
        let before = state.executions.len();
        state.executions.retain(|e| {
            !(e.status.is_terminal() && e.completed_at.is_some_and(|at| at < cutoff))
        });
        before - state.executions.len()
    }

    // Persistence

    async fn log_lifecycle(&self, kind: &str, record: &ExecutionRecord) -> Result<()> {
        let event = StoredEvent {
            id: Uuid::new_v4().to_string(),
            execution_id: Some(record.id.clone()),
            kind: kind.to_string(),
            payload: serde_json::json!({
                "executionId": record.id,
                "status": record.status,
                "tier": record.tier,
            }),
            metadata: EventMetadata::default(),
            timestamp: Utc::now(),
        };
        {
            let mut state = self.state.lock().unwrap();
            if state.events.len() >= self.config.max_events {
                state.events.remove(0);
            }
            state.events.push(event.clone());
        }
        self.append_event(&event).await
    }

    async fn append_event(&self, event: &StoredEvent) -> Result<()> {
        if !self.config.persist_enabled {
            return Ok(());
        }
        append_event_line(&self.config.state_dir, event).await
    }

    /// Snapshot of finished executions, capped at the ring size.
    async fn save_executions(&self) -> Result<()> {
        if !self.config.persist_enabled {
            return Ok(());
        }
        let finished: Vec<ExecutionRecord> = {
            let state = self.state.lock().unwrap();
            state
                .executions
                .iter()
                .filter(|e| e.status.is_evictable())
                .take(self.config.max_executions)
                .cloned()
                .collect()
        };
        save_json_file(&self.config.state_dir, "executions.json", &finished).await
    }

    async fn save_blocking(&self) -> Result<()> {
        if !self.config.persist_enabled {
            return Ok(());
        }
        let events = self.blocking_events();
        save_json_array(&self.config.state_dir, "blocking-events.json", &events).await
    }

    async fn save_session_changes(&self) -> Result<()> {
        if !self.config.persist_enabled {
            return Ok(());
        }
        let changes: Vec<(String, FileChangeSummary)> = {
            let state = self.state.lock().unwrap();
            state
                .session_changes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        save_json_array(&self.config.state_dir, "session-changes.json", &changes).await
    }

    /// Reload persisted state from a previous process.
    pub async fn load(&self) -> Result<()> {
        if !self.config.persist_enabled {
            return Ok(());
        }

        let executions: Vec<ExecutionRecord> =
            load_json_array(&self.config.state_dir, "executions.json").await?;
        let blocking: Vec<BlockingEvent> =
            load_json_array(&self.config.state_dir, "blocking-events.json").await?;
        let changes: Vec<(String, FileChangeSummary)> =
            load_json_array(&self.config.state_dir, "session-changes.json").await?;

        let mut state = self.state.lock().unwrap();
        for execution in executions {
            if let Some(sid) = &execution.claude_session_id {
                state
                    .by_claude_session
                    .insert(sid.clone(), execution.id.clone());
            }
            state.executions.push(execution);
        }
        state.blocking.extend(blocking);
        state.session_changes.extend(changes);
        Ok(())
    }
}

fn find_mut<'a>(
    executions: &'a mut [ExecutionRecord],
    execution_id: &str,
) -> Result<&'a mut ExecutionRecord> {
    executions
        .iter_mut()
        .find(|e| e.id == execution_id)
        .ok_or_else(|| Error::NotFound(execution_id.to_string()))
}

/// Pull indexable metadata out of a raw SDK event payload.
fn extract_metadata(kind: &str, payload: &Value) -> EventMetadata {
    let get = |keys: &[&str]| -> Option<String> {
        keys.iter()
            .find_map(|k| payload.get(k).and_then(Value::as_str))
            .map(|s| s.to_string())
    };

    EventMetadata {
        hook_type: if kind.starts_with("hook") {
            get(&["hook_event_name", "hookType", "hook_type"])
        } else {
            None
        },
        mcp_server: get(&["server", "mcp_server", "mcpServer"]),
        tool_name: get(&["tool_name", "toolName", "name"]),
        subagent_name: if kind.starts_with("subagent") {
            get(&["subagent_name", "subagentName", "agent"])
        } else {
            None
        },
    }
}

/// Translate a stored SDK event into output chunks, per event kind.
/// Assistant messages split into one chunk per content block.
fn translate_event(event: &StoredEvent) -> Vec<OutputChunk> {
    let ts = event.timestamp;
    let chunk = |kind: ChunkKind, content: String, tool_name: Option<String>| OutputChunk {
        kind,
        content,
        tool_name,
        timestamp: ts,
    };

    match event.kind.as_str() {
        "assistant" => {
            let Some(blocks) = event
                .payload
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array)
            else {
                return Vec::new();
            };
            blocks
                .iter()
                .filter_map(|block| {
                    match block.get("type").and_then(Value::as_str)? {
                        "text" => Some(chunk(
                            ChunkKind::Text,
                            block.get("text")?.as_str()?.to_string(),
                            None,
                        )),
                        "thinking" => Some(chunk(
                            ChunkKind::Thinking,
                            block.get("thinking")?.as_str()?.to_string(),
                            None,
                        )),
                        "redacted_thinking" => {
                            Some(chunk(ChunkKind::RedactedThinking, String::new(), None))
                        }
                        "tool_use" => Some(chunk(
                            ChunkKind::ToolUse,
                            block.get("input").map(|i| i.to_string()).unwrap_or_default(),
                            block
                                .get("name")
                                .and_then(Value::as_str)
                                .map(|s| s.to_string()),
                        )),
                        _ => None,
                    }
                })
                .collect()
        }
        "tool_result" => vec![chunk(
            ChunkKind::ToolResult,
            event
                .payload
                .get("content")
                .map(|c| match c {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
            event.metadata.tool_name.clone(),
        )],
        "hook_event" => vec![chunk(
            ChunkKind::HookEvent,
            event.payload.to_string(),
            None,
        )],
        "mcp_tool_call" => vec![chunk(
            ChunkKind::McpToolCall,
            event.payload.to_string(),
            event.metadata.tool_name.clone(),
        )],
        "mcp_tool_result" => vec![chunk(
            ChunkKind::McpToolResult,
            event.payload.to_string(),
            event.metadata.tool_name.clone(),
        )],
        "subagent_start" => vec![chunk(
            ChunkKind::SubagentStart,
            event.metadata.subagent_name.clone().unwrap_or_default(),
            None,
        )],
        "subagent_result" => vec![chunk(
            ChunkKind::SubagentResult,
            event
                .payload
                .get("result")
                .map(|r| r.to_string())
                .unwrap_or_default(),
            None,
        )],
        "user_question" => vec![chunk(
            ChunkKind::UserQuestion,
            event
                .payload
                .get("question")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            None,
        )],
        "user_answer" => vec![chunk(
            ChunkKind::UserAnswer,
            event
                .payload
                .get("answer")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            None,
        )],
        _ => Vec::new(),
    }
}
