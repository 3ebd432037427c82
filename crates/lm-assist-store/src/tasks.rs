use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use lm_assist_cache::SessionCache;
use lm_assist_extract::{extract_file_operations, summarize_file_changes};
use lm_assist_ingest::{encode_project_key, session_files_in};
use lm_assist_types::{Result, TaskRecord, TaskStatus};

const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_FILE: &str = "task-store.json";

#[derive(Debug, Clone)]
pub struct TaskStoreConfig {
    pub project_path: PathBuf,
    pub projects_root: PathBuf,
    pub persist_enabled: bool,
}

/// Diff events emitted after a refresh swaps the store maps.
#[derive(Debug, Clone)]
pub enum TaskStoreEvent {
    TaskCreated(TaskRecord),
    TaskUpdated(TaskRecord),
    TaskCompleted(TaskRecord),
    SessionUpdated { session_id: String },
    /// A session produced file changes but no tasks.
    AdhocDetected { session_id: String },
}

type TaskListener = Box<dyn Fn(&TaskStoreEvent) + Send + Sync>;

/// Per-session-file scan state; a matching `(size, mtime)` lets a refresh
/// reuse the previous snapshot without re-reading the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionScan {
    pub file_path: String,
    pub file_size: u64,
    pub modified_at_ms: i64,
    pub task_ids: Vec<String>,
    pub had_file_changes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTasks {
    pub session_id: String,
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStoreStats {
    pub total_tasks: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub deleted: usize,
    pub sessions: usize,
    pub ready: usize,
}

#[derive(Default)]
struct TaskStoreState {
    tasks: HashMap<String, TaskRecord>,
    sessions: HashMap<String, SessionTasks>,
    scans: HashMap<String, SessionScan>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskStoreSnapshot {
    version: u32,
    project_path: String,
    saved_at: DateTime<Utc>,
    session_scans: Vec<SessionScan>,
    sessions: Vec<SessionTasks>,
    tasks: Vec<TaskRecord>,
}

/// Read-only projection of every session's task table into one queryable
/// graph for a project. Task ids are namespaced `{sid8}:{id}` so tasks from
/// many sessions never collide; dependency links are rewritten the same way.
pub struct TaskStore {
    cache: Arc<SessionCache>,
    config: TaskStoreConfig,
    state: Mutex<TaskStoreState>,
    listeners: Mutex<Vec<TaskListener>>,
    refresh_lock: tokio::sync::Mutex<()>,
    last_refresh: Mutex<Option<Instant>>,
}

impl TaskStore {
    pub fn new(cache: Arc<SessionCache>, config: TaskStoreConfig) -> Self {
        Self {
            cache,
            config,
            state: Mutex::new(TaskStoreState::default()),
            listeners: Mutex::new(Vec::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
            last_refresh: Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: TaskListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn emit(&self, events: &[TaskStoreEvent]) {
        let listeners = self.listeners.lock().unwrap();
        for event in events {
            for listener in listeners.iter() {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    listener(event);
                }));
                if result.is_err() {
                    warn!("task store listener panicked; continuing");
                }
            }
        }
    }

    /// Load any persisted scan state, then refresh to catch up.
    pub async fn init(&self) -> Result<()> {
        self.load_snapshot().await?;
        self.refresh().await
    }

    /// Rescan every session of the project. Refreshes are single-flight:
    /// requests that arrive while one is running coalesce onto its result.
    pub async fn refresh(&self) -> Result<()> {
        let requested_at = Instant::now();
        let _guard = self.refresh_lock.lock().await;

        if self
            .last_refresh
            .lock()
            .unwrap()
            .is_some_and(|done| done > requested_at)
        {
            return Ok(());
        }

        let project_dir = self
            .config
            .projects_root
            .join(encode_project_key(&self.config.project_path.to_string_lossy()));
        let files = session_files_in(&project_dir)?;

        // Build the next state in temporary maps, then swap.
        let mut next = TaskStoreState::default();
        let mut adhoc_sessions: Vec<String> = Vec::new();

        for path in files {
            let path_str = path.to_string_lossy().to_string();
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            let file_size = meta.len();
            let modified_at_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            let reusable = {
                let state = self.state.lock().unwrap();
                state
                    .scans
                    .get(&path_str)
                    .filter(|s| s.file_size == file_size && s.modified_at_ms == modified_at_ms)
                    .cloned()
            };

            let session_id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();

            let (task_ids, tasks, had_file_changes) = if let Some(scan) = reusable {
                // Unchanged file: carry the previous snapshot forward.
                let state = self.state.lock().unwrap();
                let tasks: Vec<TaskRecord> = scan
                    .task_ids
                    .iter()
                    .filter_map(|id| state.tasks.get(id).cloned())
                    .collect();
                (scan.task_ids.clone(), tasks, scan.had_file_changes)
            } else {
                let Ok(snapshot) = self.cache.snapshot(&path).await else {
                    continue;
                };
                let mut namespaced: Vec<TaskRecord> = snapshot
                    .tasks
                    .iter()
                    .map(|t| namespace_task(&session_id, t))
                    .collect();
                // External task files, when the CLI wrote them, are the
                // authoritative view and override same-id JSONL tasks.
                for external in self.read_external_tasks(&session_id) {
                    match namespaced.iter_mut().find(|t| t.id == external.id) {
                        Some(slot) => *slot = external,
                        None => namespaced.push(external),
                    }
                }
                let ids: Vec<String> = namespaced.iter().map(|t| t.id.clone()).collect();
                let file_ops = extract_file_operations(&snapshot.tool_uses);
                let had_changes = !summarize_file_changes(&file_ops).is_empty();
                (ids, namespaced, had_changes)
            };

            if task_ids.is_empty() && had_file_changes {
                adhoc_sessions.push(session_id.clone());
            }

            for task in tasks {
                next.tasks.insert(task.id.clone(), task);
            }
            next.sessions.insert(
                session_id.clone(),
                SessionTasks {
                    session_id: session_id.clone(),
                    task_ids: task_ids.clone(),
                },
            );
            next.scans.insert(
                path_str.clone(),
                SessionScan {
                    file_path: path_str,
                    file_size,
                    modified_at_ms,
                    task_ids,
                    had_file_changes,
                },
            );
        }

        // Diff against the old maps, swap, then emit outside the lock.
        let events = {
            let mut state = self.state.lock().unwrap();
            let mut events = Vec::new();

            for (id, task) in &next.tasks {
                match state.tasks.get(id) {
                    None => events.push(TaskStoreEvent::TaskCreated(task.clone())),
                    Some(old) if old.status != task.status => {
                        if task.status == TaskStatus::Completed {
                            events.push(TaskStoreEvent::TaskCompleted(task.clone()));
                        } else {
                            events.push(TaskStoreEvent::TaskUpdated(task.clone()));
                        }
                    }
                    Some(old) => {
                        if old.subject != task.subject
                            || old.description != task.description
                            || old.owner != task.owner
                            || old.blocks != task.blocks
                            || old.blocked_by != task.blocked_by
                        {
                            events.push(TaskStoreEvent::TaskUpdated(task.clone()));
                        }
                    }
                }
            }
            for (session_id, session) in &next.sessions {
                let changed = state
                    .sessions
                    .get(session_id)
                    .is_none_or(|old| old.task_ids != session.task_ids);
                if changed {
                    events.push(TaskStoreEvent::SessionUpdated {
                        session_id: session_id.clone(),
                    });
                }
            }
            for session_id in &adhoc_sessions {
                events.push(TaskStoreEvent::AdhocDetected {
                    session_id: session_id.clone(),
                });
            }

            *state = next;
            events
        };

        *self.last_refresh.lock().unwrap() = Some(Instant::now());
        self.emit(&events);
        self.save_snapshot().await?;
        Ok(())
    }

    /// Tasks across all sessions; deleted tasks excluded by default.
    pub fn tasks(&self, include_deleted: bool) -> Vec<TaskRecord> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| include_deleted || t.status != TaskStatus::Deleted)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn task(&self, namespaced_id: &str) -> Option<TaskRecord> {
        self.state.lock().unwrap().tasks.get(namespaced_id).cloned()
    }

    /// A task is ready when it is still open and every known blocker is
    /// completed.
    pub fn ready_tasks(&self) -> Vec<TaskRecord> {
        let state = self.state.lock().unwrap();
        let mut ready: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| !t.status.is_resolved() && Self::is_ready_in(&state.tasks, t))
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));
        ready
    }

    fn is_ready_in(tasks: &HashMap<String, TaskRecord>, task: &TaskRecord) -> bool {
        task.blocked_by.iter().all(|dep| {
            tasks
                .get(dep)
                .is_none_or(|blocker| blocker.status == TaskStatus::Completed)
        })
    }

    /// Children of a parent task: its `blockedBy` references when present,
    /// otherwise tasks whose `metadata.parentTaskId` points at it.
    pub fn children_of(&self, parent_id: &str) -> Vec<TaskRecord> {
        let state = self.state.lock().unwrap();
        let Some(parent) = state.tasks.get(parent_id) else {
            return Vec::new();
        };

        if !parent.blocked_by.is_empty() {
            return parent
                .blocked_by
                .iter()
                .filter_map(|id| state.tasks.get(id).cloned())
                .collect();
        }

        let raw_parent_id = parent_id.split(':').nth(1).unwrap_or(parent_id);
        let mut children: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| {
                t.metadata
                    .get("parentTaskId")
                    .map(|v| match v {
                        serde_json::Value::String(s) => s == raw_parent_id,
                        serde_json::Value::Number(n) => n.to_string() == raw_parent_id,
                        _ => false,
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        children
    }

    /// A parent (`metadata.isIntent = true`) is auto-completable when it
    /// has children and all of them are completed or deleted.
    pub fn is_auto_completable(&self, parent_id: &str) -> bool {
        let is_intent = self
            .task(parent_id)
            .is_some_and(|t| t.metadata.get("isIntent") == Some(&serde_json::Value::Bool(true)));
        if !is_intent {
            return false;
        }
        let children = self.children_of(parent_id);
        !children.is_empty() && children.iter().all(|c| c.status.is_resolved())
    }

    pub fn session_tasks(&self, session_id: &str) -> Vec<TaskRecord> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(session_id)
            .map(|s| {
                s.task_ids
                    .iter()
                    .filter_map(|id| state.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> TaskStoreStats {
        let state = self.state.lock().unwrap();
        let mut stats = TaskStoreStats {
            total_tasks: state.tasks.len(),
            sessions: state.sessions.len(),
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Deleted => stats.deleted += 1,
            }
            if !task.status.is_resolved() && Self::is_ready_in(&state.tasks, task) {
                stats.ready += 1;
            }
        }
        stats
    }

    /// Tasks from `{CLAUDE_HOME}/tasks/{sessionId}/*.json`, already
    /// namespaced. Each file holds one task object or an array of them;
    /// unreadable files are skipped.
    fn read_external_tasks(&self, session_id: &str) -> Vec<TaskRecord> {
        let Some(tasks_root) = self.config.projects_root.parent().map(|p| p.join("tasks")) else {
            return Vec::new();
        };
        let dir = tasks_root.join(session_id);
        if !dir.is_dir() {
            return Vec::new();
        }

        let mut tasks = Vec::new();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return tasks;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
                continue;
            };
            match value {
                serde_json::Value::Array(items) => {
                    for item in &items {
                        if let Some(task) = parse_external_task(item) {
                            tasks.push(namespace_task(session_id, &task));
                        }
                    }
                }
                other => {
                    if let Some(task) = parse_external_task(&other) {
                        tasks.push(namespace_task(session_id, &task));
                    }
                }
            }
        }
        tasks
    }

    async fn save_snapshot(&self) -> Result<()> {
        if !self.config.persist_enabled {
            return Ok(());
        }
        let snapshot = {
            let state = self.state.lock().unwrap();
            TaskStoreSnapshot {
                version: SNAPSHOT_VERSION,
                project_path: self.config.project_path.to_string_lossy().to_string(),
                saved_at: Utc::now(),
                session_scans: state.scans.values().cloned().collect(),
                sessions: state.sessions.values().cloned().collect(),
                tasks: state.tasks.values().cloned().collect(),
            }
        };
        crate::persist::save_json_file(
            &self.config.project_path.join(lm_assist_types::STATE_DIR),
            SNAPSHOT_FILE,
            &snapshot,
        )
        .await
    }

    async fn load_snapshot(&self) -> Result<()> {
        if !self.config.persist_enabled {
            return Ok(());
        }
        let path = self
            .config
            .project_path
            .join(lm_assist_types::STATE_DIR)
            .join(SNAPSHOT_FILE);
        if !path.is_file() {
            return Ok(());
        }

        let bytes = std::fs::read(&path)?;
        let Ok(snapshot) = serde_json::from_slice::<TaskStoreSnapshot>(&bytes) else {
            return Ok(());
        };
        // Version and project identity gate the load.
        if snapshot.version != SNAPSHOT_VERSION
            || snapshot.project_path != self.config.project_path.to_string_lossy().as_ref()
        {
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();
        state.tasks = snapshot
            .tasks
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        state.sessions = snapshot
            .sessions
            .into_iter()
            .map(|s| (s.session_id.clone(), s))
            .collect();
        state.scans = snapshot
            .session_scans
            .into_iter()
            .map(|s| (s.file_path.clone(), s))
            .collect();
        Ok(())
    }
}

/// Lenient decode of one external task object.
fn parse_external_task(value: &serde_json::Value) -> Option<TaskRecord> {
    let id = match value.get("id")? {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let as_list = |field: &str| -> Vec<String> {
        value
            .get(field)
            .and_then(serde_json::Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| match v {
                        serde_json::Value::String(s) => Some(s.clone()),
                        serde_json::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    Some(TaskRecord {
        id,
        subject: value
            .get("subject")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        description: value
            .get("description")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status: value
            .get("status")
            .and_then(serde_json::Value::as_str)
            .and_then(TaskStatus::parse)
            .unwrap_or(TaskStatus::Pending),
        owner: value
            .get("owner")
            .and_then(serde_json::Value::as_str)
            .map(|s| s.to_string()),
        blocks: as_list("blocks"),
        blocked_by: as_list("blockedBy"),
        metadata: value
            .get("metadata")
            .and_then(serde_json::Value::as_object)
            .cloned()
            .unwrap_or_default(),
        line_index: 0,
        turn_index: 0,
    })
}

/// Prefix a session task with the first 8 chars of its session id and
/// rewrite its dependency lists the same way.
fn namespace_task(session_id: &str, task: &TaskRecord) -> TaskRecord {
    let sid8: String = session_id.chars().take(8).collect();
    let ns = |id: &str| format!("{}:{}", sid8, id);

    let mut namespaced = task.clone();
    namespaced.id = ns(&task.id);
    namespaced.blocks = task.blocks.iter().map(|id| ns(id)).collect();
    namespaced.blocked_by = task.blocked_by.iter().map(|id| ns(id)).collect();
    namespaced
}
