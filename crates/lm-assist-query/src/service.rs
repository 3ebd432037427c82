use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::Serialize;

use lm_assist_cache::SessionCache;
use lm_assist_extract::{
    extract_db_operations, extract_file_operations, extract_git_operations, summarize_file_changes,
};
use lm_assist_ingest::resolve_session_file;
use lm_assist_types::{
    DbOperation, FileCategory, FileChangeSummary, FileOperation, GitOperation, RawMessage, Result,
    SessionSnapshot, TaskStatus,
};

/// Default cap on returned user prompts when no explicit filter is set.
pub const DEFAULT_PROMPT_CAP: u32 = 50;

/// Read-only query surface over the session cache. All operations return
/// snapshots; nothing here mutates agent state.
pub struct SessionService {
    cache: Arc<SessionCache>,
    projects_root: PathBuf,
}

/// Filters for [`SessionService::read_session`]. Unset fields mean "no
/// filter"; combining range kinds follows the most specific one set.
#[derive(Debug, Clone, Default)]
pub struct ReadSessionRequest {
    pub session_id: String,
    pub cwd: Option<String>,
    pub include_raw_messages: bool,
    pub from_line_index: Option<u64>,
    pub to_line_index: Option<u64>,
    pub from_turn_index: Option<u32>,
    pub to_turn_index: Option<u32>,
    pub from_user_prompt_index: Option<u32>,
    pub to_user_prompt_index: Option<u32>,
    pub last_n_user_prompts: Option<u32>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub include_reads: bool,
    /// Deleted tasks are excluded unless explicitly asked for.
    pub include_deleted_tasks: bool,
}

impl ReadSessionRequest {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// Delta fast path: only a line lower bound is set.
    fn is_delta(&self) -> bool {
        self.from_line_index.is_some()
            && self.to_line_index.is_none()
            && self.from_turn_index.is_none()
            && self.to_turn_index.is_none()
            && self.from_user_prompt_index.is_none()
            && self.to_user_prompt_index.is_none()
    }
}

/// The filtered view plus derived operations.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
    pub file_operations: Vec<FileOperation>,
    pub file_summary: FileChangeSummary,
    pub db_operations: Vec<DbOperation>,
    pub git_operations: Vec<GitOperation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_messages: Option<Vec<RawMessage>>,
    /// Set when the delta fast path skipped range filtering of the
    /// accumulated tables (they are returned in full).
    pub delta: bool,
}

#[derive(Debug)]
pub enum SessionReadResult {
    NotModified { last_modified: DateTime<Utc> },
    Full(Box<SessionView>),
}

impl SessionService {
    pub fn new(cache: Arc<SessionCache>, projects_root: PathBuf) -> Self {
        Self {
            cache,
            projects_root,
        }
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    pub(crate) fn resolve(&self, session_id: &str, cwd: Option<&str>) -> Result<PathBuf> {
        resolve_session_file(&self.projects_root, session_id, cwd)
    }

    /// Full structured view with the requested filters applied.
    pub async fn read_session(&self, request: ReadSessionRequest) -> Result<SessionReadResult> {
        let path = self.resolve(&request.session_id, request.cwd.as_deref())?;

        // Not-modified check runs on file metadata alone, before any parse.
        if let Some(since) = request.if_modified_since
            && let Some(mtime) = file_mtime(&path)
            && mtime <= since
        {
            return Ok(SessionReadResult::NotModified {
                last_modified: mtime,
            });
        }

        let mut snapshot = self.cache.snapshot(&path).await?;
        let delta = request.is_delta();

        if delta {
            let from = request.from_line_index.unwrap_or(0);
            filter_streams(&mut snapshot, from, u64::MAX);
            // Accumulated tables (tasks, todos, plans, subagents) stay whole:
            // the UI needs their full state for context after a delta.
        } else if request.from_turn_index.is_some() || request.to_turn_index.is_some() {
            let (from, to) = (
                request.from_turn_index.unwrap_or(0),
                request.to_turn_index.unwrap_or(u32::MAX),
            );
            let hull = turn_hull(&snapshot, from, to);
            filter_by_turn(&mut snapshot, from, to);
            if let Some((lo, hi)) = hull {
                filter_tables(&mut snapshot, lo, hi);
            }
        } else if request.from_user_prompt_index.is_some()
            || request.to_user_prompt_index.is_some()
        {
            let from = request.from_user_prompt_index.unwrap_or(0);
            let to = request.to_user_prompt_index.unwrap_or(u32::MAX);
            let (lo, hi) = prompt_range_to_lines(&snapshot, from, to);
            filter_streams(&mut snapshot, lo, hi);
            filter_tables(&mut snapshot, lo, hi);
            // Subagents carry a prompt index of their own; filter directly.
            snapshot
                .subagents
                .retain(|s| s.user_prompt_index >= from && s.user_prompt_index <= to);
        } else if request.from_line_index.is_some() || request.to_line_index.is_some() {
            let lo = request.from_line_index.unwrap_or(0);
            let hi = request.to_line_index.unwrap_or(u64::MAX);
            filter_streams(&mut snapshot, lo, hi);
            filter_tables(&mut snapshot, lo, hi);
        } else {
            // No explicit filter: cap runaway sessions to the last N prompts.
            let cap = request.last_n_user_prompts.unwrap_or(DEFAULT_PROMPT_CAP);
            if request.last_n_user_prompts.is_some() || snapshot.user_prompt_count > cap {
                if let Some(cutoff) = last_n_prompt_cutoff(&snapshot, cap) {
                    filter_streams(&mut snapshot, cutoff, u64::MAX);
                }
            }
        }

        if !request.include_deleted_tasks {
            snapshot.tasks.retain(|t| t.status != TaskStatus::Deleted);
        }

        let mut file_operations = extract_file_operations(&snapshot.tool_uses);
        if !request.include_reads {
            file_operations.retain(|op| op.category != FileCategory::Read);
        }
        let mut file_summary = summarize_file_changes(&file_operations);
        if !request.include_reads {
            file_summary.read.clear();
        }
        let db_operations = extract_db_operations(&snapshot.tool_uses);
        let git_operations = extract_git_operations(&snapshot.tool_uses);

        let raw_messages = if request.include_raw_messages {
            let mut raw = self.cache.raw_messages(&path).await?;
            if let Some((lo, hi)) = raw_bounds(&request, &snapshot) {
                raw.retain(|m| m.line_index >= lo && m.line_index <= hi);
            }
            Some(raw)
        } else {
            None
        };

        Ok(SessionReadResult::Full(Box::new(SessionView {
            snapshot,
            file_operations,
            file_summary,
            db_operations,
            git_operations,
            raw_messages,
            delta,
        })))
    }
}

/// Line bounds to apply to raw messages, which have no turn indexes: turn
/// ranges use the line-index hull of the selected turns.
fn raw_bounds(
    request: &ReadSessionRequest,
    snapshot: &SessionSnapshot,
) -> Option<(u64, u64)> {
    if request.from_turn_index.is_some() || request.to_turn_index.is_some() {
        let from = request.from_turn_index.unwrap_or(0);
        let to = request.to_turn_index.unwrap_or(u32::MAX);
        return turn_hull(snapshot, from, to);
    }
    if request.from_line_index.is_some() || request.to_line_index.is_some() {
        return Some((
            request.from_line_index.unwrap_or(0),
            request.to_line_index.unwrap_or(u64::MAX),
        ));
    }
    None
}

fn filter_streams(snapshot: &mut SessionSnapshot, lo: u64, hi: u64) {
    snapshot
        .user_prompts
        .retain(|p| p.line_index >= lo && p.line_index <= hi);
    snapshot
        .responses
        .retain(|r| r.line_index >= lo && r.line_index <= hi);
    snapshot
        .thinking
        .retain(|t| t.line_index >= lo && t.line_index <= hi);
    snapshot
        .tool_uses
        .retain(|t| t.line_index >= lo && t.line_index <= hi);
    snapshot
        .tool_results
        .retain(|t| t.line_index >= lo && t.line_index <= hi);
    snapshot
        .progress_updates
        .retain(|p| p.line_index >= lo && p.line_index <= hi);
    snapshot
        .compact_messages
        .retain(|c| c.line_index >= lo && c.line_index <= hi);
}

fn filter_tables(snapshot: &mut SessionSnapshot, lo: u64, hi: u64) {
    snapshot
        .tasks
        .retain(|t| t.line_index >= lo && t.line_index <= hi);
    snapshot
        .todos
        .retain(|t| t.line_index >= lo && t.line_index <= hi);
    snapshot
        .plans
        .retain(|p| p.line_index >= lo && p.line_index <= hi);
    snapshot
        .subagents
        .retain(|s| s.line_index >= lo && s.line_index <= hi);
}

fn filter_by_turn(snapshot: &mut SessionSnapshot, from: u32, to: u32) {
    snapshot
        .user_prompts
        .retain(|p| p.turn_index >= from && p.turn_index <= to);
    snapshot
        .responses
        .retain(|r| r.turn_index >= from && r.turn_index <= to);
    snapshot
        .thinking
        .retain(|t| t.turn_index >= from && t.turn_index <= to);
    snapshot
        .tool_uses
        .retain(|t| t.turn_index >= from && t.turn_index <= to);
    snapshot
        .compact_messages
        .retain(|c| c.turn_index >= from && c.turn_index <= to);
}

/// Line-index hull of a turn range: the min and max line indexes of the
/// records whose turn falls inside it.
fn turn_hull(snapshot: &SessionSnapshot, from: u32, to: u32) -> Option<(u64, u64)> {
    let mut lo = u64::MAX;
    let mut hi = 0u64;
    let mut any = false;

    let mut consider = |line: u64, turn: u32| {
        if turn >= from && turn <= to {
            lo = lo.min(line);
            hi = hi.max(line);
            any = true;
        }
    };

    for p in &snapshot.user_prompts {
        consider(p.line_index, p.turn_index);
    }
    for r in &snapshot.responses {
        consider(r.line_index, r.turn_index);
    }
    for t in &snapshot.thinking {
        consider(t.line_index, t.turn_index);
    }
    for t in &snapshot.tool_uses {
        consider(t.line_index, t.turn_index);
    }

    any.then_some((lo, hi))
}

/// Map a user-prompt index range to line bounds: the selected first
/// prompt's line up to the line just before the next prompt after the
/// range (or the end of file).
fn prompt_range_to_lines(snapshot: &SessionSnapshot, from: u32, to: u32) -> (u64, u64) {
    let lo = snapshot
        .user_prompts
        .iter()
        .find(|p| p.user_prompt_index >= from)
        .map(|p| p.line_index)
        .unwrap_or(0);
    let hi = snapshot
        .user_prompts
        .iter()
        .find(|p| p.user_prompt_index > to)
        .map(|p| p.line_index.saturating_sub(1))
        .unwrap_or(u64::MAX);
    (lo, hi)
}

/// Line cutoff that keeps the last `n` user prompts.
fn last_n_prompt_cutoff(snapshot: &SessionSnapshot, n: u32) -> Option<u64> {
    let count = snapshot.user_prompts.len();
    if count <= n as usize {
        return None;
    }
    snapshot
        .user_prompts
        .get(count - n as usize)
        .map(|p| p.line_index)
}

pub(crate) fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let ms = modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as i64;
    DateTime::from_timestamp_millis(ms)
}
