use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lm_assist_ingest::{agent_files_for, encode_project_key, session_files_in};
use lm_assist_types::{Result, SessionListing};

use crate::service::{SessionService, file_mtime};

/// One session the caller already knows about, with the values it last saw.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCheckRequest {
    pub session_id: String,
    #[serde(default)]
    pub known_file_size: Option<u64>,
    #[serde(default)]
    pub known_agent_count: Option<usize>,
}

/// Per-session change answer. The file size doubles as the change cursor:
/// session files are append-only, so a grown size means new content and an
/// equal size means none, without reading a single byte.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionChangeCheck {
    pub session_id: String,
    pub exists: bool,
    /// Monotone change cursor (the current file size).
    pub change_cursor: u64,
    /// Legacy alias of `change_cursor`, kept for wire compatibility.
    pub line_count: u64,
    pub file_size: u64,
    pub agent_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    pub changed: bool,
    pub agents_changed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCheck {
    pub total_sessions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_modified: Option<DateTime<Utc>>,
    pub changed: bool,
    /// Only populated when `changed` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionListing>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownListState {
    #[serde(default)]
    pub known_total: Option<usize>,
    #[serde(default)]
    pub known_latest_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchChangeCheck {
    pub sessions: Vec<SessionChangeCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list: Option<ListCheck>,
}

impl SessionService {
    /// Answer "has anything changed since I last looked" for many sessions
    /// at once using file metadata only.
    pub async fn check_sessions(
        &self,
        cwd: &str,
        requests: &[ChangeCheckRequest],
        list_check: Option<KnownListState>,
    ) -> Result<BatchChangeCheck> {
        let project_dir = self.projects_root().join(encode_project_key(cwd));

        let mut sessions = Vec::with_capacity(requests.len());
        for request in requests {
            sessions.push(self.check_one(&project_dir, request));
        }

        let list = match list_check {
            Some(known) => Some(self.check_list(cwd, &project_dir, known).await?),
            None => None,
        };

        Ok(BatchChangeCheck { sessions, list })
    }

    fn check_one(
        &self,
        project_dir: &std::path::Path,
        request: &ChangeCheckRequest,
    ) -> SessionChangeCheck {
        let path = project_dir.join(format!("{}.jsonl", request.session_id));

        let Ok(meta) = std::fs::metadata(&path) else {
            // Unreadable sessions degrade to a well-formed non-existence
            // answer instead of an error for the whole batch.
            return SessionChangeCheck {
                session_id: request.session_id.clone(),
                exists: false,
                change_cursor: 0,
                line_count: 0,
                file_size: 0,
                agent_ids: Vec::new(),
                last_modified: None,
                changed: request.known_file_size.is_some(),
                agents_changed: false,
            };
        };

        let file_size = meta.len();
        let agent_ids: Vec<String> = agent_files_for(project_dir, &request.session_id)
            .unwrap_or_default()
            .iter()
            .filter_map(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.strip_prefix("agent-"))
                    .map(|s| s.to_string())
            })
            .collect();

        let changed = request
            .known_file_size
            .is_none_or(|known| known != file_size);
        let agents_changed = request
            .known_agent_count
            .is_some_and(|known| known != agent_ids.len());

        SessionChangeCheck {
            session_id: request.session_id.clone(),
            exists: true,
            change_cursor: file_size,
            line_count: file_size,
            file_size,
            agent_ids,
            last_modified: file_mtime(&path),
            changed,
            agents_changed,
        }
    }

    async fn check_list(
        &self,
        cwd: &str,
        project_dir: &std::path::Path,
        known: KnownListState,
    ) -> Result<ListCheck> {
        let files = session_files_in(project_dir)?;
        let total_sessions = files.len();
        let latest_modified = files.iter().filter_map(|f| file_mtime(f)).max();

        let changed = known.known_total.is_none_or(|t| t != total_sessions)
            || known.known_latest_modified != latest_modified;

        let sessions = if changed {
            Some(self.list_sessions(cwd).await?)
        } else {
            None
        };

        Ok(ListCheck {
            total_sessions,
            latest_modified,
            changed,
            sessions,
        })
    }
}
