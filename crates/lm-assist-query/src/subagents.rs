use futures::StreamExt;
use serde::Serialize;

use lm_assist_ingest::{agent_files_for, encode_project_key, read_header};
use lm_assist_types::{Result, SessionSnapshot, SessionStatus, SubagentInvocation, SubagentStatus};

use crate::service::SessionService;

/// How many subagent files load concurrently per query.
const SUBAGENT_LOAD_CONCURRENCY: usize = 4;

/// A discovered subagent session file, loaded and anchored to its parent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentSessionView {
    pub agent_id: String,
    pub file_path: String,
    /// Parent message uuid from the file's first record — the
    /// authoritative anchor for UI placement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
    pub session: SessionSnapshot,
}

/// Union of Task-tool invocations and files found on disk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentTree {
    pub invocations: Vec<SubagentInvocation>,
    pub sessions: Vec<SubagentSessionView>,
}

impl SessionService {
    /// Subagents of a session: invocations parsed from the parent plus
    /// discovered agent files, loaded with bounded parallelism. Runtime
    /// status observed in the files is propagated back onto matching
    /// invocations.
    pub async fn subagents(&self, session_id: &str, cwd: Option<&str>) -> Result<SubagentTree> {
        let parent_path = self.resolve(session_id, cwd)?;
        let parent = self.cache().snapshot(&parent_path).await?;

        let project_dir = match cwd.or(parent.cwd.as_deref()) {
            Some(cwd) => self.projects_root().join(encode_project_key(cwd)),
            None => parent_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default(),
        };

        let files = agent_files_for(&project_dir, session_id)?;

        let mut sessions: Vec<SubagentSessionView> = futures::stream::iter(files)
            .map(|path| async move {
                let snapshot = self.cache().snapshot(&path).await.ok()?;
                let header = read_header(&path).ok();
                let agent_id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.strip_prefix("agent-"))
                    .unwrap_or_default()
                    .to_string();
                Some(SubagentSessionView {
                    agent_id,
                    file_path: path.to_string_lossy().to_string(),
                    parent_uuid: header.and_then(|h| h.parent_uuid),
                    session: snapshot,
                })
            })
            .buffer_unordered(SUBAGENT_LOAD_CONCURRENCY)
            .filter_map(futures::future::ready)
            .collect()
            .await;

        sessions.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let mut invocations = parent.subagents.clone();
        for session in &sessions {
            let Some(invocation) = invocations
                .iter_mut()
                .find(|i| i.agent_id.as_deref() == Some(session.agent_id.as_str()))
            else {
                continue;
            };
            // Observed file state wins over the parent's view for live
            // status; resolved results from the parent stay authoritative.
            if invocation.status == SubagentStatus::Pending
                || invocation.status == SubagentStatus::Running
            {
                invocation.status = match session.session.status {
                    SessionStatus::Running | SessionStatus::Idle => SubagentStatus::Running,
                    SessionStatus::Error => SubagentStatus::Error,
                    SessionStatus::Completed => SubagentStatus::Completed,
                    SessionStatus::Interrupted | SessionStatus::Stale => invocation.status,
                };
            }
            if invocation.parent_uuid.is_none() {
                invocation.parent_uuid = session.parent_uuid.clone();
            }
        }

        Ok(SubagentTree {
            invocations,
            sessions,
        })
    }
}
