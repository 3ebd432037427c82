use lm_assist_ingest::{
    agent_files_for, encode_project_key, list_project_dirs, project_path_for_dir, session_files_in,
};
use lm_assist_types::{COMPACT_MARKER, ProjectListing, Result, SessionListing, TaskStatus};

use crate::service::{SessionService, file_mtime};

const LAST_MESSAGE_CAP: usize = 200;

impl SessionService {
    /// One summary row per session of a project, newest first. Sessions
    /// without a single real user prompt are omitted.
    pub async fn list_sessions(&self, cwd: &str) -> Result<Vec<SessionListing>> {
        let project_dir = self.projects_root().join(encode_project_key(cwd));
        let files = session_files_in(&project_dir)?;

        let mut listings = Vec::new();
        for path in files {
            let Ok(snapshot) = self.cache().snapshot(&path).await else {
                continue;
            };

            // Real prompts exclude compaction continuations.
            let last_real = snapshot
                .user_prompts
                .iter()
                .rev()
                .find(|p| !p.text.starts_with(COMPACT_MARKER));
            if last_real.is_none() {
                continue;
            }

            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();

            // A file whose records carry a different session id was forked
            // (resumed) from that session.
            let forked_from = (!snapshot.session_id.is_empty()
                && snapshot.session_id != stem)
                .then(|| snapshot.session_id.clone());

            let agent_file_count = agent_files_for(&project_dir, &stem)
                .map(|files| files.len())
                .unwrap_or(0);

            listings.push(SessionListing {
                session_id: stem,
                project_path: snapshot.cwd.clone().unwrap_or_else(|| cwd.to_string()),
                file_path: path.to_string_lossy().to_string(),
                file_size: snapshot.file_size,
                created_at: snapshot.first_timestamp,
                last_modified: file_mtime(&path),
                last_user_message: last_real.map(|p| truncate(&p.text, LAST_MESSAGE_CAP)),
                user_prompt_count: snapshot.user_prompt_count,
                task_count: snapshot
                    .tasks
                    .iter()
                    .filter(|t| t.status != TaskStatus::Deleted)
                    .count(),
                plan_count: snapshot.plans.len(),
                agent_file_count,
                team_name: snapshot.team_name.clone(),
                forked_from,
                status: snapshot.status,
            });
        }

        listings.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(listings)
    }

    /// One row per directory under the projects root. The canonical path
    /// comes from the `cwd` field inside session records whenever one is
    /// readable; the encoded directory name alone cannot be trusted.
    pub async fn list_projects(&self) -> Result<Vec<ProjectListing>> {
        let mut projects = Vec::new();

        for dir in list_project_dirs(self.projects_root())? {
            let files = session_files_in(&dir)?;
            let total_size = files
                .iter()
                .filter_map(|f| std::fs::metadata(f).ok())
                .map(|m| m.len())
                .sum();
            let last_modified = files.iter().filter_map(|f| file_mtime(f)).max();

            projects.push(ProjectListing {
                project_path: project_path_for_dir(&dir),
                encoded_key: dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string(),
                session_count: files.len(),
                total_size,
                last_modified,
            });
        }

        projects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(projects)
    }
}

fn truncate(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        s.to_string()
    } else {
        s.chars().take(cap).collect()
    }
}
