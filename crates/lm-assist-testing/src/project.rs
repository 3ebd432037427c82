use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::builder::SessionFileBuilder;
use lm_assist_ingest::encode_project_key;

/// A temporary `~/.claude`-style tree plus a workspace directory standing
/// in for the project the sessions ran in.
pub struct TestWorld {
    _home: TempDir,
    projects_root: PathBuf,
    _workspace: TempDir,
    workspace_path: PathBuf,
}

impl TestWorld {
    pub fn new() -> anyhow::Result<Self> {
        let home = TempDir::new()?;
        let projects_root = home.path().join("projects");
        std::fs::create_dir_all(&projects_root)?;

        let workspace = TempDir::new()?;
        let workspace_path = workspace.path().to_path_buf();

        Ok(Self {
            _home: home,
            projects_root,
            _workspace: workspace,
            workspace_path,
        })
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// The canonical working directory sessions of this world report.
    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    pub fn cwd(&self) -> String {
        self.workspace_path.to_string_lossy().to_string()
    }

    pub fn project_dir(&self) -> PathBuf {
        self.projects_root.join(encode_project_key(&self.cwd()))
    }

    /// Start a session builder bound to this world's working directory.
    pub fn session(&self, session_id: &str) -> SessionFileBuilder {
        SessionFileBuilder::new(session_id, &self.cwd())
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.project_dir().join(format!("{}.jsonl", session_id))
    }

    pub fn agent_path(&self, agent_id: &str) -> PathBuf {
        self.project_dir().join(format!("agent-{}.jsonl", agent_id))
    }

    pub fn nested_agent_path(&self, parent_session_id: &str, agent_id: &str) -> PathBuf {
        self.project_dir()
            .join(parent_session_id)
            .join("subagents")
            .join(format!("agent-{}.jsonl", agent_id))
    }

    /// Write a builder to its conventional location and return the path.
    pub fn write_session(
        &self,
        session_id: &str,
        builder: &SessionFileBuilder,
    ) -> anyhow::Result<PathBuf> {
        let path = self.session_path(session_id);
        builder.write_to(&path)?;
        Ok(path)
    }
}
