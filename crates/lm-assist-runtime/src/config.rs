use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The directory holding lm-assist's own files (config, logs). An
/// `LM_ASSIST_PATH` environment variable wins outright; otherwise the
/// platform data directory gets an `lm-assist` subdirectory, with a hidden
/// home directory as the last resort.
pub fn data_dir() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("LM_ASSIST_PATH") {
        return Ok(PathBuf::from(path));
    }

    dirs::data_dir()
        .map(|dir| dir.join("lm-assist"))
        .or_else(|| dirs::home_dir().map(|home| home.join(".lm-assist")))
        .ok_or_else(|| Error::Config("no usable data directory on this system".to_string()))
}

/// Runtime knobs, loaded from `config.toml` with serde defaults so a
/// partial file works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// How long a validated session view is served without re-statting.
    pub session_cache_ttl_ms: u64,
    /// Quiet period before a directory's batched events flush.
    pub watch_debounce_ms: u64,
    pub max_events: usize,
    pub max_executions: usize,
    /// Age after which finished executions are dropped.
    pub cleanup_age_ms: u64,
    pub warming_concurrency: usize,
    pub persist_enabled: bool,
    /// Optional periodic task-store refresh; None disables it.
    pub auto_refresh_ms: Option<u64>,
    /// Override of `{CLAUDE_HOME}/projects`.
    pub projects_root: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_cache_ttl_ms: 60_000,
            watch_debounce_ms: 500,
            max_events: 10_000,
            max_executions: 1_000,
            cleanup_age_ms: 7 * 24 * 60 * 60 * 1000,
            warming_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            persist_enabled: true,
            auto_refresh_ms: None,
            projects_root: None,
        }
    }
}

impl RuntimeConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(data_dir()?.join("config.toml"))
    }

    pub fn effective_projects_root(&self) -> PathBuf {
        self.projects_root
            .clone()
            .unwrap_or_else(lm_assist_ingest::default_projects_root)
    }
}
