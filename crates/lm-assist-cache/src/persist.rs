use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lm_assist_types::{Result, STATE_DIR};

use crate::fold::SessionFold;

const CACHE_VERSION: u32 = 1;
const CACHE_FILE: &str = "sessions.json";

/// One persisted session fold, keyed by its file path and validated against
/// `(size, mtime)` on reload.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub file_path: String,
    pub fold: SessionFold,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProjectCacheFile {
    version: u32,
    project_path: String,
    saved_at: DateTime<Utc>,
    entries: Vec<PersistedEntry>,
}

/// Write the project's session cache atomically (temp file + rename).
pub fn save_project_cache(project_path: &Path, entries: &[PersistedEntry]) -> Result<()> {
    let dir = project_path.join(STATE_DIR);
    std::fs::create_dir_all(&dir)?;

    let file = ProjectCacheFile {
        version: CACHE_VERSION,
        project_path: project_path.to_string_lossy().to_string(),
        saved_at: Utc::now(),
        entries: entries
            .iter()
            .map(|e| PersistedEntry {
                file_path: e.file_path.clone(),
                fold: e.fold.clone(),
            })
            .collect(),
    };

    let tmp = dir.join(format!("{}.tmp", CACHE_FILE));
    std::fs::write(&tmp, serde_json::to_vec(&file)?)?;
    std::fs::rename(&tmp, dir.join(CACHE_FILE))?;
    Ok(())
}

/// Load persisted entries; a missing file, unreadable JSON, or a version or
/// project mismatch all come back as an empty list so the cache rebuilds.
pub fn load_project_cache(project_path: &Path) -> Result<Vec<PersistedEntry>> {
    let path = project_path.join(STATE_DIR).join(CACHE_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }

    let bytes = std::fs::read(&path)?;
    let Ok(file) = serde_json::from_slice::<ProjectCacheFile>(&bytes) else {
        return Ok(Vec::new());
    };

    if file.version != CACHE_VERSION
        || file.project_path != project_path.to_string_lossy().as_ref()
    {
        return Ok(Vec::new());
    }

    Ok(file.entries)
}
