use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use lm_assist_types::{Error, Result, StoredEvent};

// Appends to events.jsonl are serialized process-wide so concurrent writers
// never interleave partial lines.
static EVENT_WRITER: Mutex<()> = Mutex::const_new(());

/// Append one event as a single JSONL line.
pub async fn append_event_line(state_dir: &Path, event: &StoredEvent) -> Result<()> {
    let _guard = EVENT_WRITER.lock().await;
    let dir = state_dir.to_path_buf();
    let line = serde_json::to_string(event)?;

    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&dir)?;
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.jsonl"))?;
        writeln!(file, "{}", line)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Rewrite a JSON array file atomically (temp + rename).
pub async fn save_json_array<T: Serialize>(
    state_dir: &Path,
    file_name: &str,
    values: &[T],
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(values)?;
    write_atomic(state_dir.to_path_buf(), file_name.to_string(), bytes).await
}

/// Rewrite a whole JSON document atomically.
pub async fn save_json_file<T: Serialize>(
    state_dir: &Path,
    file_name: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(state_dir.to_path_buf(), file_name.to_string(), bytes).await
}

async fn write_atomic(dir: PathBuf, file_name: String, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{}.tmp", file_name));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, dir.join(&file_name))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Load a JSON array file; missing or unreadable files come back empty.
pub async fn load_json_array<T: DeserializeOwned + Send + 'static>(
    state_dir: &Path,
    file_name: &str,
) -> Result<Vec<T>> {
    let path = state_dir.join(file_name);
    if !path.is_file() {
        return Ok(Vec::new());
    }

    tokio::task::spawn_blocking(move || -> Result<Vec<T>> {
        let bytes = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes).unwrap_or_default())
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?
}
