use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use chrono::Utc;
use futures::StreamExt;
use tracing::debug;

use lm_assist_ingest::{read_raw, read_records};
use lm_assist_types::{Error, RawMessage, Result, SessionSnapshot};

use crate::fold::SessionFold;
use crate::persist::{PersistedEntry, load_project_cache, save_project_cache};

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a validated view may be served without re-statting the
    /// file. Zero always revalidates; deployments with a watcher running
    /// raise this since the watcher forces refreshes on change.
    pub ttl_ms: u64,
    /// Bounded parallelism for project warming.
    pub warming_concurrency: usize,
    pub persist_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 0,
            warming_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            persist_enabled: true,
        }
    }
}

#[derive(Default)]
struct Slot {
    fold: Option<SessionFold>,
    raw: Option<RawState>,
    validated_at: Option<std::time::Instant>,
}

/// Raw messages are bulky, so they live beside the structured fold with
/// their own resume cursor and are only loaded when asked for.
struct RawState {
    messages: Vec<RawMessage>,
    next_offset: u64,
    next_line_index: u64,
    file_size: u64,
    modified_at_ms: i64,
}

/// Process-wide cache of per-file structured session views.
///
/// Entries are keyed by absolute file path. Each file has its own async
/// mutex: concurrent readers of the same file serialize through it and
/// share a single extension; different files proceed in parallel.
pub struct SessionCache {
    slots: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<Slot>>>>,
    config: CacheConfig,
}

impl SessionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn slot_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(path.to_path_buf()).or_default().clone()
    }

    /// The structured view, extending the cache first if the file grew.
    /// Within the TTL window a validated view is served without touching
    /// the filesystem.
    pub async fn snapshot(&self, path: &Path) -> Result<SessionSnapshot> {
        self.snapshot_inner(path, false).await
    }

    /// Force revalidation regardless of TTL; the watcher calls this when a
    /// change event arrives.
    pub async fn refresh(&self, path: &Path) -> Result<SessionSnapshot> {
        self.snapshot_inner(path, true).await
    }

    async fn snapshot_inner(&self, path: &Path, force: bool) -> Result<SessionSnapshot> {
        let slot = self.slot_for(path);
        let mut guard = slot.lock().await;

        if !force
            && self.config.ttl_ms > 0
            && let (Some(fold), Some(validated_at)) = (&guard.fold, guard.validated_at)
            && validated_at.elapsed().as_millis() < self.config.ttl_ms as u128
        {
            return Ok(fold.view(Utc::now()));
        }

        let (size, mtime_ms) = stat(path).await?;
        self.ensure_fold(&mut guard, path, size, mtime_ms).await?;
        guard.validated_at = Some(std::time::Instant::now());

        let fold = guard.fold.as_ref().expect("fold ensured above");
        Ok(fold.view(Utc::now()))
    }

    async fn ensure_fold(
        &self,
        slot: &mut Slot,
        path: &Path,
        size: u64,
        mtime_ms: i64,
    ) -> Result<()> {
        let (offset, line_index, rebuilding) = match &slot.fold {
            Some(fold) if fold.file_size() == size && fold.modified_at_ms() == mtime_ms => {
                return Ok(());
            }
            // Pure append: size grew and nothing before the old offset was
            // rewritten (inferred from a non-regressing mtime).
            Some(fold) if size > fold.file_size() && mtime_ms >= fold.modified_at_ms() => {
                (fold.next_byte_offset, fold.next_line_index, false)
            }
            _ => (0, 0, true),
        };

        let chunk = {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || read_records(&path, offset, line_index))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??
        };

        if rebuilding {
            slot.fold = Some(SessionFold::new());
        }
        let fold = slot.fold.as_mut().expect("fold installed above");
        fold.extend(
            &chunk.records,
            chunk.next_offset,
            chunk.next_line_index,
            chunk.malformed,
        );
        fold.stamp(size, mtime_ms);

        // A file that never yielded a single record but has content is not
        // a session file at all.
        if rebuilding && !fold.has_records() && chunk.malformed > 0 {
            slot.fold = None;
            return Err(Error::Malformed(path.to_path_buf()));
        }
        Ok(())
    }

    /// Raw (schema-loose) records, cached and extended independently of the
    /// structured view.
    pub async fn raw_messages(&self, path: &Path) -> Result<Vec<RawMessage>> {
        let slot = self.slot_for(path);
        let mut guard = slot.lock().await;

        let (size, mtime_ms) = stat(path).await?;

        let (offset, line_index, keep) = match &guard.raw {
            Some(raw) if raw.file_size == size && raw.modified_at_ms == mtime_ms => {
                return Ok(raw.messages.clone());
            }
            Some(raw) if size > raw.file_size && mtime_ms >= raw.modified_at_ms => {
                (raw.next_offset, raw.next_line_index, true)
            }
            _ => (0, 0, false),
        };

        let chunk = {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || read_raw(&path, offset, line_index))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??
        };

        if keep {
            let raw = guard.raw.as_mut().expect("raw state present");
            raw.messages.extend(chunk.messages);
            raw.next_offset = chunk.next_offset;
            raw.next_line_index = chunk.next_line_index;
            raw.file_size = size;
            raw.modified_at_ms = mtime_ms;
        } else {
            guard.raw = Some(RawState {
                messages: chunk.messages,
                next_offset: chunk.next_offset,
                next_line_index: chunk.next_line_index,
                file_size: size,
                modified_at_ms: mtime_ms,
            });
        }

        Ok(guard.raw.as_ref().expect("raw state present").messages.clone())
    }

    /// Eagerly parse every session file of a project directory with bounded
    /// parallelism. Returns how many files parsed cleanly.
    pub async fn warm_project(&self, project_dir: &Path) -> Result<usize> {
        let mut files = Vec::new();
        if project_dir.is_dir() {
            for entry in std::fs::read_dir(project_dir)? {
                let path = entry?.path();
                if path.is_file() && path.extension().is_some_and(|e| e == "jsonl") {
                    files.push(path);
                }
            }
        }

        let warmed = futures::stream::iter(files)
            .map(|path| async move { self.snapshot(&path).await.is_ok() })
            .buffer_unordered(self.config.warming_concurrency.max(1))
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;

        Ok(warmed)
    }

    /// Drop the cache entry for one file (unlink events).
    pub fn invalidate(&self, path: &Path) {
        self.slots.lock().unwrap().remove(path);
    }

    /// Persist the folds of every cached session belonging to the given
    /// project working directory.
    pub async fn persist_project(&self, project_path: &Path) -> Result<()> {
        if !self.config.persist_enabled {
            return Ok(());
        }

        let slots: Vec<(PathBuf, Arc<tokio::sync::Mutex<Slot>>)> = {
            let map = self.slots.lock().unwrap();
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let want = project_path.to_string_lossy();
        let mut entries = Vec::new();
        for (path, slot) in slots {
            let guard = slot.lock().await;
            if let Some(fold) = &guard.fold
                && fold.cwd() == Some(want.as_ref())
            {
                entries.push(PersistedEntry {
                    file_path: path.to_string_lossy().to_string(),
                    fold: fold.clone(),
                });
            }
        }

        save_project_cache(project_path, &entries)
    }

    /// Reload persisted folds, installing only entries whose `(size, mtime)`
    /// still match the file on disk. A stale entry is skipped silently and
    /// the session rebuilds from scratch on first read.
    pub async fn load_project(&self, project_path: &Path) -> Result<usize> {
        if !self.config.persist_enabled {
            return Ok(0);
        }

        let entries = load_project_cache(project_path)?;
        let mut installed = 0;

        for entry in entries {
            let path = PathBuf::from(&entry.file_path);
            let Ok((size, mtime_ms)) = stat(&path).await else {
                continue;
            };
            if entry.fold.file_size() != size || entry.fold.modified_at_ms() != mtime_ms {
                debug!(path = %path.display(), "stale persisted cache entry, rebuilding");
                continue;
            }
            let slot = self.slot_for(&path);
            let mut guard = slot.lock().await;
            guard.fold = Some(entry.fold);
            installed += 1;
        }

        Ok(installed)
    }
}

async fn stat(path: &Path) -> Result<(u64, i64)> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|_| Error::NotFound(path.display().to_string()))?;
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok((meta.len(), mtime_ms))
}
