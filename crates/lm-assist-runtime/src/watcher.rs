use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::error;

use crate::error::Result;

/// One debounced flush for one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBatch {
    pub dir: PathBuf,
    /// Session files added or modified since the last flush.
    pub changed: Vec<PathBuf>,
    /// Session files unlinked since the last flush.
    pub removed: Vec<PathBuf>,
}

struct PendingBatch {
    changed: BTreeSet<PathBuf>,
    removed: BTreeSet<PathBuf>,
    last_event: Instant,
}

/// Watches session directories and batches filesystem events per directory
/// with a quiet-period debounce, so one agent append burst becomes one
/// cache extension instead of dozens.
///
/// The debounce worker owns no cache locks; consumers react to flushed
/// batches on their own executor.
pub struct SessionWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<WatchBatch>,
}

impl SessionWatcher {
    pub fn new(dirs: Vec<PathBuf>, debounce: Duration) -> Result<Self> {
        let (tx_fs, rx_fs) = channel::<Event>();
        let (tx_out, rx_out) = channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx_fs.send(event);
            }
        })?;

        for dir in &dirs {
            if dir.is_dir() {
                watcher.watch(dir, RecursiveMode::Recursive)?;
            }
        }

        std::thread::Builder::new()
            .name("session-watcher-debounce".to_string())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    debounce_loop(rx_fs, tx_out, debounce);
                }));

                if let Err(panic_err) = result {
                    let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_err.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "debounce worker panicked with unknown error".to_string()
                    };
                    // The batch channel is gone with the worker; consumers
                    // see the stream end and this records why.
                    error!("session watcher debounce worker panicked: {}", panic_msg);
                }
            })?;

        Ok(Self {
            _watcher: watcher,
            rx: rx_out,
        })
    }

    pub fn receiver(&self) -> &Receiver<WatchBatch> {
        &self.rx
    }

    /// Bridge the blocking receiver into an async channel. The watcher is
    /// moved into the bridge task and dropped when the async side goes
    /// away; the bridge polls with a timeout so runtime shutdown is never
    /// stuck behind a blocked recv.
    pub fn into_async(self) -> tokio::sync::mpsc::UnboundedReceiver<WatchBatch> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || {
            loop {
                match self.rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(batch) => {
                        if tx.send(batch).is_err() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if tx.is_closed() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        rx
    }
}

fn debounce_loop(rx: Receiver<Event>, tx: Sender<WatchBatch>, debounce: Duration) {
    let mut pending: HashMap<PathBuf, PendingBatch> = HashMap::new();

    loop {
        let received = if pending.is_empty() {
            match rx.recv() {
                Ok(event) => Some(event),
                Err(_) => break,
            }
        } else {
            match rx.recv_timeout(debounce) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        if let Some(event) = received {
            bucket_event(&mut pending, &event);
        }

        // Flush directories that have been quiet for the debounce window.
        let now = Instant::now();
        let ready: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, batch)| now.duration_since(batch.last_event) >= debounce)
            .map(|(dir, _)| dir.clone())
            .collect();

        for dir in ready {
            if let Some(batch) = pending.remove(&dir) {
                let flush = WatchBatch {
                    dir,
                    changed: batch.changed.into_iter().collect(),
                    removed: batch.removed.into_iter().collect(),
                };
                if !flush.changed.is_empty() || !flush.removed.is_empty() {
                    let _ = tx.send(flush);
                }
            }
        }
    }

    // Channel closed: flush whatever is left.
    for (dir, batch) in pending {
        let _ = tx.send(WatchBatch {
            dir,
            changed: batch.changed.into_iter().collect(),
            removed: batch.removed.into_iter().collect(),
        });
    }
}

fn bucket_event(pending: &mut HashMap<PathBuf, PendingBatch>, event: &Event) {
    let removed = matches!(event.kind, EventKind::Remove(_));
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return;
    }

    for path in &event.paths {
        if path.extension().is_none_or(|e| e != "jsonl") {
            continue;
        }
        let Some(dir) = path.parent().map(|p| p.to_path_buf()) else {
            continue;
        };
        let batch = pending.entry(dir).or_insert_with(|| PendingBatch {
            changed: BTreeSet::new(),
            removed: BTreeSet::new(),
            last_event: Instant::now(),
        });
        batch.last_event = Instant::now();
        if removed {
            batch.changed.remove(path);
            batch.removed.insert(path.clone());
        } else {
            batch.changed.insert(path.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_batches_events_per_directory() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let watcher = SessionWatcher::new(
            vec![dir.path().to_path_buf()],
            Duration::from_millis(100),
        )?;

        let a = dir.path().join("one.jsonl");
        let b = dir.path().join("two.jsonl");
        std::fs::write(&a, "{}\n")?;
        std::fs::write(&b, "{}\n")?;
        let mut f = std::fs::OpenOptions::new().append(true).open(&a)?;
        writeln!(f, "{{}}")?;

        let batch = watcher
            .receiver()
            .recv_timeout(Duration::from_secs(5))
            .expect("expected a flushed batch");

        assert_eq!(batch.dir, dir.path());
        assert!(batch.changed.contains(&a));
        Ok(())
    }

    #[test]
    fn test_non_jsonl_files_ignored() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let watcher = SessionWatcher::new(
            vec![dir.path().to_path_buf()],
            Duration::from_millis(50),
        )?;

        std::fs::write(dir.path().join("notes.txt"), "hello")?;

        let result = watcher
            .receiver()
            .recv_timeout(Duration::from_millis(500));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_unlink_lands_in_removed() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("gone.jsonl");
        std::fs::write(&path, "{}\n")?;

        let watcher = SessionWatcher::new(
            vec![dir.path().to_path_buf()],
            Duration::from_millis(50),
        )?;
        std::fs::remove_file(&path)?;

        let batch = watcher
            .receiver()
            .recv_timeout(Duration::from_secs(5))
            .expect("expected a flushed batch");
        assert!(batch.removed.contains(&path));
        Ok(())
    }
}
