use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use lm_assist_cache::{CacheConfig, SessionCache};
use lm_assist_ingest::encode_project_key;
use lm_assist_query::SessionService;
use lm_assist_store::{ExecutionStore, SessionMonitor, StoreConfig, TaskStore, TaskStoreConfig};

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::watcher::SessionWatcher;

/// Owns the long-lived engine state for one project: the session cache,
/// the query service, the execution store, and the task store, wired to a
/// filesystem watcher.
///
/// Created once at startup and shut down explicitly; downstream components
/// receive these collaborators from here instead of reaching for globals.
pub struct Workspace {
    config: RuntimeConfig,
    project_path: PathBuf,
    cache: Arc<SessionCache>,
    sessions: Arc<SessionService>,
    executions: Arc<ExecutionStore>,
    tasks: Arc<TaskStore>,
    background: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Workspace {
    pub fn new(project_path: PathBuf, config: RuntimeConfig) -> Self {
        let projects_root = config.effective_projects_root();

        let cache = Arc::new(SessionCache::new(CacheConfig {
            ttl_ms: config.session_cache_ttl_ms,
            warming_concurrency: config.warming_concurrency,
            persist_enabled: config.persist_enabled,
        }));

        let sessions = Arc::new(SessionService::new(cache.clone(), projects_root.clone()));

        let executions = Arc::new(ExecutionStore::new(StoreConfig {
            max_events: config.max_events,
            max_executions: config.max_executions,
            cleanup_age_ms: config.cleanup_age_ms,
            persist_enabled: config.persist_enabled,
            state_dir: project_path.join(lm_assist_types::STATE_DIR),
        }));

        let tasks = Arc::new(TaskStore::new(
            cache.clone(),
            TaskStoreConfig {
                project_path: project_path.clone(),
                projects_root,
                persist_enabled: config.persist_enabled,
            },
        ));

        Self {
            config,
            project_path,
            cache,
            sessions,
            executions,
            tasks,
            background: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.sessions
    }

    pub fn executions(&self) -> &Arc<ExecutionStore> {
        &self.executions
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    /// Load persisted state, warm the project's sessions, start the
    /// watcher, and begin mirroring runner events if a stream is attached
    /// later via [`SessionMonitor`].
    pub async fn start(&self) -> Result<()> {
        self.cache.load_project(&self.project_path).await?;
        self.executions.load().await?;
        self.tasks.init().await?;

        let project_dir = self
            .sessions
            .projects_root()
            .join(encode_project_key(&self.project_path.to_string_lossy()));
        if project_dir.is_dir() {
            let warmed = self.cache.warm_project(&project_dir).await?;
            debug!(count = warmed, "warmed project sessions");
        }

        // Watch the project's session directory; change batches extend or
        // rebuild cache entries and nudge the task store.
        let watcher = SessionWatcher::new(
            vec![project_dir],
            Duration::from_millis(self.config.watch_debounce_ms),
        )?;
        let mut batches = watcher.into_async();

        let cache = self.cache.clone();
        let tasks = self.tasks.clone();
        let watch_task = tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                for path in &batch.removed {
                    cache.invalidate(path);
                }
                for path in &batch.changed {
                    if let Err(err) = cache.refresh(path).await {
                        debug!(path = %path.display(), "watch refresh failed: {}", err);
                    }
                }
                if let Err(err) = tasks.refresh().await {
                    warn!("task store refresh failed: {}", err);
                }
            }
            warn!("session watch stream ended; no further change batches will arrive");
        });
        self.background.lock().unwrap().push(watch_task);

        if let Some(interval_ms) = self.config.auto_refresh_ms {
            let tasks = self.tasks.clone();
            let refresh_task = tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
                loop {
                    interval.tick().await;
                    if let Err(err) = tasks.refresh().await {
                        warn!("periodic task refresh failed: {}", err);
                    }
                }
            });
            self.background.lock().unwrap().push(refresh_task);
        }

        Ok(())
    }

    /// Attach a runner event stream; per-turn progress mirrors into the
    /// execution store until the sender drops.
    pub fn attach_runner(
        &self,
        events: tokio::sync::mpsc::UnboundedReceiver<lm_assist_store::RunnerEvent>,
    ) {
        let handle = SessionMonitor::attach(self.executions.clone(), events);
        self.background.lock().unwrap().push(handle);
    }

    /// Stop background work and flush persistence.
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<_> = self.background.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        self.cache.persist_project(&self.project_path).await?;
        self.executions.cleanup();
        Ok(())
    }
}
