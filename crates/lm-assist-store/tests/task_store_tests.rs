use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use lm_assist_cache::{CacheConfig, SessionCache};
use lm_assist_store::{TaskStore, TaskStoreConfig, TaskStoreEvent};
use lm_assist_testing::TestWorld;
use lm_assist_types::TaskStatus;

fn task_store(world: &TestWorld) -> TaskStore {
    TaskStore::new(
        Arc::new(SessionCache::new(CacheConfig::default())),
        TaskStoreConfig {
            project_path: world.workspace_path().to_path_buf(),
            projects_root: world.projects_root().to_path_buf(),
            persist_enabled: true,
        },
    )
}

fn write_task_session(world: &TestWorld, session_id: &str) -> anyhow::Result<()> {
    let builder = world
        .session(session_id)
        .user_text("plan the work")
        .assistant_tool_use(
            "tu_1",
            "TaskCreate",
            json!({"subject": "design schema", "description": "tables and indexes"}),
        )
        .tool_result("tu_1", "Task #1 created successfully: design schema", false)
        .assistant_tool_use(
            "tu_2",
            "TaskCreate",
            json!({"subject": "implement storage"}),
        )
        .tool_result("tu_2", "Task #2 created successfully: implement storage", false)
        .assistant_tool_use(
            "tu_3",
            "TaskUpdate",
            json!({"taskId": "2", "addBlockedBy": ["1"]}),
        );
    world.write_session(session_id, &builder)?;
    Ok(())
}

#[tokio::test]
async fn refresh_namespaces_tasks_across_sessions() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    write_task_session(&world, "aaaa1111-0000-4000-8000-000000000001")?;
    write_task_session(&world, "bbbb2222-0000-4000-8000-000000000002")?;

    let store = task_store(&world);
    store.init().await?;

    let tasks = store.tasks(false);
    assert_eq!(tasks.len(), 4);
    assert!(tasks.iter().any(|t| t.id == "aaaa1111:1"));
    assert!(tasks.iter().any(|t| t.id == "bbbb2222:1"));

    // Dependency links were rewritten into the same namespace.
    let blocked = store.task("aaaa1111:2").unwrap();
    assert_eq!(blocked.blocked_by, vec!["aaaa1111:1"]);
    Ok(())
}

#[tokio::test]
async fn ready_tasks_follow_blockers() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    write_task_session(&world, "cccc3333-0000-4000-8000-000000000003")?;

    let store = task_store(&world);
    store.init().await?;

    // Task 2 is blocked by the open task 1.
    let ready: Vec<String> = store.ready_tasks().iter().map(|t| t.id.clone()).collect();
    assert!(ready.contains(&"cccc3333:1".to_string()));
    assert!(!ready.contains(&"cccc3333:2".to_string()));
    Ok(())
}

#[tokio::test]
async fn refresh_emits_diff_events() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    write_task_session(&world, "dddd4444-0000-4000-8000-000000000004")?;

    let store = task_store(&world);
    let created = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    {
        let created = created.clone();
        let completed = completed.clone();
        store.add_listener(Box::new(move |event| match event {
            TaskStoreEvent::TaskCreated(_) => {
                created.fetch_add(1, Ordering::SeqCst);
            }
            TaskStoreEvent::TaskCompleted(_) => {
                completed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }));
    }

    store.init().await?;
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(completed.load(Ordering::SeqCst), 0);

    // Complete task 1 in a later append, then refresh again.
    lm_assist_testing::SessionFileBuilder::new(
        "dddd4444-0000-4000-8000-000000000004",
        &world.cwd(),
    )
    .assistant_tool_use("tu_9", "TaskUpdate", json!({"taskId": "1", "status": "completed"}))
    .append_to(&world.session_path("dddd4444-0000-4000-8000-000000000004"))?;

    store.refresh().await?;
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    let task = store.task("dddd4444:1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn adhoc_detected_for_sessions_with_changes_but_no_tasks() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("eeee5555-0000-4000-8000-000000000005")
        .user_text("just edit a file")
        .assistant_tool_use("tu_1", "Write", json!({"file_path": "notes.md", "content": "x"}));
    world.write_session("eeee5555-0000-4000-8000-000000000005", &builder)?;

    let store = task_store(&world);
    let adhoc = Arc::new(AtomicUsize::new(0));
    {
        let adhoc = adhoc.clone();
        store.add_listener(Box::new(move |event| {
            if matches!(event, TaskStoreEvent::AdhocDetected { .. }) {
                adhoc.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    store.init().await?;
    assert_eq!(adhoc.load(Ordering::SeqCst), 1);
    assert!(store.tasks(false).is_empty());
    Ok(())
}

#[tokio::test]
async fn snapshot_round_trip_preserves_stats() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    write_task_session(&world, "ffff6666-0000-4000-8000-000000000006")?;

    let first = task_store(&world);
    first.init().await?;
    let saved_stats = first.stats();
    assert_eq!(saved_stats.total_tasks, 2);

    // A fresh process loads the snapshot; unchanged files are reused from
    // scan state without re-parsing.
    let second = task_store(&world);
    second.init().await?;
    let loaded_stats = second.stats();

    assert_eq!(saved_stats.total_tasks, loaded_stats.total_tasks);
    assert_eq!(saved_stats.pending, loaded_stats.pending);
    assert_eq!(saved_stats.in_progress, loaded_stats.in_progress);
    assert_eq!(saved_stats.completed, loaded_stats.completed);
    assert_eq!(saved_stats.sessions, loaded_stats.sessions);
    assert_eq!(saved_stats.ready, loaded_stats.ready);
    Ok(())
}

#[tokio::test]
async fn parent_auto_completion() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("abab7777-0000-4000-8000-000000000007")
        .assistant_tool_use(
            "tu_1",
            "TaskCreate",
            json!({"subject": "ship feature", "metadata": {"isIntent": true}}),
        )
        .tool_result("tu_1", "Task #1 created successfully: ship feature", false)
        .assistant_tool_use("tu_2", "TaskCreate", json!({"subject": "write code"}))
        .tool_result("tu_2", "Task #2 created successfully: write code", false)
        .assistant_tool_use(
            "tu_3",
            "TaskUpdate",
            json!({"taskId": "1", "addBlockedBy": ["2"]}),
        )
        .assistant_tool_use(
            "tu_4",
            "TaskUpdate",
            json!({"taskId": "2", "status": "completed"}),
        );
    world.write_session("abab7777-0000-4000-8000-000000000007", &builder)?;

    let store = task_store(&world);
    store.init().await?;

    let children = store.children_of("abab7777:1");
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, "abab7777:2");
    assert!(store.is_auto_completable("abab7777:1"));
    assert!(!store.is_auto_completable("abab7777:2"));
    Ok(())
}

#[tokio::test]
async fn external_task_files_override_session_tasks() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let session_id = "ecec9999-0000-4000-8000-000000000009";
    write_task_session(&world, session_id)?;

    // The CLI's own task files are authoritative when present.
    let tasks_dir = world
        .projects_root()
        .parent()
        .unwrap()
        .join("tasks")
        .join(session_id);
    std::fs::create_dir_all(&tasks_dir)?;
    std::fs::write(
        tasks_dir.join("1.json"),
        json!({"id": "1", "subject": "design schema", "status": "completed"}).to_string(),
    )?;

    let store = task_store(&world);
    store.init().await?;

    let task = store.task("ecec9999:1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    // The JSONL-only task is still there.
    assert!(store.task("ecec9999:2").is_some());
    Ok(())
}

#[tokio::test]
async fn deleted_tasks_hidden_by_default() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("caca8888-0000-4000-8000-000000000008")
        .assistant_tool_use("tu_1", "TaskCreate", json!({"subject": "obsolete"}))
        .tool_result("tu_1", "Task #1 created successfully: obsolete", false)
        .assistant_tool_use(
            "tu_2",
            "TaskUpdate",
            json!({"taskId": "1", "status": "deleted"}),
        );
    world.write_session("caca8888-0000-4000-8000-000000000008", &builder)?;

    let store = task_store(&world);
    store.init().await?;

    assert!(store.tasks(false).is_empty());
    assert_eq!(store.tasks(true).len(), 1);
    Ok(())
}
