use std::time::Duration;

use serde_json::json;

use lm_assist_runtime::{RuntimeConfig, Workspace};
use lm_assist_store::{RunnerEvent, StartExecution};
use lm_assist_testing::{SessionFileBuilder, TestWorld};
use lm_assist_types::{ExecutionStatus, TokenUsage};

fn config(world: &TestWorld) -> RuntimeConfig {
    RuntimeConfig {
        projects_root: Some(world.projects_root().to_path_buf()),
        session_cache_ttl_ms: 0,
        watch_debounce_ms: 50,
        ..RuntimeConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn workspace_end_to_end() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-ws")
        .user_text("hello workspace")
        .assistant_text("hi");
    world.write_session("sess-ws", &builder)?;

    let workspace = Workspace::new(world.workspace_path().to_path_buf(), config(&world));
    workspace.start().await?;

    let listings = workspace.sessions().list_sessions(&world.cwd()).await?;
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].session_id, "sess-ws");

    workspace.shutdown().await?;
    // Shutdown flushed the per-project session cache.
    assert!(
        world
            .workspace_path()
            .join(".lm-assist/sessions.json")
            .is_file()
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn watcher_keeps_task_store_current() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world.session("sess-watch").user_text("start");
    let path = world.write_session("sess-watch", &builder)?;

    let workspace = Workspace::new(world.workspace_path().to_path_buf(), config(&world));
    workspace.start().await?;
    assert!(workspace.tasks().tasks(false).is_empty());

    // The agent appends a task; the watcher should pick it up without any
    // explicit refresh call.
    SessionFileBuilder::new("sess-watch", &world.cwd())
        .assistant_tool_use("tu_1", "TaskCreate", json!({"subject": "from watcher"}))
        .tool_result("tu_1", "Task #1 created successfully", false)
        .append_to(&path)?;

    let mut found = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !workspace.tasks().tasks(false).is_empty() {
            found = true;
            break;
        }
    }
    assert!(found, "watcher never refreshed the task store");

    workspace.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn runner_events_mirror_into_executions() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let workspace = Workspace::new(world.workspace_path().to_path_buf(), config(&world));

    let record = workspace
        .executions()
        .start_execution(StartExecution {
            tier: Some("worker".into()),
            prompt: "run it".into(),
            ..Default::default()
        })
        .await?;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    workspace.attach_runner(rx);

    tx.send(RunnerEvent::SessionStarted {
        execution_id: record.id.clone(),
        claude_session_id: "sess-live-1".into(),
    })?;
    tx.send(RunnerEvent::Assistant {
        execution_id: record.id.clone(),
        message: json!({"content": [{"type": "text", "text": "progress"}]}),
    })?;
    tx.send(RunnerEvent::Completed {
        execution_id: record.id.clone(),
        success: true,
        output: Some("all done".into()),
        usage: TokenUsage::default(),
        cost_usd: Some(0.01),
    })?;
    drop(tx);

    let mut finished = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(e) = workspace.executions().get_by_claude_session("sess-live-1")
            && e.status == ExecutionStatus::Completed
        {
            finished = Some(e);
            break;
        }
    }
    let finished = finished.expect("execution never completed");
    assert_eq!(finished.output.as_deref(), Some("all done"));
    assert!(!finished.chunks.is_empty());

    workspace.shutdown().await?;
    Ok(())
}
