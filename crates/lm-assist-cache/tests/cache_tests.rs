use chrono::{Duration, Utc};
use serde_json::json;

use lm_assist_cache::{CacheConfig, SessionCache};
use lm_assist_testing::{SessionFileBuilder, TestWorld};
use lm_assist_types::{Error, SessionStatus, SubagentStatus, TaskStatus};

fn cache() -> SessionCache {
    SessionCache::new(CacheConfig::default())
}

#[tokio::test]
async fn incremental_extension_reads_only_new_bytes() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-inc")
        .assistant_text("turn one")
        .assistant_text("turn two")
        .assistant_text("turn three");
    let path = world.write_session("sess-inc", &builder)?;

    let cache = cache();
    let first = cache.snapshot(&path).await?;
    assert_eq!(first.num_turns, 3);
    assert_eq!(first.responses.len(), 3);
    let offset_after_first = first.last_byte_offset;
    assert_eq!(offset_after_first, path.metadata()?.len());

    // Append one more assistant record; only the new bytes are parsed and
    // the earlier records keep their indexes.
    SessionFileBuilder::new("sess-inc", &world.cwd())
        .assistant_text("turn four")
        .append_to(&path)?;

    let second = cache.snapshot(&path).await?;
    assert_eq!(second.num_turns, 4);
    let texts: Vec<&str> = second.responses.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(texts, vec!["turn one", "turn two", "turn three", "turn four"]);
    assert!(second.last_byte_offset > offset_after_first);
    for (i, r) in second.responses.iter().enumerate() {
        assert_eq!(r.line_index, i as u64);
    }
    Ok(())
}

#[tokio::test]
async fn extension_matches_full_parse() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-eq")
        .system_init("claude-sonnet-4-5", &["Bash", "Read"])
        .user_text("please fix the bug")
        .assistant_tool_use("tu_1", "Bash", json!({"command": "ls"}))
        .tool_result("tu_1", "main.rs", false)
        .assistant_text("done");
    let path = world.write_session("sess-eq", &builder)?;

    // Incremental: parse a prefix by truncating, then restore and extend.
    let full_content = std::fs::read_to_string(&path)?;
    let lines: Vec<&str> = full_content.lines().collect();
    let prefix = format!("{}\n{}\n", lines[0], lines[1]);
    std::fs::write(&path, &prefix)?;

    let incremental_cache = cache();
    let _ = incremental_cache.snapshot(&path).await?;
    std::fs::write(&path, &full_content)?;
    let incremental = incremental_cache.snapshot(&path).await?;

    let fresh = cache().snapshot(&path).await?;

    assert_eq!(incremental.num_turns, fresh.num_turns);
    assert_eq!(incremental.user_prompts.len(), fresh.user_prompts.len());
    assert_eq!(incremental.tool_uses.len(), fresh.tool_uses.len());
    assert_eq!(
        incremental.responses.last().map(|r| r.text.clone()),
        fresh.responses.last().map(|r| r.text.clone())
    );
    Ok(())
}

#[tokio::test]
async fn task_reconciliation_keeps_single_task() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-task")
        .assistant_tool_use(
            "tu_1",
            "TaskCreate",
            json!({"subject": "ship v1", "description": "cut the release"}),
        )
        .tool_result("tu_1", "Task #7 created successfully: ship v1", false)
        .assistant_tool_use(
            "tu_2",
            "TaskUpdate",
            json!({"taskId": "7", "status": "in_progress", "addBlockedBy": ["3"]}),
        )
        // A duplicate marker for the same tool-use id must be a no-op.
        .tool_result("tu_1", "Task #7 created successfully: ship v1", false);
    let path = world.write_session("sess-task", &builder)?;

    let snapshot = cache().snapshot(&path).await?;
    assert_eq!(snapshot.tasks.len(), 1);
    let task = &snapshot.tasks[0];
    assert_eq!(task.id, "7");
    assert_eq!(task.subject, "ship v1");
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.blocked_by, vec!["3"]);
    Ok(())
}

#[tokio::test]
async fn subagent_linking_resolves_status_and_result() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-sub")
        .user_text("explore the repo")
        .assistant_tool_use("tu_x", "Task", json!({"prompt": "explore repo"}))
        .progress_agent("tu_x", "a9afc2c", "scanning files")
        .tool_result("tu_x", "Done.", false);
    let path = world.write_session("sess-sub", &builder)?;

    let snapshot = cache().snapshot(&path).await?;
    assert_eq!(snapshot.subagents.len(), 1);
    let invocation = &snapshot.subagents[0];
    assert_eq!(invocation.agent_id.as_deref(), Some("a9afc2c"));
    assert_eq!(invocation.status, SubagentStatus::Completed);
    assert_eq!(invocation.result.as_deref(), Some("Done."));
    assert_eq!(invocation.user_prompt_index, 1);
    Ok(())
}

#[tokio::test]
async fn status_running_then_completed_then_interrupted() -> anyhow::Result<()> {
    let world = TestWorld::new()?;

    // Fresh assistant tail, no result: running.
    let recent = world
        .session("sess-fresh")
        .starting_at(Utc::now() - Duration::seconds(30))
        .assistant_text("working on it");
    let path = world.write_session("sess-fresh", &recent)?;
    let snapshot = cache().snapshot(&path).await?;
    assert_eq!(snapshot.status, SessionStatus::Running);

    // Same shape 12 minutes ago: completed (mtime must agree).
    let old = world
        .session("sess-done")
        .starting_at(Utc::now() - Duration::minutes(12))
        .user_text("do the thing")
        .assistant_text("did the thing");
    let path = world.write_session("sess-done", &old)?;
    backdate(&path, 12);
    let snapshot = cache().snapshot(&path).await?;
    assert_eq!(snapshot.status, SessionStatus::Completed);

    // User message never answered, 12 minutes old: interrupted.
    let abandoned = world
        .session("sess-gone")
        .starting_at(Utc::now() - Duration::minutes(12))
        .assistant_text("ready")
        .user_text("are you there?");
    let path = world.write_session("sess-gone", &abandoned)?;
    backdate(&path, 12);
    let snapshot = cache().snapshot(&path).await?;
    assert_eq!(snapshot.status, SessionStatus::Interrupted);
    Ok(())
}

fn backdate(path: &std::path::Path, minutes: i64) {
    let when = std::time::SystemTime::now() - std::time::Duration::from_secs(60 * minutes as u64);
    filetime::set_file_mtime(path, filetime::FileTime::from_system_time(when)).unwrap();
}

#[tokio::test]
async fn result_record_sets_authoritative_fields() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-res")
        .user_text("quick question")
        .assistant_text("quick answer")
        .result("success", 0.042, 2);
    let path = world.write_session("sess-res", &builder)?;

    let snapshot = cache().snapshot(&path).await?;
    assert!(snapshot.completed);
    assert_eq!(snapshot.status, SessionStatus::Completed);
    assert_eq!(snapshot.num_turns, 2);
    assert_eq!(snapshot.duration_ms, Some(4500));
    assert!((snapshot.cost_usd.unwrap() - 0.042).abs() < 1e-9);
    // Result usage overwrites the accumulated deltas.
    assert_eq!(snapshot.usage.input_tokens, 1000);
    assert_eq!(snapshot.usage.output_tokens, 200);
    Ok(())
}

#[tokio::test]
async fn cost_estimated_when_result_missing() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-cost")
        .system_init("claude-sonnet-4-5", &["Bash"])
        .assistant_text("hello");
    let path = world.write_session("sess-cost", &builder)?;

    let snapshot = cache().snapshot(&path).await?;
    // 100 input + 20 output on sonnet rates.
    let expected = 100.0 * 3.0 / 1e6 + 20.0 * 15.0 / 1e6;
    assert!((snapshot.cost_usd.unwrap() - expected).abs() < 1e-12);
    Ok(())
}

#[tokio::test]
async fn compact_messages_ordered() -> anyhow::Result<()> {
    let marker = "This session is being continued from a previous conversation that ran out of context.";
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-compact")
        .user_text("start")
        .user_text(&format!("{} First continuation.\n\n1. Primary Request and Intent:\nKeep going.\n", marker))
        .assistant_text("ok")
        .user_text(&format!("{} Second continuation.", marker));
    let path = world.write_session("sess-compact", &builder)?;

    let snapshot = cache().snapshot(&path).await?;
    assert_eq!(snapshot.compact_messages.len(), 2);
    assert_eq!(snapshot.compact_messages[0].compact_order, 0);
    assert_eq!(snapshot.compact_messages[1].compact_order, 1);
    assert!(
        snapshot.compact_messages[0].line_index < snapshot.compact_messages[1].line_index
    );
    assert_eq!(
        snapshot.compact_messages[0].primary_request.as_deref(),
        Some("Keep going.")
    );
    Ok(())
}

#[tokio::test]
async fn todos_deduplicated_latest_status_wins() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-todo")
        .assistant_tool_use(
            "tu_1",
            "TodoWrite",
            json!({"todos": [{"content": "write tests", "status": "pending"}]}),
        )
        .todo_result(
            "tu_1",
            json!([{"content": "write tests", "status": "in_progress", "activeForm": "Writing tests"}]),
        );
    let path = world.write_session("sess-todo", &builder)?;

    let snapshot = cache().snapshot(&path).await?;
    assert_eq!(snapshot.todos.len(), 1);
    assert_eq!(snapshot.todos[0].status, "in_progress");
    assert_eq!(snapshot.todos[0].active_form.as_deref(), Some("Writing tests"));
    Ok(())
}

#[tokio::test]
async fn malformed_file_with_no_valid_records_errors() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-bad")
        .raw_line("this is not json")
        .raw_line("neither is this");
    let path = world.write_session("sess-bad", &builder)?;

    let err = cache().snapshot(&path).await.unwrap_err();
    assert!(matches!(err, Error::Malformed(_)));
    Ok(())
}

#[tokio::test]
async fn empty_file_yields_empty_snapshot() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let path = world.session_path("sess-empty");
    std::fs::create_dir_all(path.parent().unwrap())?;
    std::fs::write(&path, "")?;

    let snapshot = cache().snapshot(&path).await?;
    assert_eq!(snapshot.num_turns, 0);
    assert_eq!(snapshot.user_prompt_count, 0);
    assert_eq!(snapshot.status, SessionStatus::Running);
    Ok(())
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let err = cache()
        .snapshot(std::path::Path::new("/nonexistent/sess.jsonl"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn rewrite_triggers_rebuild() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-rw")
        .user_text("one")
        .assistant_text("two");
    let path = world.write_session("sess-rw", &builder)?;

    let cache = cache();
    let first = cache.snapshot(&path).await?;
    assert_eq!(first.num_turns, 2);

    // Shrink the file (earlier bytes rewritten): cache must rebuild.
    let shorter = world.session("sess-rw").user_text("only");
    shorter.write_to(&path)?;

    let second = cache.snapshot(&path).await?;
    assert_eq!(second.num_turns, 1);
    assert_eq!(second.user_prompts[0].text, "only");
    Ok(())
}

#[tokio::test]
async fn raw_messages_incremental() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world.session("sess-raw").user_text("hello");
    let path = world.write_session("sess-raw", &builder)?;

    let cache = cache();
    let first = cache.raw_messages(&path).await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].record_type, "user");

    SessionFileBuilder::new("sess-raw", &world.cwd())
        .assistant_text("hi")
        .append_to(&path)?;

    let second = cache.raw_messages(&path).await?;
    assert_eq!(second.len(), 2);
    assert_eq!(second[1].record_type, "assistant");
    assert_eq!(second[1].line_index, 1);
    Ok(())
}

#[tokio::test]
async fn persistence_round_trip_resumes_incremental() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world
        .session("sess-persist")
        .user_text("hello")
        .assistant_text("hi");
    let path = world.write_session("sess-persist", &builder)?;

    let first_cache = cache();
    let before = first_cache.snapshot(&path).await?;
    first_cache.persist_project(world.workspace_path()).await?;

    // Fresh process: load the persisted cache, then extend from disk state.
    let second_cache = cache();
    let installed = second_cache.load_project(world.workspace_path()).await?;
    assert_eq!(installed, 1);

    SessionFileBuilder::new("sess-persist", &world.cwd())
        .assistant_text("more")
        .append_to(&path)?;

    let after = second_cache.snapshot(&path).await?;
    assert_eq!(after.num_turns, before.num_turns + 1);
    assert_eq!(after.responses.len(), 2);
    Ok(())
}

#[tokio::test]
async fn stale_persisted_entry_is_rebuilt() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let builder = world.session("sess-stale").user_text("hello");
    let path = world.write_session("sess-stale", &builder)?;

    let first_cache = cache();
    first_cache.snapshot(&path).await?;
    first_cache.persist_project(world.workspace_path()).await?;

    // Rewrite the file so (size, mtime) no longer match.
    let replaced = world
        .session("sess-stale")
        .user_text("completely different contents now");
    replaced.write_to(&path)?;

    let second_cache = cache();
    let installed = second_cache.load_project(world.workspace_path()).await?;
    assert_eq!(installed, 0);

    let snapshot = second_cache.snapshot(&path).await?;
    assert_eq!(
        snapshot.user_prompts[0].text,
        "completely different contents now"
    );
    Ok(())
}

#[tokio::test]
async fn warm_project_parses_all_sessions() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    for i in 0..3 {
        let id = format!("sess-warm-{}", i);
        let builder = world.session(&id).user_text("hi");
        world.write_session(&id, &builder)?;
    }

    let warmed = cache().warm_project(&world.project_dir()).await?;
    assert_eq!(warmed, 3);
    Ok(())
}

#[tokio::test]
async fn api_error_response_flagged() -> anyhow::Result<()> {
    let world = TestWorld::new()?;
    let line = json!({
        "type": "assistant",
        "sessionId": "sess-err",
        "timestamp": "2026-01-01T00:00:00Z",
        "isApiErrorMessage": true,
        "message": {
            "id": "m1",
            "model": "claude-sonnet-4-5",
            "content": [{"type": "text", "text": "API Error: {\"error\":{},\"request_id\":\"req_abc123\"}"}],
        },
    });
    let builder = world.session("sess-err").raw_line(&line.to_string());
    let path = world.write_session("sess-err", &builder)?;

    let snapshot = cache().snapshot(&path).await?;
    assert_eq!(snapshot.responses.len(), 1);
    assert!(snapshot.responses[0].is_api_error);
    assert_eq!(snapshot.responses[0].request_id.as_deref(), Some("req_abc123"));
    Ok(())
}
