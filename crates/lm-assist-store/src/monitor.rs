use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;

use lm_assist_types::{ExecutionStatus, TokenUsage};

use crate::executions::{CompleteExecution, ExecutionStore};

/// Live events produced by the agent runner, mirrored into the execution
/// store. Keyed on the discriminator, never on field presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    SessionStarted {
        execution_id: String,
        claude_session_id: String,
    },
    Assistant {
        execution_id: String,
        message: Value,
    },
    ToolResult {
        execution_id: String,
        tool_name: Option<String>,
        content: Value,
    },
    Hook {
        execution_id: String,
        payload: Value,
    },
    McpToolCall {
        execution_id: String,
        server: String,
        tool: String,
        payload: Value,
    },
    SubagentStart {
        execution_id: String,
        name: String,
    },
    SubagentResult {
        execution_id: String,
        name: String,
        result: Value,
    },
    UserQuestion {
        execution_id: String,
        question: String,
    },
    TurnCompleted {
        execution_id: String,
        usage: TokenUsage,
    },
    Completed {
        execution_id: String,
        success: bool,
        output: Option<String>,
        usage: TokenUsage,
        cost_usd: Option<f64>,
    },
}

/// Thin coupling between the runner's event stream and the execution
/// store: subscribes and mirrors per-turn progress, nothing more.
pub struct SessionMonitor;

impl SessionMonitor {
    /// Consume runner events until the sender drops. Mirroring failures are
    /// logged and skipped; the stream must keep draining.
    pub fn attach(
        store: Arc<ExecutionStore>,
        mut events: UnboundedReceiver<RunnerEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(err) = Self::mirror(&store, event).await {
                    warn!("failed to mirror runner event: {}", err);
                }
            }
        })
    }

    async fn mirror(store: &ExecutionStore, event: RunnerEvent) -> lm_assist_types::Result<()> {
        match event {
            RunnerEvent::SessionStarted {
                execution_id,
                claude_session_id,
            } => {
                store.update_claude_session_id(&execution_id, &claude_session_id)?;
            }
            RunnerEvent::Assistant {
                execution_id,
                message,
            } => {
                store
                    .record_sdk_event(
                        Some(&execution_id),
                        "assistant",
                        serde_json::json!({ "message": message }),
                    )
                    .await?;
            }
            RunnerEvent::ToolResult {
                execution_id,
                tool_name,
                content,
            } => {
                store
                    .record_sdk_event(
                        Some(&execution_id),
                        "tool_result",
                        serde_json::json!({ "tool_name": tool_name, "content": content }),
                    )
                    .await?;
            }
            RunnerEvent::Hook {
                execution_id,
                payload,
            } => {
                store
                    .record_sdk_event(Some(&execution_id), "hook_event", payload)
                    .await?;
            }
            RunnerEvent::McpToolCall {
                execution_id,
                server,
                tool,
                payload,
            } => {
                store
                    .record_sdk_event(
                        Some(&execution_id),
                        "mcp_tool_call",
                        serde_json::json!({ "server": server, "tool_name": tool, "payload": payload }),
                    )
                    .await?;
            }
            RunnerEvent::SubagentStart { execution_id, name } => {
                store
                    .record_sdk_event(
                        Some(&execution_id),
                        "subagent_start",
                        serde_json::json!({ "subagent_name": name }),
                    )
                    .await?;
            }
            RunnerEvent::SubagentResult {
                execution_id,
                name,
                result,
            } => {
                store
                    .record_sdk_event(
                        Some(&execution_id),
                        "subagent_result",
                        serde_json::json!({ "subagent_name": name, "result": result }),
                    )
                    .await?;
            }
            RunnerEvent::UserQuestion {
                execution_id,
                question,
            } => {
                store
                    .record_sdk_event(
                        Some(&execution_id),
                        "user_question",
                        serde_json::json!({ "question": question }),
                    )
                    .await?;
            }
            RunnerEvent::TurnCompleted {
                execution_id,
                usage,
            } => {
                store
                    .record_sdk_event(
                        Some(&execution_id),
                        "turn_completed",
                        serde_json::to_value(usage)?,
                    )
                    .await?;
            }
            RunnerEvent::Completed {
                execution_id,
                success,
                output,
                usage,
                cost_usd,
            } => {
                store
                    .complete_execution(
                        &execution_id,
                        CompleteExecution {
                            status: if success {
                                ExecutionStatus::Completed
                            } else {
                                ExecutionStatus::Failed
                            },
                            output,
                            usage,
                            cost_usd,
                            files_changed: Vec::new(),
                            error: None,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
