use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Deleted,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "deleted" => Some(TaskStatus::Deleted),
            _ => None,
        }
    }

    /// Terminal for dependency purposes: a blocker in one of these states
    /// no longer blocks.
    pub fn is_resolved(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Deleted)
    }
}

/// One task in a session's task table.
///
/// `TaskCreate` registers the task under a temporary id until the tool
/// result assigns the real numeric id; `TaskUpdate` mutates fields and
/// appends to the dependency lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub line_index: u64,
    pub turn_index: u32,
}

impl TaskRecord {
    /// Temporary id used between `TaskCreate` and its tool result.
    pub fn pending_id(tool_use_id: &str) -> String {
        format!("pending-{}", tool_use_id)
    }

    pub fn has_pending_id(&self) -> bool {
        self.id.starts_with("pending-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(TaskStatus::parse("pending"), Some(TaskStatus::Pending));
        assert_eq!(
            TaskStatus::parse("in_progress"),
            Some(TaskStatus::InProgress)
        );
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_resolved_statuses() {
        assert!(TaskStatus::Completed.is_resolved());
        assert!(TaskStatus::Deleted.is_resolved());
        assert!(!TaskStatus::InProgress.is_resolved());
    }
}
