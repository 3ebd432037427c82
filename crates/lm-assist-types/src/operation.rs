use serde::{Deserialize, Serialize};

/// Category a file operation rolls up into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Read,
    Created,
    Updated,
    Deleted,
}

/// Concrete action recognized from a tool input or shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Read,
    Write,
    Edit,
    Delete,
    Create,
    Copy,
    Move,
    Download,
    Archive,
    Extract,
    Permission,
    Link,
}

impl FileAction {
    /// Total action → category mapping.
    pub fn category(&self) -> FileCategory {
        match self {
            FileAction::Read => FileCategory::Read,
            FileAction::Write
            | FileAction::Create
            | FileAction::Copy
            | FileAction::Download
            | FileAction::Archive
            | FileAction::Extract
            | FileAction::Link => FileCategory::Created,
            FileAction::Edit | FileAction::Move | FileAction::Permission => FileCategory::Updated,
            FileAction::Delete => FileCategory::Deleted,
        }
    }
}

/// A file touched by a tool use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperation {
    pub path: String,
    pub action: FileAction,
    pub category: FileCategory,
    /// Host (ssh) or container (docker) the command ran on, when peeled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    pub tool: String,
    pub line_index: u64,
    pub turn_index: u32,
}

/// Deduplicated per-path rollup: each path appears in exactly one list,
/// decided by its latest action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeSummary {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub read: Vec<String>,
}

impl FileChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.read.is_empty()
    }
}

/// Database client recognized in a shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbTool {
    Psql,
    Mysql,
    Sqlite,
    Prisma,
    Mongosh,
    Redis,
    PgDump,
    Mysqldump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbOperationType {
    Query,
    Migrate,
    Seed,
    Create,
    Drop,
    Connect,
    Backup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbOperation {
    pub tool: DbTool,
    pub operation: DbOperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    pub line_index: u64,
    pub turn_index: u32,
}

/// Git/gh operation type; commands that fit none of these are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitOperationType {
    Clone,
    Init,
    Status,
    Log,
    Diff,
    Add,
    Commit,
    Push,
    Pull,
    Fetch,
    Checkout,
    Branch,
    Merge,
    Rebase,
    Reset,
    Revert,
    Stash,
    Tag,
    Remote,
    PrCreate,
    PrMerge,
    PrView,
    IssueCreate,
    IssueView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitOperation {
    pub operation: GitOperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stash_ref: Option<String>,
    /// Host the command ran on when wrapped in ssh/docker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    pub line_index: u64,
    pub turn_index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_category_total() {
        // Every action maps; spot-check the boundaries.
        assert_eq!(FileAction::Read.category(), FileCategory::Read);
        assert_eq!(FileAction::Write.category(), FileCategory::Created);
        assert_eq!(FileAction::Edit.category(), FileCategory::Updated);
        assert_eq!(FileAction::Delete.category(), FileCategory::Deleted);
        assert_eq!(FileAction::Move.category(), FileCategory::Updated);
        assert_eq!(FileAction::Extract.category(), FileCategory::Created);
    }
}
