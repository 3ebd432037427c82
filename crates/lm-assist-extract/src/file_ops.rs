use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::shell::{peel_remote, split_segments, unquote};
use lm_assist_types::{FileAction, FileChangeSummary, FileOperation, ToolUse};

/// Extract structured file operations from a tool-use stream.
///
/// Pure over its input: no I/O, no cache dependency. Read operations are
/// included; callers that default to change-only views filter them out.
pub fn extract_file_operations(tool_uses: &[ToolUse]) -> Vec<FileOperation> {
    let mut ops = Vec::new();

    for tu in tool_uses {
        match tu.name.as_str() {
            "Read" => push_direct(&mut ops, tu, "file_path", FileAction::Read),
            "Write" => push_direct(&mut ops, tu, "file_path", FileAction::Write),
            "Edit" => push_direct(&mut ops, tu, "file_path", FileAction::Edit),
            "NotebookEdit" => push_direct(&mut ops, tu, "notebook_path", FileAction::Edit),
            "Glob" | "Grep" => push_direct(&mut ops, tu, "path", FileAction::Read),
            "Bash" => {
                if let Some(command) = tu.input.get("command").and_then(Value::as_str) {
                    let peeled = peel_remote(command);
                    for (action, path) in extract_from_command(&peeled.command) {
                        ops.push(FileOperation {
                            path,
                            action,
                            category: action.category(),
                            remote: peeled.remote.clone(),
                            tool: tu.name.clone(),
                            line_index: tu.line_index,
                            turn_index: tu.turn_index,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    ops
}

fn push_direct(ops: &mut Vec<FileOperation>, tu: &ToolUse, field: &str, action: FileAction) {
    if let Some(path) = tu.input.get(field).and_then(Value::as_str) {
        ops.push(FileOperation {
            path: path.to_string(),
            action,
            category: action.category(),
            remote: None,
            tool: tu.name.clone(),
            line_index: tu.line_index,
            turn_index: tu.turn_index,
        });
    }
}

/// Deduplicate by path: the latest action (highest line index) decides which
/// of the four disjoint lists a path lands in.
pub fn summarize_file_changes(ops: &[FileOperation]) -> FileChangeSummary {
    let mut latest: Vec<&FileOperation> = Vec::new();
    for op in ops {
        match latest.iter_mut().find(|o| o.path == op.path) {
            Some(slot) => {
                if op.line_index >= slot.line_index {
                    *slot = op;
                }
            }
            None => latest.push(op),
        }
    }

    let mut summary = FileChangeSummary::default();
    for op in latest {
        let bucket = match op.category {
            lm_assist_types::FileCategory::Created => &mut summary.created,
            lm_assist_types::FileCategory::Updated => &mut summary.updated,
            lm_assist_types::FileCategory::Deleted => &mut summary.deleted,
            lm_assist_types::FileCategory::Read => &mut summary.read,
        };
        bucket.push(op.path.clone());
    }
    summary
}

static RM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:sudo\s+)?rm\s+(.+)$").unwrap());
static TOUCH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:sudo\s+)?touch\s+(.+)$").unwrap());
static MKDIR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:sudo\s+)?mkdir\s+(.+)$").unwrap());
static CP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:sudo\s+)?cp\s+(.+)$").unwrap());
static MV_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:sudo\s+)?mv\s+(.+)$").unwrap());
static CURL_OUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^curl\s.*(?:-o|--output)\s+(\S+)").unwrap());
static WGET_OUT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^wget\s.*-O\s+(\S+)").unwrap());
static TAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^tar\s+(-?[A-Za-z]*f[A-Za-z]*)\s+(\S+)").unwrap());
static UNZIP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^unzip\s+(?:-\S+\s+)*(\S+)").unwrap());
static GZIP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(gzip|gunzip)\s+(?:-\S+\s+)*(\S+)").unwrap());
static CHMOD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:sudo\s+)?(?:chmod|chown)\s+(?:-\S+\s+)*\S+\s+(.+)$").unwrap());
static LN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ln\s+(?:-\S+\s+)*\S+\s+(\S+)").unwrap());
static SED_INPLACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^sed\s+-i(?:\.\w+)?\s+(.+)$").unwrap());
static TEE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\btee\s+(?:-a\s+)*(\S+)").unwrap());
// The leading [^0-9>] class keeps stderr redirects (2>) and the second
// half of >> from matching as a fresh redirect; the regex crate has no
// lookbehind, so the excluded character is matched explicitly.
static REDIRECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^0-9>])(>>?)\s*([^\s;|&<>]+)").unwrap());

fn extract_from_command(command: &str) -> Vec<(FileAction, String)> {
    let mut out = Vec::new();

    for segment in split_segments(command) {
        if let Some(caps) = RM_RE.captures(segment) {
            push_args(&mut out, &caps[1], FileAction::Delete);
        } else if let Some(caps) = TOUCH_RE.captures(segment) {
            push_args(&mut out, &caps[1], FileAction::Create);
        } else if let Some(caps) = MKDIR_RE.captures(segment) {
            push_args(&mut out, &caps[1], FileAction::Create);
        } else if let Some(caps) = CP_RE.captures(segment) {
            // Destination only.
            push_last_arg(&mut out, &caps[1], FileAction::Copy);
        } else if let Some(caps) = MV_RE.captures(segment) {
            push_last_arg(&mut out, &caps[1], FileAction::Move);
        } else if let Some(caps) = CURL_OUT_RE.captures(segment) {
            push_candidate(&mut out, &caps[1], FileAction::Download);
        } else if let Some(caps) = WGET_OUT_RE.captures(segment) {
            push_candidate(&mut out, &caps[1], FileAction::Download);
        } else if let Some(caps) = TAR_RE.captures(segment) {
            let flags = &caps[1];
            let action = if flags.contains('x') {
                FileAction::Extract
            } else {
                FileAction::Archive
            };
            push_candidate(&mut out, &caps[2], action);
        } else if let Some(caps) = UNZIP_RE.captures(segment) {
            push_candidate(&mut out, &caps[1], FileAction::Extract);
        } else if let Some(caps) = GZIP_RE.captures(segment) {
            let action = if &caps[1] == "gunzip" {
                FileAction::Extract
            } else {
                FileAction::Archive
            };
            push_candidate(&mut out, &caps[2], action);
        } else if let Some(caps) = CHMOD_RE.captures(segment) {
            push_args(&mut out, &caps[1], FileAction::Permission);
        } else if let Some(caps) = LN_RE.captures(segment) {
            push_candidate(&mut out, &caps[1], FileAction::Link);
        } else if let Some(caps) = SED_INPLACE_RE.captures(segment) {
            push_last_arg(&mut out, &caps[1], FileAction::Edit);
        }

        if let Some(caps) = TEE_RE.captures(segment) {
            push_candidate(&mut out, &caps[1], FileAction::Write);
        }
        for caps in REDIRECT_RE.captures_iter(segment) {
            let action = if &caps[1] == ">>" {
                FileAction::Edit
            } else {
                FileAction::Write
            };
            push_candidate(&mut out, &caps[2], action);
        }
    }

    out
}

fn push_args(out: &mut Vec<(FileAction, String)>, args: &str, action: FileAction) {
    for token in args.split_whitespace() {
        push_candidate(out, token, action);
    }
}

fn push_last_arg(out: &mut Vec<(FileAction, String)>, args: &str, action: FileAction) {
    if let Some(last) = args
        .split_whitespace()
        .filter(|t| !t.starts_with('-') && is_path_candidate(t))
        .next_back()
    {
        push_candidate(out, last, action);
    }
}

fn push_candidate(out: &mut Vec<(FileAction, String)>, token: &str, action: FileAction) {
    if is_path_candidate(token) {
        out.push((action, unquote(token)));
    }
}

/// Rejection filters. False positives from regex-over-shell are worse than
/// misses, so anything that smells like a variable, substitution, device,
/// markup fragment, glob, or sed script is dropped.
fn is_path_candidate(token: &str) -> bool {
    let t = token.trim_matches(|c| c == '"' || c == '\'');
    if t.is_empty() || t.starts_with('-') {
        return false;
    }
    if t.starts_with('$') || t.contains("$(") || t.contains("${") || t.starts_with("<(") {
        return false;
    }
    if t == "/dev/null" || t.starts_with("/dev/") {
        return false;
    }
    if t.contains('<') || t.contains('>') {
        return false;
    }
    if t.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    if t.contains(['*', '?', '[', ']', '{', '}', '\\', '`']) {
        return false;
    }
    if t.ends_with("/g") || t.ends_with("/i") || t.ends_with("/gi") {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bash(command: &str, line_index: u64) -> ToolUse {
        ToolUse {
            id: format!("tu_{}", line_index),
            name: "Bash".to_string(),
            input: json!({ "command": command }),
            line_index,
            turn_index: 1,
        }
    }

    #[test]
    fn test_direct_tools() {
        let uses = vec![
            ToolUse {
                id: "tu_1".into(),
                name: "Read".into(),
                input: json!({"file_path": "/srv/app/main.rs"}),
                line_index: 1,
                turn_index: 1,
            },
            ToolUse {
                id: "tu_2".into(),
                name: "Write".into(),
                input: json!({"file_path": "/srv/app/out.rs", "content": "x"}),
                line_index: 2,
                turn_index: 1,
            },
        ];
        let ops = extract_file_operations(&uses);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].action, FileAction::Read);
        assert_eq!(ops[1].action, FileAction::Write);
        assert_eq!(ops[1].path, "/srv/app/out.rs");
    }

    #[test]
    fn test_bash_rm_and_touch() {
        let ops = extract_file_operations(&[bash("rm -f /tmp/a.log && touch /tmp/b.log", 3)]);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].action, FileAction::Delete);
        assert_eq!(ops[0].path, "/tmp/a.log");
        assert_eq!(ops[1].action, FileAction::Create);
        assert_eq!(ops[1].path, "/tmp/b.log");
    }

    #[test]
    fn test_cp_destination_only() {
        let ops = extract_file_operations(&[bash("cp src/config.toml deploy/config.toml", 4)]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, FileAction::Copy);
        assert_eq!(ops[0].path, "deploy/config.toml");
    }

    #[test]
    fn test_stderr_redirect_excluded() {
        let ops = extract_file_operations(&[bash("make build 2>/dev/null", 5)]);
        assert!(ops.is_empty());

        let ops = extract_file_operations(&[bash("make build 2>errors.log", 6)]);
        assert!(ops.is_empty());

        let ops = extract_file_operations(&[bash("echo hi > greeting.txt", 7)]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, FileAction::Write);
        assert_eq!(ops[0].path, "greeting.txt");
    }

    #[test]
    fn test_append_redirect_is_edit() {
        let ops = extract_file_operations(&[bash("echo done >> build.log", 8)]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, FileAction::Edit);
    }

    #[test]
    fn test_rejection_filters() {
        // Variables, substitutions, devices, globs, numerics, sed flags.
        let ops = extract_file_operations(&[bash(
            "rm -f $TMPDIR $(mktemp) /dev/null *.bak 123 s/foo/bar/g",
            9,
        )]);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_sed_inplace_edits_file() {
        let ops =
            extract_file_operations(&[bash("sed -i 's/old/new/g' src/main.rs", 10)]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, FileAction::Edit);
        assert_eq!(ops[0].path, "src/main.rs");
    }

    #[test]
    fn test_remote_host_carried() {
        let ops = extract_file_operations(&[bash(
            r#"ssh deploy@10.0.0.5 "rm -rf /srv/app/releases/old""#,
            11,
        )]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].remote.as_deref(), Some("10.0.0.5"));
        assert_eq!(ops[0].path, "/srv/app/releases/old");
    }

    #[test]
    fn test_tar_archive_vs_extract() {
        let ops = extract_file_operations(&[
            bash("tar -czf backup.tgz data/", 12),
            bash("tar -xzf release.tgz", 13),
        ]);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].action, FileAction::Archive);
        assert_eq!(ops[0].path, "backup.tgz");
        assert_eq!(ops[1].action, FileAction::Extract);
        assert_eq!(ops[1].path, "release.tgz");
    }

    #[test]
    fn test_summary_disjoint_latest_wins() {
        let uses = vec![
            bash("touch notes.txt", 1),
            bash("echo x > notes.txt", 2),
            bash("rm notes.txt", 3),
            bash("cat report.md > summary.md", 4),
        ];
        let ops = extract_file_operations(&uses);
        let summary = summarize_file_changes(&ops);

        assert_eq!(summary.deleted, vec!["notes.txt"]);
        assert_eq!(summary.created, vec!["summary.md"]);
        assert!(summary.updated.is_empty());

        // Disjointness: no path appears twice across the four lists.
        let mut all: Vec<&String> = summary
            .created
            .iter()
            .chain(&summary.updated)
            .chain(&summary.deleted)
            .chain(&summary.read)
            .collect();
        let before = all.len();
        all.sort();
        all.dedup();
        assert_eq!(before, all.len());
    }
}
