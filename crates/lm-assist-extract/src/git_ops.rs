use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::shell::{peel_remote, split_segments};
use lm_assist_types::{GitOperation, GitOperationType, ToolUse};

/// Extract git/gh operations from a tool-use stream.
///
/// A command only counts as git when `git`/`gh` appears at the start of a
/// segment (the original start, or after `&&`/`||`/`;`, or inside an
/// ssh/docker payload unwrapped beforehand) — a filename merely containing
/// "git" never matches. Segments whose subcommand fits no known type are
/// dropped, not emitted as "other".
pub fn extract_git_operations(tool_uses: &[ToolUse]) -> Vec<GitOperation> {
    let mut ops = Vec::new();

    for tu in tool_uses {
        if tu.name != "Bash" {
            continue;
        }
        let Some(command) = tu.input.get("command").and_then(Value::as_str) else {
            continue;
        };

        let peeled = peel_remote(command);

        // Heredoc commit bodies contain newlines that segment splitting
        // would tear apart; lift the message out first.
        let heredoc_message = HEREDOC_MESSAGE_RE
            .captures(&peeled.command)
            .map(|caps| caps[1].trim().to_string());

        for segment in split_segments(&peeled.command) {
            let Some(rest) = git_invocation(segment) else {
                continue;
            };
            let Some(mut op) = classify(rest, tu.line_index, tu.turn_index) else {
                continue;
            };
            if op.operation == GitOperationType::Commit && op.commit_message.is_none() {
                op.commit_message = heredoc_message.clone();
            }
            op.remote_host = peeled.remote.clone();
            ops.push(op);
        }
    }

    ops
}

/// Return the text after the `git`/`gh` command word, or None when the
/// segment is not a git invocation.
fn git_invocation(segment: &str) -> Option<&str> {
    let trimmed = segment.trim_start();
    for prefix in ["git ", "gh "] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return Some(rest.trim_start());
        }
    }
    None
}

static HEREDOC_MESSAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)-m\s+"\$\(cat\s+<<-?\s*'?EOF'?\s*\n(.*?)\n\s*EOF\s*\n?\s*\)""#).unwrap()
});
static MSG_DOUBLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"-m\s+"((?:[^"\\]|\\.)*)""#).unwrap());
static MSG_SINGLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-m\s+'([^']*)'").unwrap());
static MSG_BARE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-m\s+([^\s'$\x22-][^\s]*)").unwrap());
static BRANCH_FLAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-[bB]\s+(\S+)").unwrap());
static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(https?://\S+|git@[\w.:-]+[:/]\S+)").unwrap());
static STASH_REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(stash@\{\d+\})").unwrap());
static COMMIT_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(HEAD(?:[~^]\d*)*|[0-9a-f]{7,40})\b").unwrap());
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d+)\b").unwrap());

fn classify(rest: &str, line_index: u64, turn_index: u32) -> Option<GitOperation> {
    let mut words = rest.split_whitespace();
    let sub = words.next()?;

    let mut op = GitOperation {
        operation: GitOperationType::Status,
        branch: None,
        commit_ref: None,
        commit_message: None,
        remote_name: None,
        repo_url: None,
        pr_number: None,
        issue_number: None,
        tag: None,
        stash_ref: None,
        remote_host: None,
        line_index,
        turn_index,
    };

    match sub {
        "clone" => {
            op.operation = GitOperationType::Clone;
            op.repo_url = URL_RE.captures(rest).map(|c| c[1].to_string());
        }
        "init" => op.operation = GitOperationType::Init,
        "status" => op.operation = GitOperationType::Status,
        "log" => op.operation = GitOperationType::Log,
        "diff" => op.operation = GitOperationType::Diff,
        "add" => op.operation = GitOperationType::Add,
        "commit" => {
            op.operation = GitOperationType::Commit;
            op.commit_message = extract_message(rest);
        }
        "push" | "pull" | "fetch" => {
            op.operation = match sub {
                "push" => GitOperationType::Push,
                "pull" => GitOperationType::Pull,
                _ => GitOperationType::Fetch,
            };
            let args: Vec<&str> = words.filter(|w| !w.starts_with('-')).collect();
            op.remote_name = args.first().map(|s| s.to_string());
            op.branch = args.get(1).map(|s| s.to_string());
        }
        "checkout" | "switch" => {
            op.operation = GitOperationType::Checkout;
            op.branch = BRANCH_FLAG_RE
                .captures(rest)
                .map(|c| c[1].to_string())
                .or_else(|| words.find(|w| !w.starts_with('-')).map(|s| s.to_string()));
        }
        "branch" => {
            op.operation = GitOperationType::Branch;
            op.branch = words.find(|w| !w.starts_with('-')).map(|s| s.to_string());
        }
        "merge" | "rebase" => {
            op.operation = if sub == "merge" {
                GitOperationType::Merge
            } else {
                GitOperationType::Rebase
            };
            op.branch = words.find(|w| !w.starts_with('-')).map(|s| s.to_string());
        }
        "reset" | "revert" | "cherry-pick" => {
            op.operation = if sub == "reset" {
                GitOperationType::Reset
            } else {
                GitOperationType::Revert
            };
            op.commit_ref = COMMIT_REF_RE.captures(rest).map(|c| c[1].to_string());
        }
        "stash" => {
            op.operation = GitOperationType::Stash;
            op.stash_ref = STASH_REF_RE.captures(rest).map(|c| c[1].to_string());
        }
        "tag" => {
            op.operation = GitOperationType::Tag;
            op.tag = rest
                .split_whitespace()
                .skip(1)
                .find(|w| !w.starts_with('-'))
                .map(|s| s.to_string());
        }
        "remote" => {
            op.operation = GitOperationType::Remote;
            let args: Vec<&str> = words.collect();
            if args.first() == Some(&"add") {
                op.remote_name = args.get(1).map(|s| s.to_string());
                op.repo_url = args.get(2).map(|s| s.to_string());
            }
        }
        // gh subcommands
        "pr" => {
            let action = words.next()?;
            op.operation = match action {
                "create" => GitOperationType::PrCreate,
                "merge" => GitOperationType::PrMerge,
                "view" => GitOperationType::PrView,
                _ => return None,
            };
            op.pr_number = NUMBER_RE
                .captures(rest)
                .and_then(|c| c[1].parse().ok());
        }
        "issue" => {
            let action = words.next()?;
            op.operation = match action {
                "create" => GitOperationType::IssueCreate,
                "view" => GitOperationType::IssueView,
                _ => return None,
            };
            op.issue_number = NUMBER_RE
                .captures(rest)
                .and_then(|c| c[1].parse().ok());
        }
        _ => return None,
    }

    Some(op)
}

fn extract_message(rest: &str) -> Option<String> {
    if let Some(caps) = MSG_DOUBLE_RE.captures(rest) {
        let raw = &caps[1];
        // A "$(cat <<EOF ...)" body is the heredoc form, resolved by the
        // caller against the unsplit command.
        if !raw.starts_with("$(") {
            return Some(raw.replace("\\\"", "\""));
        }
        return None;
    }
    if let Some(caps) = MSG_SINGLE_RE.captures(rest) {
        return Some(caps[1].to_string());
    }
    MSG_BARE_RE.captures(rest).map(|c| c[1].to_string())
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
    fn test_simple_commit_message() {
        let ops = extract_git_operations(&[bash(r#"git commit -m "fix: parser offset""#, 1)]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, GitOperationType::Commit);
        assert_eq!(ops[0].commit_message.as_deref(), Some("fix: parser offset"));
    }

    #[test]
    fn test_heredoc_commit_over_ssh() {
        let command = "ssh deploy@10.0.0.5 \"cd /srv/app && git commit -m \\\"$(cat <<'EOF'\nrelease: v1.2\n\n🤖 footer\nEOF\n)\\\"\"";
        let ops = extract_git_operations(&[bash(command, 2)]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, GitOperationType::Commit);
        assert_eq!(
            ops[0].commit_message.as_deref(),
            Some("release: v1.2\n\n🤖 footer")
        );
        assert_eq!(ops[0].remote_host.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_filename_containing_git_is_not_git() {
        let ops = extract_git_operations(&[bash("cat digit.txt && ./legit-tool run", 3)]);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_git_after_separator() {
        let ops = extract_git_operations(&[bash("cd /srv/app && git push origin main", 4)]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, GitOperationType::Push);
        assert_eq!(ops[0].remote_name.as_deref(), Some("origin"));
        assert_eq!(ops[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_checkout_new_branch() {
        let ops = extract_git_operations(&[bash("git checkout -b feature/delta-query", 5)]);
        assert_eq!(ops[0].operation, GitOperationType::Checkout);
        assert_eq!(ops[0].branch.as_deref(), Some("feature/delta-query"));
    }

    #[test]
    fn test_clone_url() {
        let ops =
            extract_git_operations(&[bash("git clone https://github.com/langmart/lm-assist", 6)]);
        assert_eq!(ops[0].operation, GitOperationType::Clone);
        assert_eq!(
            ops[0].repo_url.as_deref(),
            Some("https://github.com/langmart/lm-assist")
        );
    }

    #[test]
    fn test_unknown_subcommand_dropped() {
        let ops = extract_git_operations(&[bash("git bisect start", 7)]);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_gh_pr_merge_number() {
        let ops = extract_git_operations(&[bash("gh pr merge 482 --squash", 8)]);
        assert_eq!(ops[0].operation, GitOperationType::PrMerge);
        assert_eq!(ops[0].pr_number, Some(482));
    }

    #[test]
    fn test_stash_ref() {
        let ops = extract_git_operations(&[bash("git stash pop stash@{1}", 9)]);
        assert_eq!(ops[0].operation, GitOperationType::Stash);
        assert_eq!(ops[0].stash_ref.as_deref(), Some("stash@{1}"));
    }

    #[test]
    fn test_reset_commit_ref() {
        let ops = extract_git_operations(&[bash("git reset --hard 3fa9c1d2e", 10)]);
        assert_eq!(ops[0].operation, GitOperationType::Reset);
        assert_eq!(ops[0].commit_ref.as_deref(), Some("3fa9c1d2e"));
    }
}
