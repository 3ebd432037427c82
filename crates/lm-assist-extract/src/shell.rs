use once_cell::sync::Lazy;
use regex::Regex;

/// A shell command with any ssh/docker wrapper removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeledCommand {
    pub command: String,
    /// Host (ssh) or container (docker) the inner command runs on.
    pub remote: Option<String>,
}

static SSH_WRAPPER: Lazy<Regex> = Lazy::new(|| {
    // Flags with arguments (-p 22, -i key, -o opt) are consumed before the
    // host token; the rest of the line is the remote payload.
    // (?s): remote payloads may span lines (heredocs).
    Regex::new(
        r"(?s)^\s*ssh\s+(?:-[A-Za-z]\s+\S+\s+|-[A-Za-z]+\s+)*(?:([\w.-]+)@)?([\w.:-]+)\s+(.+)$",
    )
    .unwrap()
});

static DOCKER_EXEC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*docker\s+(?:compose\s+)?exec\s+(?:-[A-Za-z]+\s+|--\S+\s+)*(\S+)\s+(.+)$")
        .unwrap()
});

static SHELL_C: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*(?:sh|bash|zsh)\s+-l?c\s+(.+)$").unwrap());

/// Peel ssh/docker wrappers off a command, repeatedly, and return the inner
/// command plus the outermost remote identity. Regex matching downstream
/// always runs on the inner command.
pub fn peel_remote(command: &str) -> PeeledCommand {
    let mut current = command.trim().to_string();
    let mut remote: Option<String> = None;

    loop {
        if let Some(caps) = SSH_WRAPPER.captures(&current) {
            if remote.is_none() {
                remote = Some(caps[2].to_string());
            }
            current = unquote(&caps[3]);
            continue;
        }
        if let Some(caps) = DOCKER_EXEC.captures(&current) {
            if remote.is_none() {
                remote = Some(caps[1].to_string());
            }
            current = unquote(&caps[2]);
            continue;
        }
        if let Some(caps) = SHELL_C.captures(&current) {
            current = unquote(&caps[1]);
            continue;
        }
        break;
    }

    PeeledCommand {
        command: current,
        remote,
    }
}

/// Strip one level of surrounding quotes, undoing `\"` escapes for a
/// double-quoted payload.
pub fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        return s[1..s.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\");
    }
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        return s[1..s.len() - 1].to_string();
    }
    s.to_string()
}

/// Split a compound command on `&&`, `||` and `;` separators. Quoted
/// payloads have already been unwrapped by [`peel_remote`], and heredoc
/// bodies are handled before splitting by the extractors that care.
pub fn split_segments(command: &str) -> Vec<&str> {
    static SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"&&|\|\||;").unwrap());
    SEPARATOR
        .split(command)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}
