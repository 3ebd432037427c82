use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::schema::SessionLine;
use lm_assist_types::{Error, Result};

/// Root of the agent CLI's home directory (`CLAUDE_HOME` override first).
pub fn claude_home() -> PathBuf {
    if let Ok(home) = std::env::var("CLAUDE_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

pub fn default_projects_root() -> PathBuf {
    claude_home().join("projects")
}

/// Legacy encoding of a working directory into a project directory name:
/// lowercased, every `/` replaced by `-`. Lossy for paths containing `-`,
/// which is why the canonical path is always re-derived from the `cwd`
/// field inside session records.
pub fn encode_project_key(cwd: &str) -> String {
    cwd.to_lowercase().replace('/', "-")
}

/// Best-effort inverse of [`encode_project_key`], for display only.
pub fn decode_project_key(key: &str) -> String {
    key.replace('-', "/")
}

/// First-lines header of a session file. For subagent files the first
/// record's `sessionId` is the parent session id and `parentUuid` anchors
/// the file to a specific parent message; that first-line read is
/// authoritative for both.
#[derive(Debug, Default, Clone)]
pub struct SessionHeader {
    pub session_id: Option<String>,
    pub parent_uuid: Option<String>,
    pub cwd: Option<String>,
    pub timestamp: Option<String>,
    pub team_name: Option<String>,
    pub version: Option<String>,
}

/// Extract header fields by reading the first few lines only.
pub fn read_header(path: &Path) -> Result<SessionHeader> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut header = SessionHeader::default();
    let mut saw_record = false;

    for line in reader.lines().take(10) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<SessionLine>(&line) else {
            continue;
        };
        saw_record = true;

        if header.session_id.is_none() {
            header.session_id = record.session_id().map(|s| s.to_string());
        }
        if header.cwd.is_none() {
            header.cwd = record.cwd().map(|s| s.to_string());
        }
        if header.timestamp.is_none() {
            header.timestamp = record.timestamp().map(|s| s.to_string());
        }
        if header.team_name.is_none() {
            header.team_name = record.team_name().map(|s| s.to_string());
        }
        match &record {
            SessionLine::User(r) => {
                if header.parent_uuid.is_none() {
                    header.parent_uuid = r.parent_uuid.clone();
                }
                if header.version.is_none() {
                    header.version = r.version.clone();
                }
            }
            SessionLine::Assistant(r) => {
                if header.parent_uuid.is_none() {
                    header.parent_uuid = r.parent_uuid.clone();
                }
                if header.version.is_none() {
                    header.version = r.version.clone();
                }
            }
            SessionLine::System(r) => {
                if header.version.is_none() {
                    header.version = r.claude_code_version.clone();
                }
            }
            _ => {}
        }

        if header.session_id.is_some() && header.cwd.is_some() && header.parent_uuid.is_some() {
            break;
        }
    }

    if !saw_record {
        return Err(Error::Malformed(path.to_path_buf()));
    }
    Ok(header)
}

/// Candidate file names for a session id within one project directory:
/// the main session file, a direct agent file, or a nested subagent file.
fn candidate_paths(project_dir: &Path, session_id: &str) -> Vec<PathBuf> {
    vec![
        project_dir.join(format!("{}.jsonl", session_id)),
        project_dir.join(format!("agent-{}.jsonl", session_id)),
    ]
}

/// Map a session id (and optionally a working directory) to its file path.
///
/// With a cwd, only that project's directory is probed. Without one, every
/// project directory under the root is scanned, including nested
/// `{parentSessionId}/subagents/` locations.
pub fn resolve_session_file(
    projects_root: &Path,
    session_id: &str,
    cwd: Option<&str>,
) -> Result<PathBuf> {
    if let Some(cwd) = cwd {
        let project_dir = projects_root.join(encode_project_key(cwd));
        if let Some(path) = find_in_project(&project_dir, session_id) {
            return Ok(path);
        }
        return Err(Error::NotFound(session_id.to_string()));
    }

    for project_dir in list_project_dirs(projects_root)? {
        if let Some(path) = find_in_project(&project_dir, session_id) {
            return Ok(path);
        }
    }
    Err(Error::NotFound(session_id.to_string()))
}

fn find_in_project(project_dir: &Path, session_id: &str) -> Option<PathBuf> {
    for candidate in candidate_paths(project_dir, session_id) {
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    // Nested subagent files: {projectDir}/{parentSessionId}/subagents/agent-{id}.jsonl
    let nested_name = format!("agent-{}.jsonl", session_id);
    for entry in WalkDir::new(project_dir)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.is_file()
            && path.file_name().is_some_and(|n| n == nested_name.as_str())
            && path
                .parent()
                .and_then(|p| p.file_name())
                .is_some_and(|n| n == "subagents")
        {
            return Some(path.to_path_buf());
        }
    }
    None
}

/// All project directories under the projects root.
pub fn list_project_dirs(projects_root: &Path) -> Result<Vec<PathBuf>> {
    if !projects_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(projects_root)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Top-level session files of a project directory (agent files excluded).
pub fn session_files_in(project_dir: &Path) -> Result<Vec<PathBuf>> {
    if !project_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(project_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file()
            && path.extension().is_some_and(|e| e == "jsonl")
            && !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("agent-"))
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Subagent files belonging to one session: direct `agent-*.jsonl` files in
/// the project directory whose first record points at the session, plus
/// everything under `{projectDir}/{sessionId}/subagents/`.
pub fn agent_files_for(project_dir: &Path, session_id: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    if project_dir.is_dir() {
        for entry in std::fs::read_dir(project_dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_agent_file = path.is_file()
                && path.extension().is_some_and(|e| e == "jsonl")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("agent-"));
            if !is_agent_file {
                continue;
            }
            // Direct agent files are shared across sessions in the project
            // dir; the first-line sessionId decides ownership.
            if let Ok(header) = read_header(&path)
                && header.session_id.as_deref() == Some(session_id)
            {
                files.push(path);
            }
        }
    }

    let nested = project_dir.join(session_id).join("subagents");
    if nested.is_dir() {
        for entry in std::fs::read_dir(&nested)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "jsonl") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Re-derive the canonical project path for an encoded directory by reading
/// the `cwd` field out of any session header; falls back to decoding the
/// directory name.
pub fn project_path_for_dir(project_dir: &Path) -> String {
    if let Ok(files) = session_files_in(project_dir) {
        for file in files {
            if let Ok(header) = read_header(&file)
                && let Some(cwd) = header.cwd
            {
                return cwd;
            }
        }
    }
    let key = project_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    decode_project_key(key)
}
