use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::shell::{peel_remote, split_segments};
use lm_assist_types::{DbOperation, DbOperationType, DbTool, ToolUse};

/// Extract database operations from a tool-use stream. Only `Bash` tool
/// uses are considered; ssh/docker wrappers are unwrapped first so the
/// detection runs on the inner command.
pub fn extract_db_operations(tool_uses: &[ToolUse]) -> Vec<DbOperation> {
    let mut ops = Vec::new();

    for tu in tool_uses {
        if tu.name != "Bash" {
            continue;
        }
        let Some(command) = tu.input.get("command").and_then(Value::as_str) else {
            continue;
        };

        let peeled = peel_remote(command);
        for segment in split_segments(&peeled.command) {
            let Some((tool, rest)) = detect_tool(segment) else {
                continue;
            };
            let sql = extract_sql(rest);
            let operation = classify(tool, rest, sql.as_deref());
            let (tables, columns) = sql
                .as_deref()
                .map(|s| (extract_tables(s), extract_columns(s)))
                .unwrap_or_default();

            ops.push(DbOperation {
                tool,
                operation,
                sql,
                tables,
                columns,
                remote: peeled.remote.clone(),
                line_index: tu.line_index,
                turn_index: tu.turn_index,
            });
        }
    }

    ops
}

/// Identify the DB client at the start of a segment, skipping env-var
/// prefixes (`PGPASSWORD=x psql …`).
fn detect_tool(segment: &str) -> Option<(DbTool, &str)> {
    static ENV_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:\w+=\S*\s+)*").unwrap());

    let stripped = ENV_PREFIX
        .find(segment.trim_start())
        .map(|m| &segment.trim_start()[m.end()..])
        .unwrap_or(segment);

    let word = stripped.split_whitespace().next()?;
    let tool = match word.rsplit('/').next().unwrap_or(word) {
        "psql" => DbTool::Psql,
        "mysql" => DbTool::Mysql,
        "sqlite3" | "sqlite" => DbTool::Sqlite,
        "prisma" | "npx" if stripped.contains("prisma") => DbTool::Prisma,
        "mongosh" | "mongo" => DbTool::Mongosh,
        "redis-cli" => DbTool::Redis,
        "pg_dump" => DbTool::PgDump,
        "mysqldump" => DbTool::Mysqldump,
        _ => return None,
    };
    Some((tool, stripped))
}

static SQL_FLAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)(?:-c|-e|--command|--execute)(?:=|\s+)("([^"\\]*(?:\\.[^"\\]*)*)"|'([^']*)'|(\S+))"#)
        .unwrap()
});
static HERESTRING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<<<\s*("([^"]*)"|'([^']*)')"#).unwrap());
static TRAILING_QUOTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)("([^"\\]*(?:\\.[^"\\]*)*)"|'([^']*)')\s*$"#).unwrap());
static SQL_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:select|insert|update|delete|create|alter|drop|pragma|with)\b").unwrap()
});

/// Lift the SQL string out of the client invocation.
fn extract_sql(rest: &str) -> Option<String> {
    if let Some(caps) = SQL_FLAG_RE.captures(rest) {
        let raw = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| m.as_str())?;
        return Some(raw.replace("\\\"", "\""));
    }
    if let Some(caps) = HERESTRING_RE.captures(rest) {
        return caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string());
    }
    // sqlite3-style trailing statement argument; only accepted when it
    // actually starts with a SQL keyword.
    if let Some(caps) = TRAILING_QUOTED_RE.captures(rest) {
        let raw = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().replace("\\\"", "\""))?;
        if SQL_KEYWORD_RE.is_match(&raw) {
            return Some(raw);
        }
    }
    None
}

static DDL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:create|alter|drop)\s+table\b").unwrap());
static CREATE_DB_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bcreate\s+database\b").unwrap());
static DROP_DB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bdrop\s+database\b").unwrap());

fn classify(tool: DbTool, rest: &str, sql: Option<&str>) -> DbOperationType {
    match tool {
        DbTool::PgDump | DbTool::Mysqldump => return DbOperationType::Backup,
        DbTool::Prisma => {
            if rest.contains("migrate") || rest.contains("db push") {
                return DbOperationType::Migrate;
            }
            if rest.contains("seed") {
                return DbOperationType::Seed;
            }
            if rest.contains("studio") {
                return DbOperationType::Connect;
            }
            return DbOperationType::Query;
        }
        _ => {}
    }

    if let Some(sql) = sql {
        // DDL on tables is always a migration, whatever else the statement
        // contains.
        if DDL_RE.is_match(sql) {
            return DbOperationType::Migrate;
        }
        if CREATE_DB_RE.is_match(sql) {
            return DbOperationType::Create;
        }
        if DROP_DB_RE.is_match(sql) {
            return DbOperationType::Drop;
        }
        return DbOperationType::Query;
    }

    let lower = rest.to_lowercase();
    if lower.contains("seed") {
        return DbOperationType::Seed;
    }
    if lower.contains("migrat") {
        return DbOperationType::Migrate;
    }
    if lower.contains("backup") || lower.contains("dump") {
        return DbOperationType::Backup;
    }
    // Executing a file still counts as a query; a bare client invocation is
    // an interactive connect.
    if lower.contains("-f ") || lower.contains("--file") {
        return DbOperationType::Query;
    }
    DbOperationType::Connect
}

static TABLE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\b(?:from|join)\s+([A-Za-z_][\w.]*)").unwrap(),
        Regex::new(r"(?i)\binto\s+([A-Za-z_][\w.]*)").unwrap(),
        Regex::new(r"(?i)\bupdate\s+([A-Za-z_][\w.]*)").unwrap(),
        Regex::new(
            r"(?i)\b(?:create|alter|drop)\s+table\s+(?:if\s+(?:not\s+)?exists\s+)?([A-Za-z_][\w.]*)",
        )
        .unwrap(),
        // information_schema style lookups
        Regex::new(r"(?i)table_name\s*=\s*'([^']+)'").unwrap(),
    ]
});

fn extract_tables(sql: &str) -> Vec<String> {
    let mut tables = Vec::new();
    for re in TABLE_RES.iter() {
        for caps in re.captures_iter(sql) {
            let name = caps[1].to_string();
            let lowered = name.to_lowercase();
            if lowered == "select" || lowered == "information_schema.tables" {
                continue;
            }
            if !tables.contains(&name) {
                tables.push(name);
            }
        }
    }
    tables
}

static SELECT_COLS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\bselect\s+(.*?)\s+from\b").unwrap());
static INSERT_COLS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\binsert\s+into\s+[\w.]+\s*\(([^)]*)\)").unwrap());
static SET_CLAUSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\bset\s+(.*?)(?:\bwhere\b|$)").unwrap());
static SET_COL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Za-z_]\w*)\s*=").unwrap());
static COLUMN_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)column_name\s*=\s*'([^']+)'").unwrap());

fn extract_columns(sql: &str) -> Vec<String> {
    let mut columns = Vec::new();
    let mut push = |name: &str| {
        let name = name.trim();
        if name.is_empty() || name == "*" {
            return;
        }
        // Skip function calls and expressions.
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return;
        }
        let owned = name.to_string();
        if !columns.contains(&owned) {
            columns.push(owned);
        }
    };

    if let Some(caps) = SELECT_COLS_RE.captures(sql) {
        for col in caps[1].split(',') {
            push(col);
        }
    }
    if let Some(caps) = INSERT_COLS_RE.captures(sql) {
        for col in caps[1].split(',') {
            push(col);
        }
    }
    if let Some(caps) = SET_CLAUSE_RE.captures(sql) {
        for col_caps in SET_COL_RE.captures_iter(&caps[1]) {
            push(&col_caps[1]);
        }
    }
    for caps in COLUMN_NAME_RE.captures_iter(sql) {
        push(&caps[1]);
    }

    columns
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
    fn test_psql_select_query() {
        let ops = extract_db_operations(&[bash(
            r#"psql -d app -c "SELECT id, email FROM users WHERE active = true""#,
            1,
        )]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].tool, DbTool::Psql);
        assert_eq!(ops[0].operation, DbOperationType::Query);
        assert_eq!(ops[0].tables, vec!["users"]);
        assert_eq!(ops[0].columns, vec!["id", "email"]);
    }

    #[test]
    fn test_ddl_forces_migrate() {
        let ops = extract_db_operations(&[bash(
            r#"psql -c "ALTER TABLE orders ADD COLUMN shipped_at timestamptz""#,
            2,
        )]);
        assert_eq!(ops[0].operation, DbOperationType::Migrate);
        assert_eq!(ops[0].tables, vec!["orders"]);
    }

    #[test]
    fn test_docker_wrapped_mysql() {
        let ops = extract_db_operations(&[bash(
            r#"docker exec db sh -c "mysql -e 'UPDATE users SET name =: no'""#,
            3,
        )]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].tool, DbTool::Mysql);
        assert_eq!(ops[0].remote.as_deref(), Some("db"));
    }

    #[test]
    fn test_update_set_columns() {
        let ops = extract_db_operations(&[bash(
            r#"mysql -e "UPDATE accounts SET balance = 0, frozen = 1 WHERE id = 7""#,
            4,
        )]);
        assert_eq!(ops[0].tables, vec!["accounts"]);
        assert_eq!(ops[0].columns, vec!["balance", "frozen"]);
    }

    #[test]
    fn test_information_schema_where_clause() {
        let ops = extract_db_operations(&[bash(
            r#"psql -c "SELECT column_name FROM information_schema.columns WHERE table_name = 'invoices'""#,
            5,
        )]);
        assert!(ops[0].tables.contains(&"invoices".to_string()));
    }

    #[test]
    fn test_pg_dump_is_backup() {
        let ops = extract_db_operations(&[bash("pg_dump -Fc app > backup.dump", 6)]);
        assert_eq!(ops[0].tool, DbTool::PgDump);
        assert_eq!(ops[0].operation, DbOperationType::Backup);
    }

    #[test]
    fn test_prisma_migrate() {
        let ops = extract_db_operations(&[bash("npx prisma migrate dev --name add-users", 7)]);
        assert_eq!(ops[0].tool, DbTool::Prisma);
        assert_eq!(ops[0].operation, DbOperationType::Migrate);
    }

    #[test]
    fn test_bare_client_is_connect() {
        let ops = extract_db_operations(&[bash("psql postgres://localhost/app", 8)]);
        assert_eq!(ops[0].operation, DbOperationType::Connect);
    }

    #[test]
    fn test_non_db_command_ignored() {
        let ops = extract_db_operations(&[bash("cargo build --release", 9)]);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_insert_columns() {
        let ops = extract_db_operations(&[bash(
            r#"sqlite3 app.db "INSERT INTO events (kind, payload, ts) VALUES ('a', 'b', 1)""#,
            10,
        )]);
        assert_eq!(ops[0].tables, vec!["events"]);
        assert_eq!(ops[0].columns, vec!["kind", "payload", "ts"]);
    }
}
