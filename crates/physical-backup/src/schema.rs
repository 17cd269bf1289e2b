//! Schema capture, sanitization and replay.
//!
//! The structure dump is taken while the tables are locked so the DDL
//! matches the files being moved. Before replay two version-gated comments
//! are removed:
//!
//! - the sandbox-mode directive newer `mariadb-dump` writes on line one,
//!   which older servers reject
//! - `DEFINER=... SQL SECURITY DEFINER` comments, whose user may not exist
//!   on the target server

use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{DatabaseTarget, ToolsConfig};
use crate::error::{BackupError, Result};
use crate::lock::{LockCoordinator, LockState};
use crate::session::Session;

/// Produces structure-only DDL for a database.
#[async_trait]
pub trait SchemaDumper: Send + Sync {
    async fn dump_structure(&self, target: &DatabaseTarget) -> Result<String>;
}

/// `mariadb-dump --no-data`.
pub struct MariadbDump {
    binary: String,
    extra_args: Vec<String>,
}

impl MariadbDump {
    pub fn new(tools: &ToolsConfig) -> Self {
        Self {
            binary: tools.dump_binary.clone(),
            extra_args: tools.dump_extra_args.clone(),
        }
    }

    fn command(&self, target: &DatabaseTarget) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--no-data")
            .arg(format!("--host={}", target.host))
            .arg(format!("--port={}", target.port))
            .arg(format!("--user={}", target.user))
            .args(&self.extra_args)
            .arg(&target.database)
            // Keeps the password out of the process list
            .env("MYSQL_PWD", &target.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SchemaDumper for MariadbDump {
    async fn dump_structure(&self, target: &DatabaseTarget) -> Result<String> {
        debug!("Running {} for {}", self.binary, target.label());
        let output = self
            .command(target)
            .output()
            .await
            .map_err(|e| BackupError::SchemaExport {
                database: target.database.clone(),
                diagnostic: format!("could not run {}: {}", self.binary, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let diagnostic = if stderr.is_empty() {
                format!(
                    "{} exited with {}: {}",
                    self.binary,
                    output.status,
                    String::from_utf8_lossy(&output.stdout).trim()
                )
            } else {
                stderr
            };
            return Err(BackupError::SchemaExport {
                database: target.database.clone(),
                diagnostic,
            });
        }

        String::from_utf8(output.stdout).map_err(|e| BackupError::SchemaExport {
            database: target.database.clone(),
            diagnostic: format!("dump output is not valid UTF-8: {}", e),
        })
    }
}

/// Sanitized DDL consistent with the files captured alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSnapshot {
    pub database: String,
    pub sql: String,
    pub captured_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    /// Wrap previously captured DDL (from an archive or handoff record).
    pub fn from_captured(database: impl Into<String>, raw: &str) -> Self {
        Self {
            database: database.into(),
            sql: sanitize(raw),
            captured_at: Utc::now(),
        }
    }

    pub fn statements(&self) -> Vec<String> {
        split_statements(&self.sql)
    }
}

/// Runs the dump utility under a held lock.
pub struct SchemaExtractor<'a> {
    dumper: &'a dyn SchemaDumper,
}

impl<'a> SchemaExtractor<'a> {
    pub fn new(dumper: &'a dyn SchemaDumper) -> Self {
        Self { dumper }
    }

    /// Capture and sanitize the schema of a locked database.
    pub async fn capture(
        &self,
        target: &DatabaseTarget,
        locks: &LockCoordinator,
    ) -> Result<SchemaSnapshot> {
        if locks.state(&target.database) == LockState::Unlocked {
            return Err(BackupError::LockState(format!(
                "schema of {} must be captured while its tables are locked",
                target.database
            )));
        }

        let raw = self.dumper.dump_structure(target).await?;
        let snapshot = SchemaSnapshot {
            database: target.database.clone(),
            sql: sanitize(&raw),
            captured_at: Utc::now(),
        };
        info!(
            "{}: captured schema ({} bytes, {} statements)",
            target.database,
            snapshot.sql.len(),
            snapshot.statements().len()
        );
        Ok(snapshot)
    }
}

fn sandbox_directive() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"/\*M?!999999\\- enable the sandbox mode \*/").expect("valid regex")
    })
}

fn definer_comment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"/\*![0-9]* DEFINER=[^ ]* SQL SECURITY DEFINER \*/").expect("valid regex")
    })
}

/// Remove the sandbox-mode directive and `DEFINER`/`SQL SECURITY` comments.
///
/// Idempotent; all other text is left byte-for-byte intact.
pub fn sanitize(raw: &str) -> String {
    let without_sandbox = sandbox_directive().replace_all(raw, "");
    definer_comment()
        .replace_all(&without_sandbox, "")
        .into_owned()
}

/// Split DDL into individually executable statements.
///
/// A statement ends where a line ends with the current delimiter.
/// `DELIMITER` lines (used around trigger and routine bodies) switch the
/// delimiter and are not sent to the server. Blank and comment lines between
/// statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut delimiter = String::from(";");
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();

        if current.is_empty() {
            if trimmed.is_empty() || is_comment_line(trimmed) {
                continue;
            }
            if let Some(next) = delimiter_directive(trimmed) {
                delimiter = next.to_string();
                continue;
            }
        }

        current.push_str(line);
        current.push('\n');

        if !is_comment_line(trimmed) && trimmed.ends_with(delimiter.as_str()) {
            let body = current.trim_end();
            let body = &body[..body.len() - delimiter.len()];
            if is_executable(body) {
                statements.push(body.trim().to_string());
            }
            current.clear();
        }
    }

    if is_executable(&current) {
        statements.push(current.trim().to_string());
    }

    statements
}

fn delimiter_directive(line: &str) -> Option<&str> {
    let (keyword, rest) = line.split_once(char::is_whitespace)?;
    if keyword.eq_ignore_ascii_case("DELIMITER") && !rest.trim().is_empty() {
        Some(rest.trim())
    } else {
        None
    }
}

fn is_comment_line(line: &str) -> bool {
    line.starts_with("--") || line.starts_with('#')
}

fn is_executable(fragment: &str) -> bool {
    fragment
        .lines()
        .map(str::trim)
        .any(|line| !line.is_empty() && !is_comment_line(line))
}

/// Replay a snapshot statement by statement so a failure names its statement.
pub async fn apply_schema(session: &mut dyn Session, snapshot: &SchemaSnapshot) -> Result<usize> {
    let statements = snapshot.statements();
    for (i, statement) in statements.iter().enumerate() {
        debug!("{}: schema statement {}/{}", snapshot.database, i + 1, statements.len());
        session.execute(statement).await?;
    }
    info!(
        "{}: recreated schema ({} statements)",
        snapshot.database,
        statements.len()
    );
    Ok(statements.len())
}
