//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Databases to export. Archive export uses one, live snapshot export all.
    #[serde(default)]
    pub sources: Vec<DatabaseTarget>,

    /// Database to import into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DatabaseTarget>,

    /// External utilities.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Ownership applied to restored table files.
    #[serde(default)]
    pub files: FilesConfig,

    /// Session behaviour.
    #[serde(default)]
    pub session: SessionConfig,

    /// Live snapshot settings.
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Archive settings.
    #[serde(default)]
    pub archive: ArchiveConfig,
}

impl Config {
    /// Find a configured source database by name.
    pub fn source(&self, database: &str) -> Option<&DatabaseTarget> {
        self.sources.iter().find(|s| s.database == database)
    }
}

/// One database instance + schema, with the directory holding its files.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseTarget {
    /// Database host.
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database (schema) name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Server data directory (default: /var/lib/mysql).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl DatabaseTarget {
    /// Directory holding this database's table files.
    pub fn database_dir(&self) -> PathBuf {
        self.data_dir.join(&self.database)
    }

    /// Short label used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    /// True if both point at the same database on the same server.
    pub fn same_database(&self, other: &DatabaseTarget) -> bool {
        self.host == other.host && self.port == other.port && self.database == other.database
    }
}

impl fmt::Debug for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

/// External utilities invoked by the workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Structure dump utility (default: mariadb-dump).
    #[serde(default = "default_dump_binary")]
    pub dump_binary: String,

    /// Extra arguments passed to the dump utility.
    #[serde(default)]
    pub dump_extra_args: Vec<String>,

    /// Flat-file index checker (default: myisamchk).
    #[serde(default = "default_index_checker_binary")]
    pub index_checker_binary: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            dump_binary: default_dump_binary(),
            dump_extra_args: Vec::new(),
            index_checker_binary: default_index_checker_binary(),
        }
    }
}

/// OS identity the database server runs as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Owner for restored files. `None` leaves ownership untouched.
    #[serde(default = "default_owner")]
    pub owner_user: Option<String>,

    /// Group for restored files. Defaults to the owner's primary group.
    #[serde(default = "default_owner")]
    pub owner_group: Option<String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            owner_user: default_owner(),
            owner_group: default_owner(),
        }
    }
}

/// Session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Server-side idle timeout applied to every session, in seconds.
    /// Must outlast the longest file copy phase.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,

    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_wait_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Live snapshot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Upper bound on the wait for the operator's snapshot confirmation.
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,

    /// Where the handoff record is written.
    #[serde(default = "default_handoff_path")]
    pub handoff_path: PathBuf,
}

impl SnapshotConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_secs: default_confirm_timeout(),
            handoff_path: default_handoff_path(),
        }
    }
}

/// Archive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Gzip level, 0-9 (default: 1, favouring speed).
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
        }
    }
}

// Default value functions for serde
fn default_port() -> u16 {
    3306
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/mysql")
}

fn default_dump_binary() -> String {
    "mariadb-dump".to_string()
}

fn default_index_checker_binary() -> String {
    "myisamchk".to_string()
}

fn default_owner() -> Option<String> {
    Some("mysql".to_string())
}

fn default_wait_timeout() -> u64 {
    14_400
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_confirm_timeout() -> u64 {
    3_600
}

fn default_handoff_path() -> PathBuf {
    PathBuf::from("snapshot.json")
}

fn default_compression_level() -> u32 {
    1
}
