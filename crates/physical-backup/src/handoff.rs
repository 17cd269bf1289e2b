//! Handoff record passed from a live snapshot export to its import.
//!
//! The import runs later, often on another host, against files restored
//! from the volume snapshot. The record carries what it needs: per source
//! database the classified table lists and the schema captured under lock.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::core::{Engine, TableSet};
use crate::error::{BackupError, Result};
use crate::schema::SchemaSnapshot;

/// Record format version written by this build.
pub const HANDOFF_VERSION: u32 = 1;

/// What a snapshot import needs to know about one source database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffDatabase {
    pub transactional_tables: Vec<String>,
    pub flat_file_tables: Vec<String>,
    pub schema: String,
}

impl HandoffDatabase {
    pub fn tables(&self) -> TableSet {
        TableSet::from_lists(&self.transactional_tables, &self.flat_file_tables)
    }
}

/// Versioned, checksummed handoff record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub version: u32,

    /// Run that produced the record.
    pub run_id: String,

    pub created_at: DateTime<Utc>,

    /// SHA256 hash of the export configuration.
    pub config_hash: String,

    pub databases: BTreeMap<String, HandoffDatabase>,

    /// SHA-256 over the record serialized without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl HandoffRecord {
    pub fn new(run_id: impl Into<String>, config_hash: impl Into<String>) -> Self {
        Self {
            version: HANDOFF_VERSION,
            run_id: run_id.into(),
            created_at: Utc::now(),
            config_hash: config_hash.into(),
            databases: BTreeMap::new(),
            checksum: None,
        }
    }

    /// Add one exported database.
    pub fn insert(&mut self, tables: &TableSet, schema: &SchemaSnapshot) {
        self.databases.insert(
            schema.database.clone(),
            HandoffDatabase {
                transactional_tables: tables.names_of(Engine::Transactional),
                flat_file_tables: tables.names_of(Engine::FlatFile),
                schema: schema.sql.clone(),
            },
        );
    }

    /// Entry for a source database.
    pub fn database(&self, name: &str) -> Result<&HandoffDatabase> {
        self.databases.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.databases.keys().map(String::as_str).collect();
            BackupError::Handoff(format!(
                "database {} is not in the handoff record (contains: {})",
                name,
                known.join(", ")
            ))
        })
    }

    fn compute_checksum(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.checksum = None;
        let content = serde_json::to_string(&unsigned)?;
        Ok(hex::encode(Sha256::digest(content.as_bytes())))
    }

    /// Load and verify a record.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Handoff(format!("cannot read {}: {}", path.display(), e))
        })?;
        let record: Self = serde_json::from_str(&content)
            .map_err(|e| BackupError::Handoff(format!("{} is not a handoff record: {}", path.display(), e)))?;

        if record.version != HANDOFF_VERSION {
            return Err(BackupError::Handoff(format!(
                "{} has version {}, expected {}",
                path.display(),
                record.version,
                HANDOFF_VERSION
            )));
        }

        match &record.checksum {
            Some(stored) if *stored == record.compute_checksum()? => {}
            Some(_) => {
                return Err(BackupError::Handoff(format!(
                    "{} failed its integrity check: checksum mismatch",
                    path.display()
                )))
            }
            None => {
                return Err(BackupError::Handoff(format!(
                    "{} has no checksum",
                    path.display()
                )))
            }
        }

        info!(
            "Loaded handoff record {} from run {} ({} databases)",
            path.display(),
            record.run_id,
            record.databases.len()
        );
        Ok(record)
    }

    /// Save the record (atomic write with checksum).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.checksum = Some(self.compute_checksum()?);
        let content = serde_json::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        if let Err(e) = std::fs::rename(&temp_path, path) {
            warn!("Could not move handoff record into place: {}", e);
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }

        info!("Wrote handoff record {}", path.display());
        Ok(())
    }
}
