//! Configuration validation.

use std::collections::HashSet;

use super::{Config, DatabaseTarget};
use crate::core::identifier::validate_identifier;
use crate::error::{BackupError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.sources.is_empty() && config.target.is_none() {
        return Err(BackupError::Config(
            "at least one of sources or target is required".into(),
        ));
    }

    let mut seen = HashSet::new();
    for (i, source) in config.sources.iter().enumerate() {
        validate_database(source, &format!("sources[{}]", i))?;
        if !seen.insert((source.host.as_str(), source.port, source.database.as_str())) {
            return Err(BackupError::Config(format!(
                "sources[{}]: database {} is listed twice",
                i,
                source.label()
            )));
        }
    }

    if let Some(target) = &config.target {
        validate_database(target, "target")?;

        // Restoring over a database that is also being exported would drop it
        if config.sources.iter().any(|s| s.same_database(target)) {
            return Err(BackupError::Config(
                "target cannot be the same database as a source".into(),
            ));
        }
    }

    if config.tools.dump_binary.is_empty() {
        return Err(BackupError::Config("tools.dump_binary is required".into()));
    }
    if config.tools.index_checker_binary.is_empty() {
        return Err(BackupError::Config(
            "tools.index_checker_binary is required".into(),
        ));
    }
    if config.session.wait_timeout_secs == 0 {
        return Err(BackupError::Config(
            "session.wait_timeout_secs must be at least 1".into(),
        ));
    }
    if config.session.connect_timeout_secs == 0 {
        return Err(BackupError::Config(
            "session.connect_timeout_secs must be at least 1".into(),
        ));
    }
    if config.snapshot.confirm_timeout_secs == 0 {
        return Err(BackupError::Config(
            "snapshot.confirm_timeout_secs must be at least 1".into(),
        ));
    }
    if config.archive.compression_level > 9 {
        return Err(BackupError::Config(format!(
            "archive.compression_level must be between 0 and 9, got {}",
            config.archive.compression_level
        )));
    }

    Ok(())
}

fn validate_database(db: &DatabaseTarget, path: &str) -> Result<()> {
    if db.host.is_empty() {
        return Err(BackupError::Config(format!("{}.host is required", path)));
    }
    if db.database.is_empty() {
        return Err(BackupError::Config(format!("{}.database is required", path)));
    }
    if db.user.is_empty() {
        return Err(BackupError::Config(format!("{}.user is required", path)));
    }
    validate_identifier(&db.database)
        .map_err(|e| BackupError::Config(format!("{}.database: {}", path, e)))?;
    if db.database.contains('/') || db.database.contains("..") {
        return Err(BackupError::Config(format!(
            "{}.database must not contain path separators",
            path
        )));
    }
    Ok(())
}
