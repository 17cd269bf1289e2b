//! Copying table files into a database directory.
//!
//! Files placed in the data directory must be readable by the server
//! process: every placed file gets mode `0660` and, when configured, the
//! server's owner and group.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{chown, Gid, Group, Uid, User};
use tracing::{debug, info};

use crate::config::FilesConfig;
use crate::core::TableDescriptor;
use crate::error::{BackupError, Result};

/// Permission bits for table files.
pub const TABLE_FILE_MODE: u32 = 0o660;

/// Resolved OS identity for placed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOwner {
    pub uid: Uid,
    pub gid: Gid,
}

impl FileOwner {
    /// Look up `user` and optionally `group`; the group defaults to the
    /// user's primary group.
    pub fn resolve(user: &str, group: Option<&str>) -> Result<Self> {
        let account = User::from_name(user)
            .map_err(|e| BackupError::Config(format!("cannot look up user {}: {}", user, e)))?
            .ok_or_else(|| BackupError::Config(format!("user {} does not exist", user)))?;
        let gid = match group {
            Some(name) => {
                Group::from_name(name)
                    .map_err(|e| {
                        BackupError::Config(format!("cannot look up group {}: {}", name, e))
                    })?
                    .ok_or_else(|| BackupError::Config(format!("group {} does not exist", name)))?
                    .gid
            }
            None => account.gid,
        };
        Ok(Self {
            uid: account.uid,
            gid,
        })
    }
}

/// Places table files and normalizes their ownership.
#[derive(Debug, Clone, Default)]
pub struct FileTransferEngine {
    owner: Option<FileOwner>,
}

impl FileTransferEngine {
    /// Resolve the configured owner up front so a bad name fails the run
    /// before anything is modified.
    pub fn new(files: &FilesConfig) -> Result<Self> {
        let owner = match files.owner_user.as_deref() {
            Some(user) => Some(FileOwner::resolve(user, files.owner_group.as_deref())?),
            None => None,
        };
        Ok(Self { owner })
    }

    pub fn with_owner(owner: Option<FileOwner>) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> Option<FileOwner> {
        self.owner
    }

    /// Copy every required file of `tables` from `source_dir` to `dest_dir`,
    /// then normalize the copies.
    pub async fn copy_tables(
        &self,
        source_dir: &Path,
        dest_dir: &Path,
        tables: &[&TableDescriptor],
    ) -> Result<Vec<PathBuf>> {
        // Check everything first so a missing file fails before any copy
        let mut plan = Vec::new();
        for table in tables {
            for (extension, file_name) in table.required_files()? {
                let source = source_dir.join(&file_name);
                if !tokio::fs::try_exists(&source).await? {
                    return Err(BackupError::file_not_found(&table.name, extension, source_dir));
                }
                plan.push((source, dest_dir.join(&file_name)));
            }
        }

        let mut copied = Vec::with_capacity(plan.len());
        for (source, dest) in plan {
            let bytes = tokio::fs::copy(&source, &dest).await?;
            debug!("Copied {} -> {} ({} bytes)", source.display(), dest.display(), bytes);
            copied.push(dest);
        }

        self.normalize(&copied).await?;
        info!(
            "Copied {} files from {} to {}",
            copied.len(),
            source_dir.display(),
            dest_dir.display()
        );
        Ok(copied)
    }

    /// Apply the table file mode and owner to each file.
    pub async fn normalize(&self, files: &[PathBuf]) -> Result<()> {
        for file in files {
            tokio::fs::set_permissions(file, std::fs::Permissions::from_mode(TABLE_FILE_MODE))
                .await?;
            if let Some(owner) = self.owner {
                chown(file.as_path(), Some(owner.uid), Some(owner.gid))
                    .map_err(std::io::Error::from)?;
            }
        }
        debug!("Normalized {} files", files.len());
        Ok(())
    }
}
