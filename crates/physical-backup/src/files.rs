//! File consistency checks on a database directory.
//!
//! Each check lists the directory exactly once and answers every question
//! from that listing.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::core::TableDescriptor;
use crate::error::{BackupError, Result};

/// File names present in a directory at one point in time.
#[derive(Debug, Clone)]
pub struct DirectoryListing {
    dir: PathBuf,
    files: BTreeSet<String>,
}

impl DirectoryListing {
    pub fn read(dir: &Path) -> Result<Self> {
        let mut files = BTreeSet::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        debug!("{}: {} files listed", dir.display(), files.len());
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.files.contains(file_name)
    }

    /// Files whose extension matches `extension`, case-sensitively.
    pub fn with_extension(&self, extension: &str) -> Vec<PathBuf> {
        let suffix = format!(".{}", extension);
        self.files
            .iter()
            .filter(|name| name.ends_with(&suffix))
            .map(|name| self.dir.join(name))
            .collect()
    }
}

/// Confirm every required sidecar file of every table exists in `dir`.
pub fn validate_required_files<'a, I>(dir: &Path, tables: I) -> Result<usize>
where
    I: IntoIterator<Item = &'a TableDescriptor>,
{
    let listing = DirectoryListing::read(dir)?;
    let mut checked = 0;
    for table in tables {
        for (extension, file_name) in table.required_files()? {
            if !listing.contains(&file_name) {
                return Err(BackupError::file_not_found(&table.name, extension, dir));
            }
            checked += 1;
        }
    }
    info!("{}: {} required files present", dir.display(), checked);
    Ok(checked)
}

/// Fail if any transactional data file remains in `dir`.
///
/// Runs after the drop pass of an import: a leftover `.ibd` would make the
/// server refuse to create the table it belongs to.
pub fn ensure_no_stale_data_files(dir: &Path) -> Result<()> {
    let listing = DirectoryListing::read(dir)?;
    match listing.with_extension("ibd").into_iter().next() {
        Some(path) => Err(BackupError::StaleFile { path }),
        None => {
            debug!("{}: no stale data files", dir.display());
            Ok(())
        }
    }
}
