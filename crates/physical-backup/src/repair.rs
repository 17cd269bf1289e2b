//! Flat-file index repair before a snapshot import.
//!
//! Files copied from a volume snapshot of a running server can carry index
//! state the checker flags as unclean. Every index file is checked; a failed
//! check gets exactly one recovery attempt.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ToolsConfig;
use crate::error::{BackupError, Result};
use crate::files::DirectoryListing;

/// Exit status and combined output of one checker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

/// Checks and recovers flat-file index files.
#[async_trait]
pub trait IndexChecker: Send + Sync {
    async fn check(&self, index_file: &Path) -> Result<ToolOutput>;
    async fn recover(&self, index_file: &Path) -> Result<ToolOutput>;
}

/// `myisamchk`.
pub struct Myisamchk {
    binary: String,
}

impl Myisamchk {
    pub fn new(tools: &ToolsConfig) -> Self {
        Self {
            binary: tools.index_checker_binary.clone(),
        }
    }

    async fn run(&self, args: &[&str], index_file: &Path) -> Result<ToolOutput> {
        let output = Command::new(&self.binary)
            .args(args)
            .arg(index_file)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackupError::RepairFailure {
                file: index_file.to_path_buf(),
                diagnostic: format!("could not run {}: {}", self.binary, e),
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ToolOutput {
            success: output.status.success(),
            output: text.trim().to_string(),
        })
    }
}

#[async_trait]
impl IndexChecker for Myisamchk {
    async fn check(&self, index_file: &Path) -> Result<ToolOutput> {
        self.run(&[], index_file).await
    }

    async fn recover(&self, index_file: &Path) -> Result<ToolOutput> {
        self.run(&["--recover"], index_file).await
    }
}

/// What happened to one index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    Clean,
    Recovered,
}

/// Index files checked in one directory.
#[derive(Debug, Default)]
pub struct RepairReport {
    pub checked: usize,
    pub recovered: Vec<PathBuf>,
}

pub struct IndexRepairController<'a> {
    checker: &'a dyn IndexChecker,
}

impl<'a> IndexRepairController<'a> {
    pub fn new(checker: &'a dyn IndexChecker) -> Self {
        Self { checker }
    }

    /// Check (and if needed recover) every `.MYI` file in `dir`.
    pub async fn repair_directory(&self, dir: &Path) -> Result<RepairReport> {
        let listing = DirectoryListing::read(dir)?;
        let mut report = RepairReport::default();
        for index_file in listing.with_extension("MYI") {
            report.checked += 1;
            if self.repair_file(&index_file).await? == RepairOutcome::Recovered {
                report.recovered.push(index_file);
            }
        }
        info!(
            "{}: {} index files checked, {} recovered",
            dir.display(),
            report.checked,
            report.recovered.len()
        );
        Ok(report)
    }

    pub async fn repair_file(&self, index_file: &Path) -> Result<RepairOutcome> {
        let check = self.checker.check(index_file).await?;
        if check.success {
            return Ok(RepairOutcome::Clean);
        }

        warn!(
            "Index check failed for {}, attempting recovery: {}",
            index_file.display(),
            check.output
        );
        let recovery = self.checker.recover(index_file).await?;
        if recovery.success {
            info!("Recovered {}", index_file.display());
            Ok(RepairOutcome::Recovered)
        } else {
            Err(BackupError::RepairFailure {
                file: index_file.to_path_buf(),
                diagnostic: recovery.output,
            })
        }
    }
}
