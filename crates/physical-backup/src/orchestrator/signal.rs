//! Operator confirmation that the volume snapshot has been taken.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::error::{BackupError, Result};

/// Resolves once the operator confirms the snapshot.
///
/// The orchestrator bounds the wait with a timeout and a cancellation token;
/// implementations only wait.
#[async_trait]
pub trait SnapshotSignal: Send {
    async fn wait_for_confirmation(&mut self) -> Result<()>;

    /// Instruction shown to the operator.
    fn describe(&self) -> String;
}

/// Confirmation by pressing Enter on standard input.
#[derive(Debug, Default)]
pub struct StdinConfirmation;

#[async_trait]
impl SnapshotSignal for StdinConfirmation {
    async fn wait_for_confirmation(&mut self) -> Result<()> {
        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await?;
        if read == 0 {
            // EOF: nobody is there to confirm
            return Err(BackupError::Cancelled);
        }
        info!("Snapshot confirmed on stdin");
        Ok(())
    }

    fn describe(&self) -> String {
        "press Enter once the snapshot has been taken".to_string()
    }
}

/// Confirmation by creating a marker file.
#[derive(Debug, Clone)]
pub struct MarkerFileConfirmation {
    path: PathBuf,
    poll_interval: Duration,
}

impl MarkerFileConfirmation {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl SnapshotSignal for MarkerFileConfirmation {
    async fn wait_for_confirmation(&mut self) -> Result<()> {
        loop {
            if tokio::fs::try_exists(&self.path).await? {
                info!("Snapshot confirmed by marker file {}", self.path.display());
                return Ok(());
            }
            debug!("Waiting for marker file {}", self.path.display());
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn describe(&self) -> String {
        format!(
            "create {} once the snapshot has been taken",
            self.path.display()
        )
    }
}
