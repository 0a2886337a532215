//! Checkpoint management for resuming replication.
//!
//! This module persists the last binlog position handed to the consumer so
//! that replication can resume from the same place after a restart or
//! failure.
//!
//! # Example
//!
//! ```rust,no_run
//! use binlog_capture::checkpoint::{Checkpoint, CheckpointManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = CheckpointManager::new("checkpoint.json");
//!
//!     // Load existing checkpoint
//!     if let Some(checkpoint) = manager.load().await? {
//!         println!("Resuming from {}:{}", checkpoint.file, checkpoint.position);
//!     }
//!
//!     // Save new checkpoint
//!     let checkpoint = Checkpoint::new("mysql-bin.000003".to_string(), 1547, 100);
//!     manager.save(&checkpoint).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::driver::BinlogPosition;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// A position in the binlog stream that replication can resume from.
///
/// The position is the byte offset right after the last event the consumer
/// received, so resuming there neither skips nor repeats an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Binary log file name
    pub file: String,
    /// Offset of the next event to read in `file`
    pub position: u64,
    /// The timestamp when this checkpoint was created
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Number of events received since startup
    pub event_count: u64,
}

/// Manages checkpoint persistence to disk.
///
/// The `CheckpointManager` handles atomic writes to ensure that checkpoints
/// are never corrupted, even if the process crashes during a write operation.
///
/// # Example
///
/// ```rust,no_run
/// use binlog_capture::checkpoint::CheckpointManager;
/// use std::path::PathBuf;
///
/// let manager = CheckpointManager::new(PathBuf::from("/var/lib/binlog-capture/checkpoint.json"));
/// ```
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    /// Creates a new checkpoint manager with the specified file path.
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Loads checkpoint from disk if it exists.
    ///
    /// Returns `None` if the checkpoint file doesn't exist, which typically
    /// means this is the first run or the checkpoint was deleted.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - The file exists but cannot be read
    /// - The file does not hold a valid checkpoint
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        if !fs::try_exists(&self.file_path).await? {
            debug!("No checkpoint file found at {:?}", self.file_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path).await.map_err(|e| {
            error!("Failed to read checkpoint file: {}", e);
            e
        })?;

        let checkpoint = serde_json::from_str::<Checkpoint>(&content).map_err(|e| {
            error!("Failed to parse checkpoint file: {}", e);
            e
        })?;

        info!(
            "Loaded checkpoint: {}:{}, timestamp={}",
            checkpoint.file, checkpoint.position, checkpoint.timestamp
        );
        Ok(Some(checkpoint))
    }

    /// Saves checkpoint to disk atomically.
    ///
    /// The checkpoint is written to a temporary file, synced and then renamed
    /// over the final location, so the file is never partially written.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!(
            "Saving checkpoint: {}:{}",
            checkpoint.file, checkpoint.position
        );

        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;

        debug!("Checkpoint saved successfully");
        Ok(())
    }

    /// Deletes the checkpoint file if it exists.
    ///
    /// This is useful for resetting replication to the configured start.
    pub async fn delete(&self) -> Result<()> {
        if fs::try_exists(&self.file_path).await? {
            fs::remove_file(&self.file_path).await?;
            info!("Deleted checkpoint file");
        }
        Ok(())
    }
}

impl Checkpoint {
    /// Creates a new checkpoint with the current timestamp.
    ///
    /// # Arguments
    ///
    /// * `file` - Binary log file name (e.g., "mysql-bin.000003")
    /// * `position` - Offset of the next event in that file
    /// * `event_count` - Total number of events received since startup
    ///
    /// # Example
    ///
    /// ```rust
    /// use binlog_capture::checkpoint::Checkpoint;
    ///
    /// let checkpoint = Checkpoint::new("mysql-bin.000003".to_string(), 1547, 100);
    /// assert_eq!(checkpoint.position, 1547);
    /// assert_eq!(checkpoint.event_count, 100);
    /// ```
    pub fn new(file: String, position: u64, event_count: u64) -> Self {
        Self {
            file,
            position,
            timestamp: chrono::Utc::now(),
            event_count,
        }
    }

    pub fn from_position(position: &BinlogPosition, event_count: u64) -> Self {
        Self::new(position.file.clone(), position.position, event_count)
    }

    pub fn binlog_position(&self) -> BinlogPosition {
        BinlogPosition::new(self.file.clone(), self.position)
    }
}
