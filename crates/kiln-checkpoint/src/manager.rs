//! Backup manager for rolling training snapshots.
//!
//! This module provides `BackupManager`, which handles:
//! - Writing internal snapshots under `<backup_dir>/backup-<global_step>`
//! - Automatic cleanup of old backups
//! - Finding the latest backup for restore operations

use crate::model::ModelHandle;
use crate::snapshot::{Snapshot, SnapshotComposer, SnapshotConfig};
use crate::{io_err, CheckpointError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const BACKUP_PREFIX: &str = "backup-";

/// Information about a saved backup.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    /// Snapshot directory.
    pub path: PathBuf,

    /// Global step at which this backup was saved.
    pub global_step: u64,

    /// When the backup was written. `None` for backups found by
    /// [`BackupManager::initialize`].
    pub timestamp: Option<DateTime<Utc>>,
}

/// Configuration for the backup manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory where backups are stored.
    pub backup_dir: PathBuf,

    /// Maximum number of backups to keep.
    /// Older backups are automatically deleted.
    pub max_to_keep: usize,

    /// Interval in steps between automatic backups.
    /// Set to 0 to disable automatic backups.
    pub backup_interval: u64,

    /// Encoding of the snapshot side files.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("backups"),
            max_to_keep: 5,
            backup_interval: 1000,
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl BackupConfig {
    /// Create a new backup configuration.
    ///
    /// # Arguments
    ///
    /// * `backup_dir` - Directory where backups will be stored
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            ..Default::default()
        }
    }

    /// Set the maximum number of backups to keep.
    pub fn with_max_to_keep(mut self, max_to_keep: usize) -> Self {
        self.max_to_keep = max_to_keep;
        self
    }

    /// Set the backup interval.
    pub fn with_backup_interval(mut self, interval: u64) -> Self {
        self.backup_interval = interval;
        self
    }

    /// Set the snapshot configuration.
    pub fn with_snapshot(mut self, snapshot: SnapshotConfig) -> Self {
        self.snapshot = snapshot;
        self
    }
}

fn parse_backup_step(name: &str) -> Option<u64> {
    name.strip_prefix(BACKUP_PREFIX)?.parse().ok()
}

/// Manages backup lifecycle including saving, restoring, and cleanup.
///
/// # Examples
///
/// ```no_run
/// use kiln_checkpoint::{BackupConfig, BackupManager, ModelHandle, ModelType, OptimizerState};
///
/// fn main() -> kiln_checkpoint::Result<()> {
///     let config = BackupConfig::new("/tmp/backups").with_max_to_keep(3);
///     let mut manager = BackupManager::new(config);
///     manager.initialize()?;
///
///     let mut model = ModelHandle::new(ModelType::PixArtAlpha, OptimizerState::new("adamw"));
///     if manager.should_backup(model.train_progress.global_step) {
///         manager.save(&mut model)?;
///     }
///
///     let restored = manager.restore_latest()?;
///     Ok(())
/// }
/// ```
pub struct BackupManager {
    config: BackupConfig,

    composer: SnapshotComposer,

    /// History of saved backups (oldest first).
    backup_history: VecDeque<BackupInfo>,
}

impl BackupManager {
    /// Create a new backup manager.
    pub fn new(config: BackupConfig) -> Self {
        let composer = SnapshotComposer::new(config.snapshot);
        Self {
            config,
            composer,
            backup_history: VecDeque::new(),
        }
    }

    /// Get the backup directory.
    pub fn backup_dir(&self) -> &Path {
        &self.config.backup_dir
    }

    /// Get the number of tracked backups.
    pub fn backup_count(&self) -> usize {
        self.backup_history.len()
    }

    /// Get the configuration.
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Directory a backup for `step` is written to.
    pub fn backup_path(&self, step: u64) -> PathBuf {
        self.config
            .backup_dir
            .join(format!("{}{}", BACKUP_PREFIX, step))
    }

    /// Save a backup of `handle` at its current global step.
    ///
    /// A backup already present for the same step is replaced. Old backups
    /// beyond `max_to_keep` are deleted afterwards.
    pub fn save(&mut self, handle: &mut ModelHandle) -> Result<BackupInfo> {
        let step = handle.train_progress.global_step;
        let path = self.backup_path(step);

        tracing::info!(step, path = %path.display(), "Saving backup");

        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(io_err(&path))?;
        }
        self.composer.write_snapshot(handle, &path)?;

        let info = BackupInfo {
            path,
            global_step: step,
            timestamp: Some(Utc::now()),
        };

        self.backup_history.retain(|b| b.global_step != step);
        self.backup_history.push_back(info.clone());

        self.cleanup_old()?;

        Ok(info)
    }

    /// Restore the backup with the highest step.
    ///
    /// Returns [`CheckpointError::NotFound`] if the directory has no backups.
    pub fn restore_latest(&self) -> Result<Snapshot> {
        let latest = self
            .list_backups()
            .pop()
            .ok_or_else(|| CheckpointError::NotFound(self.config.backup_dir.clone()))?;

        tracing::info!(path = %latest.display(), "Restoring latest backup");

        self.composer.read_snapshot(&latest)
    }

    /// Restore a backup by step number.
    pub fn restore_step(&self, step: u64) -> Result<Snapshot> {
        let path = self.backup_path(step);
        tracing::info!(step, path = %path.display(), "Restoring backup");
        self.composer.read_snapshot(&path)
    }

    /// Clean up old backups, keeping only `max_to_keep` most recent.
    pub fn cleanup_old(&mut self) -> Result<()> {
        while self.backup_history.len() > self.config.max_to_keep {
            if let Some(old) = self.backup_history.pop_front() {
                tracing::info!(
                    path = %old.path.display(),
                    step = old.global_step,
                    "Removing old backup"
                );

                if old.path.exists() {
                    std::fs::remove_dir_all(&old.path).map_err(io_err(&old.path))?;
                }
            }
        }

        Ok(())
    }

    /// List all backups in the backup directory, sorted by step (ascending).
    pub fn list_backups(&self) -> Vec<PathBuf> {
        self.scan()
            .into_iter()
            .map(|(_, path)| path)
            .collect()
    }

    /// Check if a backup should be saved at the given step.
    pub fn should_backup(&self, step: u64) -> bool {
        if self.config.backup_interval == 0 {
            return false;
        }
        step > 0 && step.is_multiple_of(self.config.backup_interval)
    }

    /// Initialize the manager by scanning the backup directory.
    ///
    /// This populates the backup history from existing directories.
    pub fn initialize(&mut self) -> Result<()> {
        self.backup_history.clear();

        if !self.config.backup_dir.exists() {
            return Ok(());
        }

        for (step, path) in self.scan() {
            self.backup_history.push_back(BackupInfo {
                path,
                global_step: step,
                timestamp: None,
            });
        }

        tracing::info!(
            count = self.backup_history.len(),
            "Initialized backup manager"
        );

        Ok(())
    }

    fn scan(&self) -> Vec<(u64, PathBuf)> {
        let mut backups = Vec::new();

        if let Ok(entries) = std::fs::read_dir(&self.config.backup_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|f| f.to_str()) else {
                    continue;
                };
                if !name.starts_with(BACKUP_PREFIX) {
                    continue;
                }
                match parse_backup_step(name) {
                    Some(step) => backups.push((step, path)),
                    None => tracing::warn!(path = %path.display(), "Ignoring unparsable backup directory"),
                }
            }
        }

        backups.sort_by_key(|(step, _)| *step);
        backups
    }
}
