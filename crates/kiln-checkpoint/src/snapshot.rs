//! Internal training snapshots.
//!
//! A snapshot directory bundles everything needed to resume training:
//!
//! ```text
//! <root>/model_index.json, <root>/<component>/...   weights (float32)
//! <root>/optimizer/optimizer.<ext>                 optimizer state
//! <root>/ema/ema.<ext>                             EMA state, if enabled
//! <root>/meta.json                                 {"train_progress": {...}}
//! <root>/model_spec.json                           provenance record
//! ```
//!
//! Writing is not transactional: a failure leaves whatever artifacts were
//! already written. [`SnapshotComposer::missing_artifacts`] lets callers
//! check a directory before resuming from it.

use crate::format::native::{self, NativeDirectoryWriter, NativePipeline};
use crate::model::ModelHandle;
use crate::normalize::Precision;
use crate::provenance::ProvenanceHeader;
use crate::serialization::{CompressionType, StateCodec, StateFormat};
use crate::state::{EmaState, OptimizerState, TrainProgress};
use crate::{io_err, read_json, write_json, CheckpointError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Name of the progress metadata file.
pub const META_FILE: &str = "meta.json";

/// Name of the provenance file.
pub const MODEL_SPEC_FILE: &str = "model_spec.json";

const OPTIMIZER_DIR: &str = "optimizer";
const EMA_DIR: &str = "ema";

/// The independent pieces of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotArtifact {
    /// Native-directory weights.
    Weights,
    /// Optimizer state.
    Optimizer,
    /// EMA state.
    Ema,
    /// `meta.json`.
    Metadata,
    /// `model_spec.json`.
    ModelSpec,
}

impl fmt::Display for SnapshotArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SnapshotArtifact::Weights => "weights",
            SnapshotArtifact::Optimizer => "optimizer",
            SnapshotArtifact::Ema => "ema",
            SnapshotArtifact::Metadata => "metadata",
            SnapshotArtifact::ModelSpec => "model_spec",
        };
        write!(f, "{}", name)
    }
}

/// Configuration of snapshot side files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Encoding of optimizer and EMA state.
    pub state_format: StateFormat,

    /// Compression of optimizer and EMA state.
    pub compression: CompressionType,

    /// Pretty-print JSON state files.
    pub pretty_json: bool,
}

impl SnapshotConfig {
    /// Create a configuration with the default bincode encoding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state encoding.
    pub fn with_state_format(mut self, format: StateFormat) -> Self {
        self.state_format = format;
        self
    }

    /// Set the compression.
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Pretty-print JSON state files.
    pub fn with_pretty_json(mut self, pretty: bool) -> Self {
        self.pretty_json = pretty;
        self
    }

    fn codec(&self) -> StateCodec {
        StateCodec::new(self.state_format)
            .with_compression(self.compression)
            .with_pretty_json(self.pretty_json)
    }
}

/// Contents of `meta.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Progress counters at save time.
    pub train_progress: TrainProgress,
}

/// A snapshot read back from disk.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Weights of every component.
    pub pipeline: NativePipeline,
    /// Optimizer state.
    pub optimizer: OptimizerState,
    /// EMA state, if the snapshot has one.
    pub ema: Option<EmaState>,
    /// Progress counters.
    pub train_progress: TrainProgress,
    /// Provenance record.
    pub model_spec: ProvenanceHeader,
}

/// Writes and reads internal snapshots.
#[derive(Debug, Clone, Default)]
pub struct SnapshotComposer {
    config: SnapshotConfig,
}

impl SnapshotComposer {
    /// Create a composer.
    pub fn new(config: SnapshotConfig) -> Self {
        Self { config }
    }

    /// The configuration.
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Path of the optimizer state file under `root`.
    pub fn optimizer_path(&self, root: &Path) -> PathBuf {
        root.join(OPTIMIZER_DIR)
            .join(self.config.codec().file_name(OPTIMIZER_DIR))
    }

    /// Path of the EMA state file under `root`.
    pub fn ema_path(&self, root: &Path) -> PathBuf {
        root.join(EMA_DIR).join(self.config.codec().file_name(EMA_DIR))
    }

    /// Writes a full snapshot of `handle` to `dest`.
    ///
    /// Weights are always written in float32. Each failure names the
    /// artifact it happened on.
    pub fn write_snapshot(&self, handle: &mut ModelHandle, dest: &Path) -> Result<()> {
        let progress = handle.train_progress;
        tracing::info!(
            path = %dest.display(),
            step = progress.global_step,
            ema = handle.ema.is_some(),
            "Writing snapshot"
        );

        NativeDirectoryWriter::write(handle, dest, Precision::F32)
            .map_err(|e| e.in_artifact(SnapshotArtifact::Weights))?;

        let codec = self.config.codec();
        codec
            .write_to_file(&self.optimizer_path(dest), &handle.optimizer.state_dict())
            .map_err(|e| e.in_artifact(SnapshotArtifact::Optimizer))?;

        match &handle.ema {
            Some(ema) => codec
                .write_to_file(&self.ema_path(dest), &ema.state_dict())
                .map_err(|e| e.in_artifact(SnapshotArtifact::Ema))?,
            None => {
                // A stale EMA from an earlier snapshot at `dest` would be read back.
                let ema_dir = dest.join(EMA_DIR);
                if ema_dir.exists() {
                    std::fs::remove_dir_all(&ema_dir)
                        .map_err(io_err(&ema_dir))
                        .map_err(|e| e.in_artifact(SnapshotArtifact::Ema))?;
                }
            }
        }

        let meta = SnapshotMeta {
            train_progress: progress,
        };
        write_json(&dest.join(META_FILE), &meta)
            .map_err(|e| e.in_artifact(SnapshotArtifact::Metadata))?;

        write_json(&dest.join(MODEL_SPEC_FILE), &handle.model_spec.stamped())
            .map_err(|e| e.in_artifact(SnapshotArtifact::ModelSpec))?;

        tracing::info!(path = %dest.display(), step = progress.global_step, "Snapshot written");
        Ok(())
    }

    /// Reads a snapshot written with the same configuration.
    ///
    /// The EMA state is optional; every other artifact must be present.
    pub fn read_snapshot(&self, root: &Path) -> Result<Snapshot> {
        if !root.is_dir() {
            return Err(CheckpointError::NotFound(root.to_path_buf()));
        }
        tracing::info!(path = %root.display(), "Reading snapshot");

        let pipeline = native::read_native_directory(root)
            .map_err(|e| e.in_artifact(SnapshotArtifact::Weights))?;

        let codec = self.config.codec();
        let optimizer = codec
            .read_from_file(&self.optimizer_path(root))
            .map_err(|e| e.in_artifact(SnapshotArtifact::Optimizer))?;

        let ema_path = self.ema_path(root);
        let ema = if ema_path.exists() {
            Some(
                codec
                    .read_from_file(&ema_path)
                    .map_err(|e| e.in_artifact(SnapshotArtifact::Ema))?,
            )
        } else {
            None
        };

        let meta: SnapshotMeta = read_json(&root.join(META_FILE))
            .map_err(|e| e.in_artifact(SnapshotArtifact::Metadata))?;
        let model_spec = read_json(&root.join(MODEL_SPEC_FILE))
            .map_err(|e| e.in_artifact(SnapshotArtifact::ModelSpec))?;

        Ok(Snapshot {
            pipeline,
            optimizer,
            ema,
            train_progress: meta.train_progress,
            model_spec,
        })
    }

    /// Artifacts absent from `root`. EMA is only expected when `expect_ema`.
    ///
    /// Only presence is checked, not contents.
    pub fn missing_artifacts(&self, root: &Path, expect_ema: bool) -> Vec<SnapshotArtifact> {
        let mut missing = Vec::new();
        if !root.join(native::MODEL_INDEX_FILE).is_file() {
            missing.push(SnapshotArtifact::Weights);
        }
        if !self.optimizer_path(root).is_file() {
            missing.push(SnapshotArtifact::Optimizer);
        }
        if expect_ema && !self.ema_path(root).is_file() {
            missing.push(SnapshotArtifact::Ema);
        }
        if !root.join(META_FILE).is_file() {
            missing.push(SnapshotArtifact::Metadata);
        }
        if !root.join(MODEL_SPEC_FILE).is_file() {
            missing.push(SnapshotArtifact::ModelSpec);
        }
        missing
    }
}
