//! Checkpoint persistence and format conversion for diffusion training.
//!
//! This crate writes an in-memory, multi-component model to disk and reads
//! it back. Four on-disk representations are supported:
//!
//! - **Native directory**: one sub-directory per component with a
//!   `config.json` and a safetensors weights file, plus `model_index.json`
//! - **Legacy archive**: a single MessagePack file wrapping the converted
//!   weights of the primary component under a `state_dict` key
//! - **Flat tensor file**: a single safetensors file whose header carries
//!   the provenance record
//! - **Internal snapshot**: a resumable training snapshot made of native
//!   weights, optimizer state, EMA state, progress counters and provenance
//!
//! # Core Components
//!
//! - [`ModelSaver`]: single entry point dispatching on [`ModelFormat`]
//! - [`KeyConverter`]: internal <-> external parameter-name remapping
//! - [`normalize`]: precision and layout normalization of a [`TensorMap`]
//! - [`SnapshotComposer`]: writes and reads internal snapshots
//! - [`BackupManager`]: rolling snapshot backups with retention
//!
//! # Examples
//!
//! ```no_run
//! use kiln_checkpoint::{
//!     ModelFormat, ModelHandle, ModelSaver, ModelType, OptimizerState, ParameterModule,
//!     Precision,
//! };
//! use kiln_tensor::{DType, Tensor, TensorMap};
//!
//! fn main() -> kiln_checkpoint::Result<()> {
//!     let mut weights = TensorMap::new();
//!     weights.insert("proj_out.weight", Tensor::zeros(DType::F32, &[8, 8]));
//!
//!     let mut model = ModelHandle::new(ModelType::PixArtAlpha, OptimizerState::new("adamw"))
//!         .with_component(
//!             "transformer",
//!             ParameterModule::new(serde_json::json!({"_class_name": "Transformer2DModel"}), weights),
//!         );
//!
//!     let saver = ModelSaver::new();
//!     saver.save(&mut model, ModelFormat::FlatTensorFile, "/tmp/model.safetensors".as_ref(), Precision::F16)?;
//!     saver.save_str(&mut model, "internal", "/tmp/snapshot".as_ref(), Precision::F32)?;
//!     Ok(())
//! }
//! ```

pub mod convert;
pub mod format;
pub mod manager;
pub mod model;
pub mod normalize;
pub mod provenance;
pub mod saver;
pub mod serialization;
pub mod snapshot;
pub mod state;

pub use convert::{ConversionTable, KeyConverter, KeyRule};
pub use format::flat::{
    read_flat_header, read_flat_tensor_file, FlatHeader, FlatTensorFile, FlatTensorFileWriter,
    FlatTensorInfo,
};
pub use format::legacy::{read_legacy_archive, LegacyArchiveWriter};
pub use format::native::{
    read_native_directory, NativeComponent, NativeDirectoryWriter, NativeIndex, NativePipeline,
};
pub use format::ModelFormat;
pub use manager::{BackupConfig, BackupInfo, BackupManager};
pub use model::{
    ExportCopy, HostRelocation, ModelHandle, ModelType, ParameterModule, SubModel, Tokenizer,
};
pub use normalize::{normalize, Precision};
pub use provenance::ProvenanceHeader;
pub use saver::ModelSaver;
pub use serialization::{CompressionType, StateCodec, StateFormat};
pub use snapshot::{Snapshot, SnapshotArtifact, SnapshotComposer, SnapshotConfig, SnapshotMeta};
pub use state::{EmaHandle, EmaState, OptimizerHandle, OptimizerState, ParamGroupState, TrainProgress};

use kiln_tensor::TensorError;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during checkpoint operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// I/O error during checkpoint operations.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint file or directory not found.
    #[error("Checkpoint not found: {0}")]
    NotFound(PathBuf),

    /// Error during JSON serialization.
    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Error during JSON deserialization.
    #[error("Deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Error from a binary encoder or decoder (bincode, MessagePack, safetensors).
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Corrupted checkpoint data.
    #[error("Corrupted checkpoint: {0}")]
    Corrupted(String),

    /// Requested output precision is not a floating-point type.
    #[error("Unsupported precision: {0}")]
    UnsupportedPrecision(String),

    /// No conversion rule matches a parameter name.
    #[error("Unknown parameter key: {0}")]
    UnknownKey(String),

    /// A parameter required by a conversion rule or model is absent.
    #[error("Missing parameter key: {0}")]
    MissingKey(String),

    /// Tensors cannot be fused or split as a conversion rule requires.
    #[error("Shape mismatch for {key}: {detail}")]
    ShapeMismatch {
        /// Parameter the mismatch was detected on.
        key: String,
        /// What did not line up.
        detail: String,
    },

    /// Output format is unknown or not available for this model family.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A snapshot artifact failed to write or read.
    #[error("Failed on snapshot artifact {artifact}: {source}")]
    Artifact {
        /// Which artifact failed.
        artifact: SnapshotArtifact,
        /// What went wrong.
        #[source]
        source: Box<CheckpointError>,
    },

    /// Tensor operation error.
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// Invalid checkpoint configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CheckpointError {
    /// Wraps this error with the snapshot artifact it happened on.
    pub fn in_artifact(self, artifact: SnapshotArtifact) -> Self {
        CheckpointError::Artifact {
            artifact,
            source: Box::new(self),
        }
    }

    pub(crate) fn encoding(what: &str, err: impl fmt::Display) -> Self {
        CheckpointError::Encoding(format!("{} failed: {}", what, err))
    }
}

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Maps an I/O error at `path` into [`CheckpointError::Io`].
pub(crate) fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes `value` as pretty-printed JSON to `path`.
pub(crate) fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(CheckpointError::Serialization)?;
    std::fs::write(path, data).map_err(io_err(path))
}

/// Reads a JSON document from `path`.
pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(CheckpointError::NotFound(path.to_path_buf()));
    }
    let data = std::fs::read(path).map_err(io_err(path))?;
    serde_json::from_slice(&data).map_err(CheckpointError::Deserialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_tensor::{DType, Device, Tensor, TensorMap};
    use tempfile::tempdir;

    fn pixart_transformer() -> TensorMap {
        let mut weights = TensorMap::new();
        weights.insert(
            "proj_out.weight",
            Tensor::from_vec((0..16).map(|v| v as f32).collect::<Vec<_>>(), &[4, 4]).unwrap(),
        );
        weights.insert("proj_out.bias", Tensor::zeros(DType::F32, &[4]));
        weights
    }

    fn model() -> ModelHandle {
        ModelHandle::new(ModelType::PixArtAlpha, OptimizerState::new("adamw"))
            .with_component(
                "transformer",
                ParameterModule::new(
                    serde_json::json!({"_class_name": "Transformer2DModel"}),
                    pixart_transformer(),
                )
                .on_device(Device::Cuda(0)),
            )
            .with_model_spec(ProvenanceHeader::new("pixart_alpha"))
    }

    #[test]
    fn test_end_to_end_every_format() {
        let dir = tempdir().unwrap();
        let saver = ModelSaver::new();
        let mut model = model();

        for (format, name) in [
            ("diffusers", "native"),
            ("ckpt", "model.ckpt"),
            ("safetensors", "model.safetensors"),
            ("internal", "snapshot"),
        ] {
            saver
                .save_str(&mut model, format, &dir.path().join(name), Precision::F16)
                .unwrap();
        }

        let native = read_native_directory(&dir.path().join("native")).unwrap();
        assert_eq!(
            native.components["transformer"].weights["proj_out.weight"].dtype(),
            DType::F16
        );

        let legacy = read_legacy_archive(&dir.path().join("model.ckpt")).unwrap();
        assert!(legacy.contains_key("final_layer.linear.weight"));

        let flat = read_flat_header(&dir.path().join("model.safetensors")).unwrap();
        assert_eq!(flat.tensors["final_layer.linear.bias"].dtype, DType::F16);

        let snapshot = SnapshotComposer::default()
            .read_snapshot(&dir.path().join("snapshot"))
            .unwrap();
        assert_eq!(
            snapshot.pipeline.components["transformer"].weights["proj_out.weight"].dtype(),
            DType::F32
        );

        assert_eq!(model.devices()["transformer"], Device::Cuda(0));
    }

    #[test]
    fn test_artifact_error_names_artifact() {
        let err = CheckpointError::NotFound(PathBuf::from("/missing/ema.bin"))
            .in_artifact(SnapshotArtifact::Ema);
        assert_eq!(
            err.to_string(),
            "Failed on snapshot artifact ema: Checkpoint not found: /missing/ema.bin"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_handling() {
        let err = read_legacy_archive(Path::new("/nonexistent/model.ckpt"))
            .expect_err("reading a missing archive should fail");
        assert!(
            matches!(
                &err,
                CheckpointError::NotFound(path)
                    if path.to_str().is_some_and(|p| p.contains("nonexistent"))
            ),
            "expected NotFound error with the missing path, got: {err:?}"
        );
    }
}
