//! Single entry point for writing a model in any supported format.

use crate::convert::KeyConverter;
use crate::format::flat::FlatTensorFileWriter;
use crate::format::legacy::LegacyArchiveWriter;
use crate::format::native::NativeDirectoryWriter;
use crate::format::ModelFormat;
use crate::model::ModelHandle;
use crate::normalize::{normalize, Precision};
use crate::snapshot::{SnapshotComposer, SnapshotConfig};
use crate::{CheckpointError, Result};
use kiln_tensor::TensorMap;
use std::path::Path;

/// Writes a [`ModelHandle`] in the requested [`ModelFormat`].
///
/// # Examples
///
/// ```no_run
/// use kiln_checkpoint::{ModelHandle, ModelSaver, ModelType, OptimizerState, Precision};
///
/// fn main() -> kiln_checkpoint::Result<()> {
///     let mut model = ModelHandle::new(ModelType::PixArtAlpha, OptimizerState::new("adamw"));
///     ModelSaver::new().save_str(&mut model, "diffusers", "/tmp/pipeline".as_ref(), Precision::BF16)?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ModelSaver {
    snapshot: SnapshotComposer,
}

impl ModelSaver {
    /// Create a saver with the default snapshot configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` for internal snapshots.
    pub fn with_snapshot_config(mut self, config: SnapshotConfig) -> Self {
        self.snapshot = SnapshotComposer::new(config);
        self
    }

    /// The composer used for internal snapshots.
    pub fn snapshot(&self) -> &SnapshotComposer {
        &self.snapshot
    }

    /// Saves `handle` to `dest`.
    ///
    /// Legacy archives and flat tensor files hold only the primary component,
    /// renamed to the external naming scheme and normalized to `precision`.
    /// Internal snapshots always store weights in float32 and ignore
    /// `precision`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::UnsupportedFormat`] without touching the
    /// filesystem if the model family cannot be written in `format`.
    pub fn save(
        &self,
        handle: &mut ModelHandle,
        format: ModelFormat,
        dest: &Path,
        precision: Precision,
    ) -> Result<()> {
        if !handle.model_type.supports(format) {
            return Err(CheckpointError::UnsupportedFormat(format!(
                "{} cannot be saved as {}",
                handle.model_type, format
            )));
        }

        tracing::info!(
            path = %dest.display(),
            format = %format,
            model_type = %handle.model_type,
            "Saving model"
        );

        match format {
            ModelFormat::NativeDirectory => NativeDirectoryWriter::write(handle, dest, precision)?,
            ModelFormat::LegacyArchive => {
                let tensors = external_state_dict(handle, precision)?;
                LegacyArchiveWriter::write(&tensors, dest)?;
            }
            ModelFormat::FlatTensorFile => {
                let tensors = external_state_dict(handle, precision)?;
                FlatTensorFileWriter::write(&tensors, &handle.model_spec.stamped(), dest)?;
            }
            ModelFormat::InternalSnapshot => self.snapshot.write_snapshot(handle, dest)?,
        }

        tracing::info!(path = %dest.display(), format = %format, "Model saved");
        Ok(())
    }

    /// Like [`ModelSaver::save`], with the format given by name
    /// (`diffusers`, `ckpt`, `safetensors`, `internal` or a canonical name).
    pub fn save_str(
        &self,
        handle: &mut ModelHandle,
        format: &str,
        dest: &Path,
        precision: Precision,
    ) -> Result<()> {
        let format: ModelFormat = format.parse()?;
        self.save(handle, format, dest, precision)
    }
}

/// Primary component weights in external naming at `precision`.
fn external_state_dict(handle: &ModelHandle, precision: Precision) -> Result<TensorMap> {
    let table = handle.model_type.conversion_table().ok_or_else(|| {
        CheckpointError::UnsupportedFormat(format!(
            "{} has no external naming table",
            handle.model_type
        ))
    })?;
    let internal = handle.primary()?.state_dict();
    let external = KeyConverter::new(table).to_external(&internal)?;
    normalize(&external, precision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::flat::read_flat_tensor_file;
    use crate::model::{ModelType, ParameterModule};
    use crate::provenance::ProvenanceHeader;
    use crate::state::OptimizerState;
    use kiln_tensor::{DType, Device, Tensor};
    use tempfile::tempdir;

    fn prior() -> ParameterModule {
        let mut params = TensorMap::new();
        params.insert("blocks.0.weight", Tensor::zeros(DType::F32, &[2, 2]));
        ParameterModule::new(serde_json::json!({}), params).on_device(Device::Cuda(1))
    }

    fn wuerstchen() -> ModelHandle {
        ModelHandle::new(ModelType::Wuerstchen, OptimizerState::new("adamw"))
            .with_component("prior", prior())
    }

    fn pixart() -> ModelHandle {
        let mut params = TensorMap::new();
        params.insert(
            "proj_out.weight",
            Tensor::from_vec(vec![0.1f32, 0.2, 0.3, 0.4], &[2, 2]).unwrap(),
        );
        ModelHandle::new(ModelType::PixArtAlpha, OptimizerState::new("adamw"))
            .with_component(
                "transformer",
                ParameterModule::new(serde_json::json!({}), params).on_device(Device::Cuda(0)),
            )
            .with_model_spec(ProvenanceHeader::new("pixart_alpha").with_title("demo"))
    }

    fn is_empty_dir(path: &Path) -> bool {
        std::fs::read_dir(path).unwrap().next().is_none()
    }

    #[test]
    fn test_unsupported_format_writes_nothing() {
        let dir = tempdir().unwrap();
        let saver = ModelSaver::new();
        let mut model = wuerstchen();

        for format in [ModelFormat::LegacyArchive, ModelFormat::FlatTensorFile] {
            let err = saver
                .save(&mut model, format, &dir.path().join("out"), Precision::F16)
                .unwrap_err();
            assert!(matches!(err, CheckpointError::UnsupportedFormat(_)), "{err:?}");
        }
        let err = saver
            .save_str(&mut model, "onnx", &dir.path().join("out"), Precision::F16)
            .unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedFormat(ref s) if s == "onnx"));

        assert!(is_empty_dir(dir.path()));
        assert_eq!(model.devices()["prior"], Device::Cuda(1));
    }

    #[test]
    fn test_wuerstchen_native_and_internal() {
        let dir = tempdir().unwrap();
        let saver = ModelSaver::new();
        let mut model = wuerstchen();
        saver
            .save(&mut model, ModelFormat::NativeDirectory, &dir.path().join("native"), Precision::F16)
            .unwrap();
        saver
            .save(&mut model, ModelFormat::InternalSnapshot, &dir.path().join("snap"), Precision::F16)
            .unwrap();
        assert!(dir.path().join("native/prior").is_dir());
        assert!(dir.path().join("snap/meta.json").is_file());
        assert_eq!(model.devices()["prior"], Device::Cuda(1));
    }

    #[test]
    fn test_flat_file_carries_provenance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let mut model = pixart();
        ModelSaver::new()
            .save(&mut model, ModelFormat::FlatTensorFile, &path, Precision::BF16)
            .unwrap();

        let file = read_flat_tensor_file(&path).unwrap();
        let header = file.provenance().unwrap();
        assert_eq!(header.model_type, "pixart_alpha");
        assert_eq!(header.title.as_deref(), Some("demo"));
        assert!(header.date.is_some());
        assert_eq!(
            file.tensors["final_layer.linear.weight"].dtype(),
            DType::BF16
        );
        assert!(!file.tensors.contains_key("proj_out.weight"));
    }

    #[test]
    fn test_missing_primary_component() {
        let dir = tempdir().unwrap();
        let mut model = ModelHandle::new(ModelType::PixArtAlpha, OptimizerState::new("adamw"));
        let err = ModelSaver::new()
            .save(
                &mut model,
                ModelFormat::LegacyArchive,
                &dir.path().join("model.ckpt"),
                Precision::F16,
            )
            .unwrap_err();
        assert!(matches!(err, CheckpointError::MissingKey(ref k) if k == "transformer"));
        assert!(is_empty_dir(dir.path()));
    }

    #[test]
    fn test_unknown_key_aborts_before_write() {
        let dir = tempdir().unwrap();
        let mut model = pixart();
        let mut params = TensorMap::new();
        params.insert("not_a_pixart_param", Tensor::zeros(DType::F32, &[1]));
        model = model.with_component("transformer", ParameterModule::new(serde_json::json!({}), params));

        let err = ModelSaver::new()
            .save_str(&mut model, "ckpt", &dir.path().join("model.ckpt"), Precision::F32)
            .unwrap_err();
        assert!(matches!(err, CheckpointError::UnknownKey(_)), "{err:?}");
        assert!(is_empty_dir(dir.path()));
    }
}
