//! Native pipeline directories.
//!
//! ```text
//! <dest>/model_index.json
//! <dest>/<component>/config.json
//! <dest>/<component>/<weights file>.safetensors
//! <dest>/tokenizer/...
//! ```

use super::flat;
use crate::model::{ExportCopy, HostRelocation, ModelHandle, ModelType, ParameterModule, Tokenizer};
use crate::normalize::Precision;
use crate::{io_err, read_json, write_json, Result};
use kiln_tensor::TensorMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Name of the pipeline index file.
pub const MODEL_INDEX_FILE: &str = "model_index.json";

/// Name of each component's configuration file.
pub const CONFIG_FILE: &str = "config.json";

/// Directory the tokenizer is written to.
pub const TOKENIZER_DIR: &str = "tokenizer";

/// Contents of `model_index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeIndex {
    /// Pipeline class.
    #[serde(rename = "_class_name")]
    pub class_name: String,

    /// Version of the writer.
    #[serde(rename = "_kiln_version")]
    pub kiln_version: String,

    /// Model family.
    pub model_type: ModelType,

    /// Components by directory name.
    pub components: BTreeMap<String, ComponentEntry>,

    /// Tokenizer directory, if one was written.
    #[serde(default)]
    pub tokenizer: Option<String>,
}

/// One component listed in `model_index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentEntry {
    /// `_class_name` from the component configuration, if present.
    pub class_name: Option<String>,
    /// Weights file inside the component directory.
    pub weights_file: String,
}

/// Writer for native pipeline directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeDirectoryWriter;

impl NativeDirectoryWriter {
    /// Writes every sub-model of `handle` to `dest` in `precision`.
    ///
    /// The live model is moved to host memory only long enough to copy it;
    /// its original placement is restored before the copy is cast and
    /// written, and also when copying fails. The live model's precision is
    /// never changed.
    pub fn write(handle: &mut ModelHandle, dest: &Path, precision: Precision) -> Result<()> {
        tracing::info!(
            path = %dest.display(),
            model_type = %handle.model_type,
            precision = %precision,
            "Writing native directory"
        );

        let mut copy = {
            let guard = HostRelocation::acquire(handle)?;
            let copy = guard.export_copy();
            guard.restore()?;
            copy
        };
        copy.cast(precision)?;
        let bytes = write_export(copy, dest)?;
        tracing::debug!(path = %dest.display(), bytes, "Native directory written");
        Ok(())
    }
}

/// Writes the copy, releasing each component once its weights are on disk.
fn write_export(copy: ExportCopy, dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest).map_err(io_err(dest))?;

    let index = NativeIndex {
        class_name: copy.model_type.pipeline_class().to_string(),
        kiln_version: env!("CARGO_PKG_VERSION").to_string(),
        model_type: copy.model_type,
        components: copy
            .components
            .iter()
            .map(|(name, component)| {
                let entry = ComponentEntry {
                    class_name: component
                        .config()
                        .get("_class_name")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    weights_file: component.weights_file_name().to_string(),
                };
                (name.clone(), entry)
            })
            .collect(),
        tokenizer: copy.tokenizer.as_ref().map(|_| TOKENIZER_DIR.to_string()),
    };
    write_json(&dest.join(MODEL_INDEX_FILE), &index)?;

    let ExportCopy {
        components,
        tokenizer,
        ..
    } = copy;
    let mut total = 0;
    for (name, component) in components {
        let dir = dest.join(&name);
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        write_json(&dir.join(CONFIG_FILE), component.config())?;
        let weights_path = dir.join(component.weights_file_name());
        let weights = component.into_state_dict();
        let size = flat::write_file(&weights, None, &weights_path)?;
        total += size;
        tracing::debug!(component = %name, path = %weights_path.display(), size, "Component written");
    }

    if let Some(tokenizer) = &tokenizer {
        tokenizer.save(&dest.join(TOKENIZER_DIR))?;
    }
    Ok(total)
}



/// One component read back from a native directory.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeComponent {
    /// Component configuration.
    pub config: serde_json::Value,
    /// Weights file name.
    pub weights_file: String,
    /// Parameters.
    pub weights: TensorMap,
}

impl NativeComponent {
    /// Turns the component into a CPU-resident module.
    pub fn into_module(self) -> ParameterModule {
        ParameterModule::new(self.config, self.weights).with_weights_file_name(self.weights_file)
    }
}

/// A native directory read back into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct NativePipeline {
    /// Parsed `model_index.json`.
    pub index: NativeIndex,
    /// Components by name.
    pub components: BTreeMap<String, NativeComponent>,
    /// Tokenizer files, if the pipeline has a tokenizer.
    pub tokenizer: Option<Tokenizer>,
}

/// Reads a native directory written by [`NativeDirectoryWriter`].
pub fn read_native_directory(path: &Path) -> Result<NativePipeline> {
    let index: NativeIndex = read_json(&path.join(MODEL_INDEX_FILE))?;

    let mut components = BTreeMap::new();
    for (name, entry) in &index.components {
        let dir = path.join(name);
        let config = read_json(&dir.join(CONFIG_FILE))?;
        let weights = flat::read_flat_tensor_file(&dir.join(&entry.weights_file))?.tensors;
        components.insert(
            name.clone(),
            NativeComponent {
                config,
                weights_file: entry.weights_file.clone(),
                weights,
            },
        );
    }

    let tokenizer = index
        .tokenizer
        .as_ref()
        .map(|dir| Tokenizer::load(&path.join(dir)))
        .transpose()?;

    tracing::info!(
        path = %path.display(),
        components = components.len(),
        "Read native directory"
    );

    Ok(NativePipeline {
        index,
        components,
        tokenizer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SubModel, DEFAULT_WEIGHTS_FILE};
    use crate::state::OptimizerState;
    use crate::CheckpointError;
    use kiln_tensor::{DType, Device, Tensor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Counts how often the full parameter set is cloned out.
    #[derive(Clone)]
    struct Counted {
        inner: ParameterModule,
        clones: Arc<AtomicUsize>,
    }

    impl SubModel for Counted {
        fn config(&self) -> &serde_json::Value {
            self.inner.config()
        }
        fn device(&self) -> Device {
            self.inner.device()
        }
        fn to_device(&mut self, device: Device) -> Result<()> {
            self.inner.to_device(device)
        }
        fn state_dict(&self) -> TensorMap {
            self.clones.fetch_add(1, Ordering::SeqCst);
            self.inner.state_dict()
        }
        fn into_state_dict(self: Box<Self>) -> TensorMap {
            Box::new(self.inner).into_state_dict()
        }
        fn cast(&mut self, precision: Precision) -> Result<()> {
            self.inner.cast(precision)
        }
        fn clone_box(&self) -> Box<dyn SubModel> {
            Box::new(self.clone())
        }
    }

    fn component(device: Device, value: f32) -> ParameterModule {
        let mut params = TensorMap::new();
        params.insert("layer.weight", Tensor::from_vec(vec![value; 6], &[2, 3]).unwrap());
        params.insert("layer.position_ids", Tensor::from_vec(vec![0i64, 1, 2], &[3]).unwrap());
        ParameterModule::new(serde_json::json!({"_class_name": "Layer", "dim": 3}), params)
            .on_device(device)
    }

    fn pipeline() -> ModelHandle {
        ModelHandle::new(ModelType::PixArtAlpha, OptimizerState::new("adamw"))
            .with_component("transformer", component(Device::Cuda(0), 0.5))
            .with_component(
                "text_encoder",
                component(Device::Cuda(0), 1.5).with_weights_file_name("model.safetensors"),
            )
            .with_component("vae", component(Device::Cpu, 2.5))
            .with_tokenizer(Tokenizer::from_files([("spiece.model", vec![7u8; 16])]))
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("pipeline");
        let mut model = pipeline();
        NativeDirectoryWriter::write(&mut model, &dest, Precision::BF16).unwrap();

        assert!(dest.join("model_index.json").exists());
        assert!(dest.join("transformer").join(DEFAULT_WEIGHTS_FILE).exists());
        assert!(dest.join("text_encoder/model.safetensors").exists());
        assert!(dest.join("tokenizer/spiece.model").exists());

        let read = read_native_directory(&dest).unwrap();
        assert_eq!(read.index.class_name, "PixArtAlphaPipeline");
        assert_eq!(read.index.components["vae"].class_name.as_deref(), Some("Layer"));
        assert_eq!(read.components.len(), 3);

        let te = &read.components["text_encoder"];
        assert_eq!(te.config["dim"], 3);
        assert_eq!(te.weights["layer.weight"].dtype(), DType::BF16);
        assert_eq!(te.weights["layer.weight"].to_f64_vec(), vec![1.5; 6]);
        assert_eq!(te.weights["layer.position_ids"].dtype(), DType::I64);
        assert_eq!(read.tokenizer.as_ref(), model.tokenizer.as_deref());

        let module = read.components["vae"].clone().into_module();
        assert_eq!(module.device(), Device::Cpu);
        assert_eq!(module.params().len(), 2);
    }

    #[test]
    fn test_live_model_is_untouched() {
        let dir = tempdir().unwrap();
        let mut model = pipeline();
        let devices = model.devices();
        let weights = model.primary().unwrap().state_dict();

        NativeDirectoryWriter::write(&mut model, dir.path(), Precision::F16).unwrap();

        assert_eq!(model.devices(), devices);
        assert_eq!(model.primary().unwrap().state_dict(), weights);
    }

    #[test]
    fn test_write_into_file_path_fails_and_restores_devices() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let mut model = pipeline();
        let devices = model.devices();
        let err = NativeDirectoryWriter::write(&mut model, &blocker, Precision::F32).unwrap_err();
        assert!(matches!(err, CheckpointError::Io { .. }), "{err:?}");
        assert_eq!(model.devices(), devices);
    }

    #[test]
    fn test_write_does_not_clone_parameters_again() {
        let dir = tempdir().unwrap();
        let clones = Arc::new(AtomicUsize::new(0));
        let mut model = ModelHandle::new(ModelType::PixArtAlpha, OptimizerState::new("adamw"))
            .with_component(
                "transformer",
                Counted {
                    inner: component(Device::Cuda(0), 0.5),
                    clones: Arc::clone(&clones),
                },
            );

        NativeDirectoryWriter::write(&mut model, dir.path(), Precision::F32).unwrap();

        assert_eq!(clones.load(Ordering::SeqCst), 0);
        let read = read_native_directory(dir.path()).unwrap();
        assert_eq!(read.components["transformer"].weights, component(Device::Cpu, 0.5).params().clone());
    }

    #[test]
    fn test_missing_index() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            read_native_directory(dir.path()),
            Err(CheckpointError::NotFound(path)) if path.ends_with("model_index.json")
        ));
    }
}
