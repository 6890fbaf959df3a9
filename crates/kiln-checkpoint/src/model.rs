//! In-memory models handed to the checkpoint engine.
//!
//! A [`ModelHandle`] bundles the named sub-models of one pipeline with the
//! training state that travels with it. Sub-models are reached through the
//! [`SubModel`] trait so the engine never depends on a concrete network
//! implementation; [`ParameterModule`] is the plain-parameter implementation
//! used when loading checkpoints back.

use crate::convert::ConversionTable;
use crate::format::ModelFormat;
use crate::normalize::{normalize, Precision};
use crate::provenance::ProvenanceHeader;
use crate::state::{EmaHandle, OptimizerHandle, TrainProgress};
use crate::{io_err, CheckpointError, Result};
use kiln_tensor::{Device, TensorMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Weights file name used by sub-models that do not override it.
pub const DEFAULT_WEIGHTS_FILE: &str = "diffusion_pytorch_model.safetensors";

/// A component of a pipeline (backbone, text encoder, autoencoder, ...).
pub trait SubModel: Send {
    /// Architecture configuration, written as `config.json`.
    fn config(&self) -> &serde_json::Value;

    /// File name of the weights inside the component directory.
    fn weights_file_name(&self) -> &str {
        DEFAULT_WEIGHTS_FILE
    }

    /// Device the parameters live on.
    fn device(&self) -> Device;

    /// Moves all parameters to `device`.
    fn to_device(&mut self, device: Device) -> Result<()>;

    /// Snapshot of the parameters under their internal names.
    fn state_dict(&self) -> TensorMap;

    /// Consumes the sub-model and returns its parameters.
    ///
    /// Writers call this on export copies they no longer need, so
    /// implementations that own their parameters should hand them over
    /// without copying.
    fn into_state_dict(self: Box<Self>) -> TensorMap {
        self.state_dict()
    }

    /// Converts all floating-point parameters to `precision`.
    fn cast(&mut self, precision: Precision) -> Result<()>;

    /// Deep copy of this sub-model.
    fn clone_box(&self) -> Box<dyn SubModel>;
}

impl Clone for Box<dyn SubModel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl fmt::Debug for dyn SubModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubModel")
            .field("device", &self.device())
            .field("weights_file", &self.weights_file_name())
            .finish()
    }
}

/// A sub-model that is nothing more than a configuration and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterModule {
    config: serde_json::Value,
    weights_file_name: String,
    device: Device,
    params: TensorMap,
}

impl ParameterModule {
    /// Create a module on the CPU.
    pub fn new(config: serde_json::Value, params: TensorMap) -> Self {
        Self {
            config,
            weights_file_name: DEFAULT_WEIGHTS_FILE.to_string(),
            device: Device::Cpu,
            params,
        }
    }

    /// Set the device label.
    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Set the weights file name.
    pub fn with_weights_file_name(mut self, name: impl Into<String>) -> Self {
        self.weights_file_name = name.into();
        self
    }

    /// The parameters.
    pub fn params(&self) -> &TensorMap {
        &self.params
    }

    /// Mutable access to the parameters.
    pub fn params_mut(&mut self) -> &mut TensorMap {
        &mut self.params
    }
}

impl SubModel for ParameterModule {
    fn config(&self) -> &serde_json::Value {
        &self.config
    }

    fn weights_file_name(&self) -> &str {
        &self.weights_file_name
    }

    fn device(&self) -> Device {
        self.device
    }

    fn to_device(&mut self, device: Device) -> Result<()> {
        self.device = device;
        Ok(())
    }

    fn state_dict(&self) -> TensorMap {
        self.params.clone()
    }

    fn into_state_dict(self: Box<Self>) -> TensorMap {
        self.params
    }

    fn cast(&mut self, precision: Precision) -> Result<()> {
        self.params = normalize(&self.params, precision)?;
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn SubModel> {
        Box::new(self.clone())
    }
}

/// Tokenizer files shipped with a pipeline.
///
/// Kept as raw files; the engine copies them verbatim into `tokenizer/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokenizer {
    files: BTreeMap<String, Vec<u8>>,
}

impl Tokenizer {
    /// Create a tokenizer from named files.
    pub fn from_files<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Load every regular file of `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(CheckpointError::NotFound(dir.to_path_buf()));
        }
        let mut files = BTreeMap::new();
        for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
            let path = entry.map_err(io_err(dir))?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|f| f.to_str()) {
                let bytes = std::fs::read(&path).map_err(io_err(&path))?;
                files.insert(name.to_string(), bytes);
            }
        }
        Ok(Self { files })
    }

    /// Write every file into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(io_err(dir))?;
        for (name, bytes) in &self.files {
            let path = dir.join(name);
            std::fs::write(&path, bytes).map_err(io_err(&path))?;
        }
        Ok(())
    }

    /// File names.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

/// Model families the engine knows how to save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// PixArt-Alpha: transformer, T5 text encoder, VAE.
    PixArtAlpha,
    /// Wuerstchen: prior, text encoder, decoder, VQGAN, EfficientNet encoder.
    Wuerstchen,
}

impl ModelType {
    /// Stable name used in provenance records.
    pub fn name(&self) -> &'static str {
        match self {
            ModelType::PixArtAlpha => "pixart_alpha",
            ModelType::Wuerstchen => "wuerstchen",
        }
    }

    /// Pipeline class written to `model_index.json`.
    pub fn pipeline_class(&self) -> &'static str {
        match self {
            ModelType::PixArtAlpha => "PixArtAlphaPipeline",
            ModelType::Wuerstchen => "WuerstchenCombinedPipeline",
        }
    }

    /// Component exported by the single-file formats.
    pub fn primary_component(&self) -> &'static str {
        match self {
            ModelType::PixArtAlpha => "transformer",
            ModelType::Wuerstchen => "prior",
        }
    }

    /// Naming table for external single-file formats, if the family has one.
    pub fn conversion_table(&self) -> Option<&'static ConversionTable> {
        match self {
            ModelType::PixArtAlpha => Some(ConversionTable::pixart_alpha()),
            ModelType::Wuerstchen => None,
        }
    }

    /// Whether this family can be written in `format`.
    pub fn supports(&self, format: ModelFormat) -> bool {
        match format {
            ModelFormat::NativeDirectory | ModelFormat::InternalSnapshot => true,
            ModelFormat::LegacyArchive | ModelFormat::FlatTensorFile => {
                self.conversion_table().is_some()
            }
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A model together with the training state saved alongside it.
pub struct ModelHandle {
    /// Model family.
    pub model_type: ModelType,
    /// Named sub-models.
    pub components: BTreeMap<String, Box<dyn SubModel>>,
    /// Tokenizer shared by the pipeline, if any.
    pub tokenizer: Option<Arc<Tokenizer>>,
    /// Optimizer state source.
    pub optimizer: Box<dyn OptimizerHandle>,
    /// EMA state source, if EMA is enabled.
    pub ema: Option<Box<dyn EmaHandle>>,
    /// Training progress counters.
    pub train_progress: TrainProgress,
    /// Provenance record.
    pub model_spec: ProvenanceHeader,
}

impl ModelHandle {
    /// Create a handle with no components.
    pub fn new(model_type: ModelType, optimizer: impl OptimizerHandle + 'static) -> Self {
        Self {
            model_type,
            components: BTreeMap::new(),
            tokenizer: None,
            optimizer: Box::new(optimizer),
            ema: None,
            train_progress: TrainProgress::default(),
            model_spec: ProvenanceHeader::new(model_type.name()),
        }
    }

    /// Add a sub-model.
    pub fn with_component(
        mut self,
        name: impl Into<String>,
        component: impl SubModel + 'static,
    ) -> Self {
        self.components.insert(name.into(), Box::new(component));
        self
    }

    /// Set the tokenizer.
    pub fn with_tokenizer(mut self, tokenizer: Tokenizer) -> Self {
        self.tokenizer = Some(Arc::new(tokenizer));
        self
    }

    /// Enable EMA.
    pub fn with_ema(mut self, ema: impl EmaHandle + 'static) -> Self {
        self.ema = Some(Box::new(ema));
        self
    }

    /// Set the progress counters.
    pub fn with_train_progress(mut self, progress: TrainProgress) -> Self {
        self.train_progress = progress;
        self
    }

    /// Set the provenance record.
    pub fn with_model_spec(mut self, model_spec: ProvenanceHeader) -> Self {
        self.model_spec = model_spec;
        self
    }

    /// Look up a sub-model.
    pub fn component(&self, name: &str) -> Option<&dyn SubModel> {
        self.components.get(name).map(|c| c.as_ref())
    }

    /// The component exported by single-file formats.
    pub fn primary(&self) -> Result<&dyn SubModel> {
        let name = self.model_type.primary_component();
        self.component(name)
            .ok_or_else(|| CheckpointError::MissingKey(name.to_string()))
    }

    /// Current device of every sub-model.
    pub fn devices(&self) -> BTreeMap<String, Device> {
        self.components
            .iter()
            .map(|(name, c)| (name.clone(), c.device()))
            .collect()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_type", &self.model_type)
            .field("components", &self.components)
            .field("tokenizer", &self.tokenizer.is_some())
            .field("ema", &self.ema.is_some())
            .field("train_progress", &self.train_progress)
            .finish()
    }
}

/// Scoped move of a model to host memory.
///
/// While the guard lives, every sub-model sits on [`Device::Cpu`]. Dropping
/// the guard (or calling [`HostRelocation::restore`]) moves each sub-model
/// back to the device it was on when the guard was acquired, including when
/// the export in between failed.
pub struct HostRelocation<'a> {
    handle: &'a mut ModelHandle,
    original: BTreeMap<String, Device>,
}

impl<'a> HostRelocation<'a> {
    /// Record current placement and move every sub-model to the CPU.
    pub fn acquire(handle: &'a mut ModelHandle) -> Result<Self> {
        let original = handle.devices();
        let mut guard = Self { handle, original };
        for (name, component) in guard.handle.components.iter_mut() {
            if !component.device().is_cpu() {
                tracing::debug!(component = %name, from = %component.device(), "Moving to host");
                component.to_device(Device::Cpu)?;
            }
        }
        Ok(guard)
    }

    /// Deep copy of the sub-models. The tokenizer is shared, not copied.
    pub fn export_copy(&self) -> ExportCopy {
        ExportCopy {
            model_type: self.handle.model_type,
            components: self.handle.components.clone(),
            tokenizer: self.handle.tokenizer.clone(),
        }
    }

    /// Restore the original placement, reporting the first failure.
    pub fn restore(mut self) -> Result<()> {
        self.restore_all()
    }

    fn restore_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for (name, device) in std::mem::take(&mut self.original) {
            let Some(component) = self.handle.components.get_mut(&name) else {
                continue;
            };
            if component.device() == device {
                continue;
            }
            if let Err(e) = component.to_device(device) {
                tracing::warn!(component = %name, device = %device, error = %e, "Failed to restore device");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for HostRelocation<'_> {
    fn drop(&mut self) {
        let _ = self.restore_all();
    }
}

/// Host-side copy of a model's sub-models, made for export.
pub struct ExportCopy {
    /// Model family.
    pub model_type: ModelType,
    /// Copied sub-models.
    pub components: BTreeMap<String, Box<dyn SubModel>>,
    /// Tokenizer shared with the live model.
    pub tokenizer: Option<Arc<Tokenizer>>,
}

impl ExportCopy {
    /// Converts every copied sub-model to `precision`.
    pub fn cast(&mut self, precision: Precision) -> Result<()> {
        for component in self.components.values_mut() {
            component.cast(precision)?;
        }
        Ok(())
    }
}
