//! On-disk formats.
//!
//! - [`native`]: multi-file pipeline directory
//! - [`legacy`]: single archive wrapping a `state_dict`
//! - [`flat`]: safetensors file with a provenance header

pub mod flat;
pub mod legacy;
pub mod native;

use crate::CheckpointError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Output format selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFormat {
    /// Pipeline directory with one sub-directory per component.
    NativeDirectory,
    /// Single MessagePack archive of the primary component.
    LegacyArchive,
    /// Single safetensors file of the primary component.
    FlatTensorFile,
    /// Resumable training snapshot.
    InternalSnapshot,
}

impl ModelFormat {
    /// All formats.
    pub const ALL: [ModelFormat; 4] = [
        ModelFormat::NativeDirectory,
        ModelFormat::LegacyArchive,
        ModelFormat::FlatTensorFile,
        ModelFormat::InternalSnapshot,
    ];

    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            ModelFormat::NativeDirectory => "native-directory",
            ModelFormat::LegacyArchive => "legacy-archive",
            ModelFormat::FlatTensorFile => "flat-tensor-file",
            ModelFormat::InternalSnapshot => "internal-snapshot",
        }
    }

    /// Whether the destination is a directory rather than a file.
    pub fn is_directory(&self) -> bool {
        matches!(
            self,
            ModelFormat::NativeDirectory | ModelFormat::InternalSnapshot
        )
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ModelFormat {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "diffusers" | "native-directory" => Ok(ModelFormat::NativeDirectory),
            "ckpt" | "legacy-archive" => Ok(ModelFormat::LegacyArchive),
            "safetensors" | "flat-tensor-file" => Ok(ModelFormat::FlatTensorFile),
            "internal" | "internal-snapshot" => Ok(ModelFormat::InternalSnapshot),
            _ => Err(CheckpointError::UnsupportedFormat(s.to_string())),
        }
    }
}
