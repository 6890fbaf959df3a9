//! Precision and layout normalization of tensor maps.
//!
//! Every writer that emits raw weights first runs the map through
//! [`normalize`], so files always contain contiguous tensors of one float
//! precision.

use crate::{CheckpointError, Result};
use kiln_tensor::{DType, TensorMap};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Floating-point precision to write weights in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// IEEE half precision.
    F16,
    /// Brain float.
    BF16,
    /// Single precision.
    #[default]
    F32,
    /// Double precision.
    F64,
}

impl Precision {
    /// Tensor dtype corresponding to this precision.
    pub fn dtype(&self) -> DType {
        match self {
            Precision::F16 => DType::F16,
            Precision::BF16 => DType::BF16,
            Precision::F32 => DType::F32,
            Precision::F64 => DType::F64,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dtype())
    }
}

impl TryFrom<DType> for Precision {
    type Error = CheckpointError;

    fn try_from(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F16 => Ok(Precision::F16),
            DType::BF16 => Ok(Precision::BF16),
            DType::F32 => Ok(Precision::F32),
            DType::F64 => Ok(Precision::F64),
            other => Err(CheckpointError::UnsupportedPrecision(other.to_string())),
        }
    }
}

impl FromStr for Precision {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "float16" | "fp16" | "f16" | "half" => Ok(Precision::F16),
            "bfloat16" | "bf16" => Ok(Precision::BF16),
            "float32" | "fp32" | "f32" | "float" => Ok(Precision::F32),
            "float64" | "fp64" | "f64" | "double" => Ok(Precision::F64),
            _ => Err(CheckpointError::UnsupportedPrecision(s.to_string())),
        }
    }
}

/// Casts every float tensor of `map` to `precision` and makes every tensor
/// contiguous.
///
/// Integer tensors keep their dtype. The input map is left untouched and the
/// returned tensors own fresh storage. Each value is rounded once, straight
/// from its source dtype to the target.
pub fn normalize(map: &TensorMap, precision: Precision) -> Result<TensorMap> {
    let target = precision.dtype();
    let mut out = TensorMap::new();
    let mut cast = 0usize;
    for (name, tensor) in map {
        let normalized = if tensor.dtype().is_float() {
            if tensor.dtype() != target {
                cast += 1;
            }
            tensor.cast(target)?.into_contiguous()
        } else {
            tensor.to_contiguous()
        };
        out.insert(name.clone(), normalized);
    }
    tracing::debug!(
        tensors = out.len(),
        cast,
        precision = %precision,
        bytes = out.total_bytes(),
        "Normalized tensor map"
    );
    Ok(out)
}
