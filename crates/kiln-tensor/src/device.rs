//! Device placement labels.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a module's parameters currently live.
///
/// The checkpoint engine never computes on a device; it only records and
/// restores placement around exports. [`Device::Cpu`] is host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Host memory.
    #[default]
    Cpu,
    /// A CUDA device with the given ordinal.
    Cuda(usize),
    /// A Metal device with the given ordinal.
    Metal(usize),
}

impl Device {
    /// Returns whether this device is host memory.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(i) => write!(f, "cuda:{}", i),
            Device::Metal(i) => write!(f, "metal:{}", i),
        }
    }
}
