//! Host tensor values for kiln checkpoints.
//!
//! This crate holds the data that checkpoint files are made of: typed
//! n-dimensional [`Tensor`] values backed by `ndarray`, ordered
//! [`TensorMap`]s from parameter names to tensors, and the [`Device`] label
//! used to track where a module's parameters live.
//!
//! # Example
//!
//! ```rust
//! use kiln_tensor::{DType, Tensor, TensorMap};
//!
//! let w = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
//! let t = w.transpose();
//! assert!(!t.is_contiguous());
//!
//! let mut map = TensorMap::new();
//! map.insert("proj.weight", t.to_contiguous().cast(DType::BF16).unwrap());
//! assert_eq!(map.total_bytes(), 8);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod device;
pub mod map;
pub mod shape;
pub mod tensor;

pub use device::Device;
pub use map::TensorMap;
pub use shape::Shape;
pub use tensor::{DType, Element, Tensor, TensorRecord};

/// Error types for tensor operations.
#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    /// Shape mismatch error.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The actual shape.
        got: Vec<usize>,
    },

    /// Invalid shape error.
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// Data type mismatch error.
    #[error("DType mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// The expected data type.
        expected: DType,
        /// The actual data type.
        got: DType,
    },

    /// Operation not supported error.
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

/// Result type for tensor operations.
pub type TensorResult<T> = Result<T, TensorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_error_display() {
        let err = TensorError::ShapeMismatch {
            expected: vec![2, 3],
            got: vec![3, 2],
        };
        assert!(format!("{}", err).contains("Shape mismatch"));

        let err = TensorError::DTypeMismatch {
            expected: DType::F32,
            got: DType::BF16,
        };
        assert_eq!(
            err.to_string(),
            "DType mismatch: expected float32, got bfloat16"
        );
    }

    #[test]
    fn test_map_of_mixed_dtypes() {
        let mut map = TensorMap::new();
        map.insert("steps", Tensor::from_vec(vec![7i64], &[1]).unwrap());
        map.insert("w", Tensor::zeros(DType::F64, &[2, 2]));
        assert_eq!(map.total_bytes(), 8 + 32);
        assert_eq!(map.get("w").map(|t| t.shape()), Some(Shape::from([2, 2])));
    }
}
