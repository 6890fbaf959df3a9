//! Shape utilities for tensor dimensions.
//!
//! This module provides the [`Shape`] type used in tensor headers and the
//! shape arithmetic needed when tensors are fused or split along an axis.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, Index};

/// Represents the shape (dimensions) of a tensor.
///
/// # Examples
///
/// ```
/// use kiln_tensor::Shape;
///
/// let shape = Shape::new(vec![2, 3, 4]);
/// assert_eq!(shape.ndim(), 3);
/// assert_eq!(shape.numel(), 24);
/// assert_eq!(shape[0], 2);
/// ```
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Creates a new shape from the given dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// Creates a scalar shape (zero dimensions).
    ///
    /// ```
    /// use kiln_tensor::Shape;
    ///
    /// let shape = Shape::scalar();
    /// assert_eq!(shape.ndim(), 0);
    /// assert_eq!(shape.numel(), 1);
    /// ```
    pub fn scalar() -> Self {
        Self { dims: vec![] }
    }

    /// Returns the number of dimensions.
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Returns the total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns the dimensions as a slice.
    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }

    /// Consumes the shape and returns the dimensions.
    pub fn into_vec(self) -> Vec<usize> {
        self.dims
    }

    /// Returns row-major (contiguous) strides for this shape, in elements.
    ///
    /// ```
    /// use kiln_tensor::Shape;
    ///
    /// assert_eq!(Shape::new(vec![2, 3, 4]).strides(), vec![12, 4, 1]);
    /// ```
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.dims.len()];
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Shape produced by concatenating `parts` along `axis`.
    ///
    /// Returns `None` when the parts disagree on rank or on any dimension
    /// other than `axis`, or when `axis` is out of range.
    pub fn concat(parts: &[&Shape], axis: usize) -> Option<Shape> {
        let first = parts.first()?;
        if axis >= first.ndim() {
            return None;
        }
        let mut dims = first.dims.clone();
        dims[axis] = 0;
        for part in parts {
            if part.ndim() != first.ndim() {
                return None;
            }
            for (i, (&a, &b)) in part.dims.iter().zip(first.dims.iter()).enumerate() {
                if i != axis && a != b {
                    return None;
                }
            }
            dims[axis] += part.dims[axis];
        }
        Some(Shape::new(dims))
    }

    /// Shape of each of `parts` equal chunks when splitting along `axis`.
    ///
    /// Returns `None` if the axis is out of range or not evenly divisible.
    pub fn split_even(&self, axis: usize, parts: usize) -> Option<Shape> {
        if parts == 0 || axis >= self.ndim() || self.dims[axis] % parts != 0 {
            return None;
        }
        let mut dims = self.dims.clone();
        dims[axis] /= parts;
        Some(Shape::new(dims))
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, "]")
    }
}

impl Deref for Shape {
    type Target = [usize];

    fn deref(&self) -> &Self::Target {
        &self.dims
    }
}

impl Index<usize> for Shape {
    type Output = usize;

    fn index(&self, index: usize) -> &Self::Output {
        &self.dims[index]
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_numel() {
        assert_eq!(Shape::new(vec![2, 3, 4]).numel(), 24);
        assert_eq!(Shape::new(vec![0, 3]).numel(), 0);
        assert_eq!(Shape::scalar().numel(), 1);
    }

    #[test]
    fn test_shape_strides() {
        assert_eq!(Shape::from([4, 4]).strides(), vec![4, 1]);
        assert_eq!(Shape::from([5]).strides(), vec![1]);
        assert!(Shape::scalar().strides().is_empty());
    }

    #[test]
    fn test_shape_concat() {
        let a = Shape::from([2, 3]);
        let b = Shape::from([4, 3]);
        assert_eq!(Shape::concat(&[&a, &b], 0), Some(Shape::from([6, 3])));
        assert_eq!(Shape::concat(&[&a, &b], 1), None);
        assert_eq!(Shape::concat(&[&a, &b], 2), None);
        assert_eq!(Shape::concat(&[], 0), None);
    }

    #[test]
    fn test_shape_split_even() {
        let s = Shape::from([12, 8]);
        assert_eq!(s.split_even(0, 3), Some(Shape::from([4, 8])));
        assert_eq!(s.split_even(1, 3), None);
        assert_eq!(s.split_even(0, 0), None);
    }

    #[test]
    fn test_shape_display() {
        assert_eq!(format!("{}", Shape::from([2, 3])), "[2, 3]");
        assert_eq!(format!("{:?}", Shape::from([2])), "Shape([2])");
    }

    #[test]
    fn test_shape_serde_is_plain_list() {
        let json = serde_json::to_string(&Shape::from([4, 4])).unwrap();
        assert_eq!(json, "[4,4]");
    }
}
