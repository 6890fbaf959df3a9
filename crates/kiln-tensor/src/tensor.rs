//! Host tensor values and their data types.
//!
//! [`Tensor`] is an owned n-dimensional array tagged with its element type.
//! Each variant wraps an `ndarray::ArrayD`, so strides and layout follow
//! ndarray: a tensor is contiguous when it is in standard (row-major) layout.
//! Cloning a tensor always copies its storage.

use std::fmt;

use half::{bf16, f16};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};

use crate::shape::Shape;
use crate::{TensorError, TensorResult};

/// Data types supported by tensors.
///
/// # Examples
///
/// ```
/// use kiln_tensor::DType;
///
/// assert_eq!(DType::BF16.size_in_bytes(), 2);
/// assert!(DType::F16.is_float());
/// assert!(DType::I64.is_integer());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DType {
    /// 16-bit IEEE 754 half precision.
    F16,
    /// 16-bit brain floating point.
    BF16,
    /// 32-bit floating point.
    F32,
    /// 64-bit floating point.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// Unsigned byte.
    U8,
}

impl DType {
    /// Returns the size of this data type in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    /// Returns a human-readable name for this data type.
    pub fn name(&self) -> &'static str {
        match self {
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
        }
    }

    /// Returns whether this is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Returns whether this is an integer type.
    pub fn is_integer(&self) -> bool {
        matches!(self, DType::I32 | DType::I64 | DType::U8)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Element types that can back a [`Tensor`].
pub trait Element: Copy + fmt::Debug + 'static {
    /// The tensor data type for this element.
    const DTYPE: DType;

    /// Appends the little-endian encoding of `self` to `out`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decodes one element from exactly `size_in_bytes` little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Wraps an array of this element type into a tensor.
    fn wrap(array: ArrayD<Self>) -> Tensor;

    /// Borrows the array of a tensor holding this element type.
    fn array_of(tensor: &Tensor) -> Option<&ArrayD<Self>>;

    /// Mutably borrows the array of a tensor holding this element type.
    fn array_of_mut(tensor: &mut Tensor) -> Option<&mut ArrayD<Self>>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, $size:expr) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $size];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }

            fn wrap(array: ArrayD<Self>) -> Tensor {
                Tensor::$variant(array)
            }

            fn array_of(tensor: &Tensor) -> Option<&ArrayD<Self>> {
                match tensor {
                    Tensor::$variant(a) => Some(a),
                    _ => None,
                }
            }

            fn array_of_mut(tensor: &mut Tensor) -> Option<&mut ArrayD<Self>> {
                match tensor {
                    Tensor::$variant(a) => Some(a),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f16, F16, 2);
impl_element!(bf16, BF16, 2);
impl_element!(f32, F32, 4);
impl_element!(f64, F64, 8);
impl_element!(i32, I32, 4);
impl_element!(i64, I64, 8);
impl_element!(u8, U8, 1);

/// An owned, typed n-dimensional array.
///
/// # Examples
///
/// ```
/// use kiln_tensor::{DType, Tensor};
///
/// let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
/// assert_eq!(t.dtype(), DType::F32);
/// assert!(t.is_contiguous());
///
/// let half = t.cast(DType::F16).unwrap();
/// assert_eq!(half.dtype(), DType::F16);
/// assert_eq!(half.nbytes(), 8);
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "TensorRecord", try_from = "TensorRecord")]
pub enum Tensor {
    /// Half-precision values.
    F16(ArrayD<f16>),
    /// Brain-float values.
    BF16(ArrayD<bf16>),
    /// Single-precision values.
    F32(ArrayD<f32>),
    /// Double-precision values.
    F64(ArrayD<f64>),
    /// 32-bit integers.
    I32(ArrayD<i32>),
    /// 64-bit integers.
    I64(ArrayD<i64>),
    /// Bytes.
    U8(ArrayD<u8>),
}

/// Applies `$body` to the wrapped array, whatever its element type.
macro_rules! with_array {
    ($tensor:expr, $a:ident => $body:expr) => {
        match $tensor {
            Tensor::F16($a) => $body,
            Tensor::BF16($a) => $body,
            Tensor::F32($a) => $body,
            Tensor::F64($a) => $body,
            Tensor::I32($a) => $body,
            Tensor::I64($a) => $body,
            Tensor::U8($a) => $body,
        }
    };
}

/// Like `with_array!`, but rewraps the result in the same variant.
macro_rules! map_array {
    ($tensor:expr, $a:ident => $body:expr) => {
        match $tensor {
            Tensor::F16($a) => Tensor::F16($body),
            Tensor::BF16($a) => Tensor::BF16($body),
            Tensor::F32($a) => Tensor::F32($body),
            Tensor::F64($a) => Tensor::F64($body),
            Tensor::I32($a) => Tensor::I32($body),
            Tensor::I64($a) => Tensor::I64($body),
            Tensor::U8($a) => Tensor::U8($body),
        }
    };
}

/// Number of `elem_size`-byte units a shape holds, failing on overflow.
fn checked_len(shape: &[usize], elem_size: usize) -> TensorResult<usize> {
    shape
        .iter()
        .try_fold(elem_size, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| TensorError::InvalidShape(format!("shape {:?} is too large", shape)))
}

impl Tensor {
    /// Builds a tensor from row-major values.
    pub fn from_vec<T: Element>(values: Vec<T>, shape: &[usize]) -> TensorResult<Self> {
        let expected = checked_len(shape, 1)?;
        if values.len() != expected {
            return Err(TensorError::InvalidShape(format!(
                "{} values cannot fill shape {:?}",
                values.len(),
                shape
            )));
        }
        let array = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| TensorError::InvalidShape(e.to_string()))?;
        Ok(T::wrap(array))
    }

    /// Creates a zero-filled tensor of the given dtype.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        let dim = IxDyn(shape);
        match dtype {
            DType::F16 => Tensor::F16(ArrayD::from_elem(dim, f16::ZERO)),
            DType::BF16 => Tensor::BF16(ArrayD::from_elem(dim, bf16::ZERO)),
            DType::F32 => Tensor::F32(ArrayD::zeros(dim)),
            DType::F64 => Tensor::F64(ArrayD::zeros(dim)),
            DType::I32 => Tensor::I32(ArrayD::zeros(dim)),
            DType::I64 => Tensor::I64(ArrayD::zeros(dim)),
            DType::U8 => Tensor::U8(ArrayD::zeros(dim)),
        }
    }

    /// Returns the data type of the tensor.
    pub fn dtype(&self) -> DType {
        match self {
            Tensor::F16(_) => DType::F16,
            Tensor::BF16(_) => DType::BF16,
            Tensor::F32(_) => DType::F32,
            Tensor::F64(_) => DType::F64,
            Tensor::I32(_) => DType::I32,
            Tensor::I64(_) => DType::I64,
            Tensor::U8(_) => DType::U8,
        }
    }

    /// Returns the dimensions of the tensor.
    pub fn dims(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> Shape {
        Shape::from(self.dims())
    }

    /// Returns the element strides of the tensor.
    pub fn strides(&self) -> &[isize] {
        with_array!(self, a => a.strides())
    }

    /// Returns the number of elements.
    pub fn numel(&self) -> usize {
        with_array!(self, a => a.len())
    }

    /// Returns the payload size in bytes.
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }

    /// Returns whether the tensor is in standard row-major layout.
    pub fn is_contiguous(&self) -> bool {
        with_array!(self, a => a.is_standard_layout())
    }

    /// Returns a contiguous copy of this tensor.
    pub fn to_contiguous(&self) -> Tensor {
        map_array!(self, a => a.as_standard_layout().into_owned())
    }

    /// Consumes the tensor and returns it in contiguous layout, copying only
    /// when the layout is not already standard.
    pub fn into_contiguous(self) -> Tensor {
        if self.is_contiguous() {
            self
        } else {
            self.to_contiguous()
        }
    }

    /// Returns the transposed tensor (all axes reversed).
    ///
    /// The result shares no storage with `self` and is generally not
    /// contiguous.
    pub fn transpose(&self) -> Tensor {
        map_array!(self, a => a.clone().reversed_axes())
    }

    /// Borrows the underlying array when it holds elements of type `T`.
    pub fn array<T: Element>(&self) -> Option<&ArrayD<T>> {
        T::array_of(self)
    }

    /// Mutably borrows the underlying array when it holds elements of type `T`.
    pub fn array_mut<T: Element>(&mut self) -> Option<&mut ArrayD<T>> {
        T::array_of_mut(self)
    }

    /// Casts a floating-point tensor to another floating-point dtype.
    ///
    /// Every value is rounded exactly once: narrow formats widen losslessly
    /// through `f32` before being narrowed to the target. Casting to the
    /// tensor's own dtype returns a copy. Integer tensors can only be "cast"
    /// to their own dtype.
    pub fn cast(&self, target: DType) -> TensorResult<Tensor> {
        if self.dtype() == target {
            return Ok(self.clone());
        }
        let cast = match (self, target) {
            (Tensor::F16(a), DType::BF16) => Tensor::BF16(a.mapv(|v| bf16::from_f32(v.to_f32()))),
            (Tensor::F16(a), DType::F32) => Tensor::F32(a.mapv(f16::to_f32)),
            (Tensor::F16(a), DType::F64) => Tensor::F64(a.mapv(f16::to_f64)),
            (Tensor::BF16(a), DType::F16) => Tensor::F16(a.mapv(|v| f16::from_f32(v.to_f32()))),
            (Tensor::BF16(a), DType::F32) => Tensor::F32(a.mapv(bf16::to_f32)),
            (Tensor::BF16(a), DType::F64) => Tensor::F64(a.mapv(bf16::to_f64)),
            (Tensor::F32(a), DType::F16) => Tensor::F16(a.mapv(f16::from_f32)),
            (Tensor::F32(a), DType::BF16) => Tensor::BF16(a.mapv(bf16::from_f32)),
            (Tensor::F32(a), DType::F64) => Tensor::F64(a.mapv(f64::from)),
            (Tensor::F64(a), DType::F16) => Tensor::F16(a.mapv(f16::from_f64)),
            (Tensor::F64(a), DType::BF16) => Tensor::BF16(a.mapv(bf16::from_f64)),
            (Tensor::F64(a), DType::F32) => Tensor::F32(a.mapv(|v| v as f32)),
            _ => {
                return Err(TensorError::NotSupported(format!(
                    "cast from {} to {}",
                    self.dtype(),
                    target
                )))
            }
        };
        Ok(cast)
    }

    /// Returns the values widened to `f64`, in logical row-major order.
    ///
    /// Intended for value comparisons; integer values are converted with `as`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Tensor::F16(a) => a.iter().map(|v| v.to_f64()).collect(),
            Tensor::BF16(a) => a.iter().map(|v| v.to_f64()).collect(),
            Tensor::F32(a) => a.iter().map(|&v| f64::from(v)).collect(),
            Tensor::F64(a) => a.iter().copied().collect(),
            Tensor::I32(a) => a.iter().map(|&v| f64::from(v)).collect(),
            Tensor::I64(a) => a.iter().map(|&v| v as f64).collect(),
            Tensor::U8(a) => a.iter().map(|&v| f64::from(v)).collect(),
        }
    }

    /// Encodes the elements as little-endian bytes in logical row-major order,
    /// regardless of the in-memory layout.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.nbytes());
        with_array!(self, a => {
            for v in a.iter() {
                v.write_le(&mut out);
            }
        });
        out
    }

    /// Decodes a contiguous little-endian payload.
    pub fn from_le_bytes(dtype: DType, shape: &[usize], bytes: &[u8]) -> TensorResult<Tensor> {
        fn decode<T: Element>(shape: &[usize], bytes: &[u8]) -> TensorResult<Tensor> {
            let size = T::DTYPE.size_in_bytes();
            let values: Vec<T> = bytes.chunks_exact(size).map(T::read_le).collect();
            Tensor::from_vec(values, shape)
        }

        let expected = checked_len(shape, dtype.size_in_bytes())?;
        if bytes.len() != expected {
            return Err(TensorError::InvalidShape(format!(
                "{} bytes of {} cannot fill shape {:?} ({} bytes expected)",
                bytes.len(),
                dtype,
                shape,
                expected
            )));
        }
        match dtype {
            DType::F16 => decode::<f16>(shape, bytes),
            DType::BF16 => decode::<bf16>(shape, bytes),
            DType::F32 => decode::<f32>(shape, bytes),
            DType::F64 => decode::<f64>(shape, bytes),
            DType::I32 => decode::<i32>(shape, bytes),
            DType::I64 => decode::<i64>(shape, bytes),
            DType::U8 => decode::<u8>(shape, bytes),
        }
    }

    /// Concatenates tensors of one dtype along `axis`.
    pub fn concat(parts: &[&Tensor], axis: usize) -> TensorResult<Tensor> {
        fn join<T: Element>(parts: &[&Tensor], axis: usize) -> TensorResult<Tensor> {
            let views: Vec<ArrayViewD<'_, T>> = parts
                .iter()
                .map(|t| {
                    t.array::<T>().map(|a| a.view()).ok_or(TensorError::DTypeMismatch {
                        expected: T::DTYPE,
                        got: t.dtype(),
                    })
                })
                .collect::<TensorResult<_>>()?;
            let joined = ndarray::concatenate(Axis(axis), &views)
                .map_err(|e| TensorError::InvalidShape(e.to_string()))?;
            Ok(T::wrap(joined))
        }

        let first = parts
            .first()
            .ok_or_else(|| TensorError::InvalidShape("nothing to concatenate".to_string()))?;
        let shapes: Vec<Shape> = parts.iter().map(|t| t.shape()).collect();
        let shape_refs: Vec<&Shape> = shapes.iter().collect();
        if Shape::concat(&shape_refs, axis).is_none() {
            return Err(TensorError::ShapeMismatch {
                expected: first.dims().to_vec(),
                got: shapes
                    .iter()
                    .find(|s| s.as_slice() != first.dims())
                    .map(|s| s.as_slice().to_vec())
                    .unwrap_or_default(),
            });
        }
        match first.dtype() {
            DType::F16 => join::<f16>(parts, axis),
            DType::BF16 => join::<bf16>(parts, axis),
            DType::F32 => join::<f32>(parts, axis),
            DType::F64 => join::<f64>(parts, axis),
            DType::I32 => join::<i32>(parts, axis),
            DType::I64 => join::<i64>(parts, axis),
            DType::U8 => join::<u8>(parts, axis),
        }
    }

    /// Splits the tensor into `parts` equally sized tensors along `axis`.
    ///
    /// Each returned tensor owns its storage and is contiguous.
    pub fn split_even(&self, axis: usize, parts: usize) -> TensorResult<Vec<Tensor>> {
        let part_shape = self.shape().split_even(axis, parts).ok_or_else(|| {
            TensorError::InvalidShape(format!(
                "cannot split shape {} into {} equal parts along axis {}",
                self.shape(),
                parts,
                axis
            ))
        })?;
        let step = part_shape[axis];
        let chunks = (0..parts)
            .map(|i| {
                let range = Slice::from(i * step..(i + 1) * step);
                map_array!(self, a => a
                    .slice_axis(Axis(axis), range)
                    .as_standard_layout()
                    .into_owned())
            })
            .collect();
        Ok(chunks)
    }
}

impl PartialEq for Tensor {
    /// Bit-exact equality: same dtype, same shape and same element bytes.
    fn eq(&self, other: &Self) -> bool {
        self.dtype() == other.dtype()
            && self.dims() == other.dims()
            && self.to_le_bytes() == other.to_le_bytes()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype())
            .field("shape", &self.dims())
            .field("contiguous", &self.is_contiguous())
            .finish()
    }
}

/// Serialized form of a [`Tensor`]: dtype, shape and contiguous LE bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorRecord {
    /// Element type.
    pub dtype: DType,
    /// Dimensions.
    pub shape: Shape,
    /// Little-endian payload in row-major order.
    pub data: Vec<u8>,
}

impl From<Tensor> for TensorRecord {
    fn from(tensor: Tensor) -> Self {
        Self {
            dtype: tensor.dtype(),
            shape: tensor.shape(),
            data: tensor.to_le_bytes(),
        }
    }
}

impl TryFrom<TensorRecord> for Tensor {
    type Error = TensorError;

    fn try_from(record: TensorRecord) -> TensorResult<Self> {
        Tensor::from_le_bytes(record.dtype, &record.shape, &record.data)
    }
}
