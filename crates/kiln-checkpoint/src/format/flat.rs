//! Flat tensor files in the safetensors layout.
//!
//! ```text
//! [u64 little-endian header length N]
//! [N bytes of JSON: name -> {dtype, shape, data_offsets}, plus "__metadata__"]
//! [raw little-endian tensor bytes]
//! ```
//!
//! [`read_flat_header`] validates and parses the header without touching
//! the tensor payload.

use crate::provenance::ProvenanceHeader;
use crate::{io_err, CheckpointError, Result};
use kiln_tensor::{DType, Tensor, TensorMap};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Largest header accepted by the reader.
pub const MAX_HEADER_LEN: usize = 100_000_000;

const METADATA_KEY: &str = "__metadata__";

fn to_safetensors_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::F16 => Dtype::F16,
        DType::BF16 => Dtype::BF16,
        DType::F32 => Dtype::F32,
        DType::F64 => Dtype::F64,
        DType::I32 => Dtype::I32,
        DType::I64 => Dtype::I64,
        DType::U8 => Dtype::U8,
    }
}

fn from_safetensors_dtype(dtype: Dtype) -> Result<DType> {
    match dtype {
        Dtype::F16 => Ok(DType::F16),
        Dtype::BF16 => Ok(DType::BF16),
        Dtype::F32 => Ok(DType::F32),
        Dtype::F64 => Ok(DType::F64),
        Dtype::I32 => Ok(DType::I32),
        Dtype::I64 => Ok(DType::I64),
        Dtype::U8 => Ok(DType::U8),
        other => Err(CheckpointError::Corrupted(format!(
            "unsupported tensor dtype {:?}",
            other
        ))),
    }
}

fn dtype_from_tag(tag: &str) -> Option<DType> {
    match tag {
        "F16" => Some(DType::F16),
        "BF16" => Some(DType::BF16),
        "F32" => Some(DType::F32),
        "F64" => Some(DType::F64),
        "I32" => Some(DType::I32),
        "I64" => Some(DType::I64),
        "U8" => Some(DType::U8),
        _ => None,
    }
}

/// Encodes `tensors` into safetensors bytes.
pub(crate) fn encode(tensors: &TensorMap, metadata: Option<HashMap<String, String>>) -> Result<Vec<u8>> {
    let payloads: Vec<(&String, DType, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, t)| (name, t.dtype(), t.dims().to_vec(), t.to_le_bytes()))
        .collect();
    let views = payloads
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            TensorView::new(to_safetensors_dtype(*dtype), shape.clone(), bytes)
                .map(|view| (name.as_str(), view))
                .map_err(|e| CheckpointError::encoding(&format!("safetensors view of {}", name), e))
        })
        .collect::<Result<Vec<_>>>()?;
    safetensors::serialize(views, &metadata)
        .map_err(|e| CheckpointError::encoding("safetensors serialization", e))
}

/// Decodes safetensors bytes into tensors and header metadata.
pub(crate) fn decode(bytes: &[u8]) -> Result<(TensorMap, HashMap<String, String>)> {
    let (_, header) = SafeTensors::read_metadata(bytes)
        .map_err(|e| CheckpointError::Corrupted(format!("invalid safetensors header: {}", e)))?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let file = SafeTensors::deserialize(bytes)
        .map_err(|e| CheckpointError::Corrupted(format!("invalid safetensors data: {}", e)))?;

    let mut tensors = TensorMap::new();
    for (name, view) in file.tensors() {
        let dtype = from_safetensors_dtype(view.dtype())?;
        let tensor = Tensor::from_le_bytes(dtype, view.shape(), view.data())?;
        tensors.insert(name, tensor);
    }
    Ok((tensors, metadata))
}

/// Writes safetensors bytes to `dest`, creating parent directories.
pub(crate) fn write_file(
    tensors: &TensorMap,
    metadata: Option<HashMap<String, String>>,
    dest: &Path,
) -> Result<usize> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let bytes = encode(tensors, metadata)?;
    std::fs::write(dest, &bytes).map_err(io_err(dest))?;
    Ok(bytes.len())
}

/// Writer for flat tensor files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatTensorFileWriter;

impl FlatTensorFileWriter {
    /// Writes `tensors` with `header` embedded as `__metadata__`.
    ///
    /// Tensors are written in their current dtype; callers normalize first.
    pub fn write(tensors: &TensorMap, header: &ProvenanceHeader, dest: &Path) -> Result<()> {
        tracing::info!(
            path = %dest.display(),
            tensors = tensors.len(),
            model_type = %header.model_type,
            "Writing flat tensor file"
        );
        let size = write_file(tensors, Some(header.to_metadata()), dest)?;
        tracing::debug!(path = %dest.display(), size, "Flat tensor file written");
        Ok(())
    }
}

/// Location and type of one tensor inside a flat file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatTensorInfo {
    /// Element type.
    pub dtype: DType,
    /// Dimensions.
    pub shape: Vec<usize>,
    /// Byte range inside the payload.
    pub data_offsets: (usize, usize),
}

/// Parsed and validated header of a flat tensor file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatHeader {
    /// Tensors by name.
    pub tensors: BTreeMap<String, FlatTensorInfo>,
    /// `__metadata__` pairs.
    pub metadata: BTreeMap<String, String>,
    /// Length of the JSON header in bytes.
    pub header_len: usize,
    /// Length of the tensor payload in bytes.
    pub data_len: usize,
}

impl FlatHeader {
    /// Provenance record carried in the metadata.
    pub fn provenance(&self) -> Result<ProvenanceHeader> {
        ProvenanceHeader::from_metadata(&self.metadata)
    }
}

#[derive(Deserialize)]
struct RawTensorInfo {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// Reads and validates only the header of a flat tensor file.
///
/// The payload is never read; its length is taken from the file size.
pub fn read_flat_header(path: &Path) -> Result<FlatHeader> {
    if !path.exists() {
        return Err(CheckpointError::NotFound(path.to_path_buf()));
    }
    let mut file = File::open(path).map_err(io_err(path))?;
    let file_len = file.metadata().map_err(io_err(path))?.len() as usize;

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes).map_err(|_| {
        CheckpointError::Corrupted(format!("{} is too short for a header", path.display()))
    })?;
    let header_len = u64::from_le_bytes(len_bytes) as usize;
    if header_len > MAX_HEADER_LEN || header_len.saturating_add(8) > file_len {
        return Err(CheckpointError::Corrupted(format!(
            "header length {} does not fit in {} byte file",
            header_len, file_len
        )));
    }
    let mut header_bytes = vec![0u8; header_len];
    file.read_exact(&mut header_bytes).map_err(io_err(path))?;

    let mut raw: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(&header_bytes).map_err(CheckpointError::Deserialization)?;
    let metadata: BTreeMap<String, String> = match raw.remove(METADATA_KEY) {
        Some(value) => serde_json::from_value(value).map_err(CheckpointError::Deserialization)?,
        None => BTreeMap::new(),
    };

    let mut tensors = BTreeMap::new();
    for (name, value) in raw {
        let info: RawTensorInfo =
            serde_json::from_value(value).map_err(CheckpointError::Deserialization)?;
        let dtype = dtype_from_tag(&info.dtype).ok_or_else(|| {
            CheckpointError::Corrupted(format!("{} has unsupported dtype {}", name, info.dtype))
        })?;
        tensors.insert(
            name,
            FlatTensorInfo {
                dtype,
                shape: info.shape,
                data_offsets: (info.data_offsets[0], info.data_offsets[1]),
            },
        );
    }

    let data_len = file_len - 8 - header_len;
    validate_offsets(&tensors, data_len)?;

    tracing::debug!(
        path = %path.display(),
        tensors = tensors.len(),
        header_len,
        data_len,
        "Read flat tensor header"
    );

    Ok(FlatHeader {
        tensors,
        metadata,
        header_len,
        data_len,
    })
}

/// Tensors must tile the payload exactly, in offset order, starting at zero.
fn validate_offsets(tensors: &BTreeMap<String, FlatTensorInfo>, data_len: usize) -> Result<()> {
    let mut spans: Vec<(&String, &FlatTensorInfo)> = tensors.iter().collect();
    spans.sort_by_key(|(_, info)| info.data_offsets);

    let mut cursor = 0usize;
    for (name, info) in spans {
        let (start, end) = info.data_offsets;
        let expected = info
            .shape
            .iter()
            .try_fold(info.dtype.size_in_bytes(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| CheckpointError::Corrupted(format!("{} is too large", name)))?;
        if start != cursor || end < start || end - start != expected {
            return Err(CheckpointError::Corrupted(format!(
                "{} has offsets [{}, {}], expected {} bytes at {}",
                name, start, end, expected, cursor
            )));
        }
        cursor = end;
    }
    if cursor != data_len {
        return Err(CheckpointError::Corrupted(format!(
            "payload is {} bytes but tensors cover {}",
            data_len, cursor
        )));
    }
    Ok(())
}

/// Tensors and metadata of a flat tensor file.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatTensorFile {
    /// Tensors by name.
    pub tensors: TensorMap,
    /// `__metadata__` pairs.
    pub metadata: HashMap<String, String>,
}

impl FlatTensorFile {
    /// Provenance record carried in the metadata.
    pub fn provenance(&self) -> Result<ProvenanceHeader> {
        ProvenanceHeader::from_metadata(&self.metadata)
    }
}

/// Reads a flat tensor file completely.
pub fn read_flat_tensor_file(path: &Path) -> Result<FlatTensorFile> {
    if !path.exists() {
        return Err(CheckpointError::NotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path).map_err(io_err(path))?;
    let (tensors, metadata) = decode(&bytes)?;
    tracing::info!(path = %path.display(), tensors = tensors.len(), "Read flat tensor file");
    Ok(FlatTensorFile { tensors, metadata })
}
