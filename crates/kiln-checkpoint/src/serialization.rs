//! Encoding of optimizer and EMA state files.
//!
//! Snapshot side files are written through a [`StateCodec`], which pairs a
//! serialization format with optional gzip compression.
//!
//! # Serialization Formats
//!
//! - [`StateFormat::Bincode`]: fast binary format, the default
//! - [`StateFormat::MessagePack`]: compact and portable binary format
//! - [`StateFormat::Json`]: human-readable, good for debugging
//!
//! # Examples
//!
//! ```no_run
//! use kiln_checkpoint::{CompressionType, OptimizerState, StateCodec, StateFormat};
//! use std::path::Path;
//!
//! fn main() -> kiln_checkpoint::Result<()> {
//!     let codec = StateCodec::new(StateFormat::MessagePack)
//!         .with_compression(CompressionType::Gzip);
//!     let path = Path::new("/tmp/snapshot/optimizer").join(codec.file_name("optimizer"));
//!     assert!(path.ends_with("optimizer.msgpack.gz"));
//!
//!     codec.write_to_file(&path, &OptimizerState::new("adamw"))?;
//!     let restored: OptimizerState = codec.read_from_file(&path)?;
//!     Ok(())
//! }
//! ```

use crate::{io_err, CheckpointError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;

/// Serialization format for state files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateFormat {
    /// bincode.
    #[default]
    Bincode,
    /// MessagePack with named fields.
    MessagePack,
    /// JSON.
    Json,
}

impl StateFormat {
    /// File extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            StateFormat::Bincode => "bin",
            StateFormat::MessagePack => "msgpack",
            StateFormat::Json => "json",
        }
    }
}

/// Compression type for state files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionType {
    /// No compression.
    #[default]
    None,
    /// Gzip compression.
    Gzip,
    /// Gzip compression with specified level (0-9); higher levels are rejected.
    GzipLevel(u32),
}

impl CompressionType {
    /// Get the flate2 compression level.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidConfig`] for levels above 9.
    fn compression_level(&self) -> Result<Compression> {
        match self {
            CompressionType::None => Ok(Compression::none()),
            CompressionType::Gzip => Ok(Compression::default()),
            CompressionType::GzipLevel(level) if *level <= 9 => Ok(Compression::new(*level)),
            CompressionType::GzipLevel(level) => Err(CheckpointError::InvalidConfig(format!(
                "gzip level must be 0-9, got {}",
                level
            ))),
        }
    }

    /// Check if compression is enabled.
    pub fn is_compressed(&self) -> bool {
        !matches!(self, CompressionType::None)
    }
}

/// Reads and writes serde values as state files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCodec {
    format: StateFormat,
    compression: CompressionType,
    pretty_json: bool,
}

impl StateCodec {
    /// Create an uncompressed codec for `format`.
    pub fn new(format: StateFormat) -> Self {
        Self {
            format,
            compression: CompressionType::None,
            pretty_json: false,
        }
    }

    /// Set the compression type.
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Pretty-print JSON output.
    pub fn with_pretty_json(mut self, pretty: bool) -> Self {
        self.pretty_json = pretty;
        self
    }

    /// The serialization format.
    pub fn format(&self) -> StateFormat {
        self.format
    }

    /// The compression type.
    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// File name for `stem`, e.g. `optimizer.bin` or `ema.json.gz`.
    pub fn file_name(&self, stem: &str) -> String {
        let mut name = format!("{}.{}", stem, self.format.extension());
        if self.compression.is_compressed() {
            name.push_str(".gz");
        }
        name
    }

    /// Serializes `value` to bytes (before compression).
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self.format {
            StateFormat::Bincode => bincode::serialize(value)
                .map_err(|e| CheckpointError::encoding("Bincode serialization", e)),
            StateFormat::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| CheckpointError::encoding("MessagePack serialization", e)),
            StateFormat::Json => {
                let result = if self.pretty_json {
                    serde_json::to_vec_pretty(value)
                } else {
                    serde_json::to_vec(value)
                };
                result.map_err(CheckpointError::Serialization)
            }
        }
    }

    /// Deserializes a value from bytes (after decompression).
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self.format {
            StateFormat::Bincode => bincode::deserialize(data).map_err(|e| {
                CheckpointError::Corrupted(format!("Bincode deserialization failed: {}", e))
            }),
            StateFormat::MessagePack => rmp_serde::from_slice(data).map_err(|e| {
                CheckpointError::Corrupted(format!("MessagePack deserialization failed: {}", e))
            }),
            StateFormat::Json => {
                serde_json::from_slice(data).map_err(CheckpointError::Deserialization)
            }
        }
    }

    /// Write `value` to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or I/O fails.
    pub fn write_to_file<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let level = self.compression.compression_level()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let data = self.encode(value)?;
        let final_data = if self.compression.is_compressed() {
            let mut encoder = GzEncoder::new(Vec::new(), level);
            encoder.write_all(&data).map_err(io_err(path))?;
            encoder.finish().map_err(io_err(path))?
        } else {
            data
        };

        std::fs::write(path, &final_data).map_err(io_err(path))?;

        tracing::debug!(
            path = %path.display(),
            format = ?self.format,
            compression = ?self.compression,
            size = final_data.len(),
            "State file written"
        );
        Ok(())
    }

    /// Read a value written by [`StateCodec::write_to_file`] with the same
    /// settings.
    pub fn read_from_file<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        if !path.exists() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read(path).map_err(io_err(path))?;
        let data = if self.compression.is_compressed() {
            let mut decoder = GzDecoder::new(raw.as_slice());
            let mut data = Vec::new();
            decoder.read_to_end(&mut data).map_err(|e| {
                CheckpointError::Corrupted(format!(
                    "{} is not valid gzip: {}",
                    path.display(),
                    e
                ))
            })?;
            data
        } else {
            raw
        };
        self.decode(&data)
    }
}
