//! Legacy single-archive checkpoints.
//!
//! The archive is one MessagePack document whose top-level map has exactly
//! one key, `state_dict`, holding the converted tensors.

use crate::{io_err, CheckpointError, Result};
use kiln_tensor::TensorMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize)]
struct ArchiveRef<'a> {
    state_dict: &'a TensorMap,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Archive {
    state_dict: TensorMap,
}

/// Writer for legacy archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyArchiveWriter;

impl LegacyArchiveWriter {
    /// Writes `state_dict` wrapped under the `state_dict` key.
    ///
    /// Tensors are written in their current dtype; callers normalize first.
    pub fn write(state_dict: &TensorMap, dest: &Path) -> Result<()> {
        tracing::info!(
            path = %dest.display(),
            tensors = state_dict.len(),
            "Writing legacy archive"
        );
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let bytes = rmp_serde::to_vec_named(&ArchiveRef { state_dict })
            .map_err(|e| CheckpointError::encoding("MessagePack serialization", e))?;
        std::fs::write(dest, &bytes).map_err(io_err(dest))?;
        tracing::debug!(path = %dest.display(), size = bytes.len(), "Legacy archive written");
        Ok(())
    }
}

/// Reads the `state_dict` of a legacy archive.
pub fn read_legacy_archive(path: &Path) -> Result<TensorMap> {
    if !path.exists() {
        return Err(CheckpointError::NotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path).map_err(io_err(path))?;
    let archive: Archive = rmp_serde::from_slice(&bytes)
        .map_err(|e| CheckpointError::Corrupted(format!("invalid legacy archive: {}", e)))?;
    Ok(archive.state_dict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_tensor::{DType, Tensor};
    use serde::de::IgnoredAny;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn test_archive_has_single_state_dict_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/model.ckpt");
        let mut map = TensorMap::new();
        map.insert("final_layer.linear.weight", Tensor::zeros(DType::F16, &[2, 2]));
        map.insert("t_block.1.bias", Tensor::zeros(DType::F16, &[2]));
        LegacyArchiveWriter::write(&map, &path).unwrap();

        let raw: BTreeMap<String, IgnoredAny> =
            rmp_serde::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw.keys().collect::<Vec<_>>(), vec!["state_dict"]);

        assert_eq!(read_legacy_archive(&path).unwrap(), map);
    }

    #[test]
    fn test_rejects_foreign_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        std::fs::write(&path, rmp_serde::to_vec_named(&BTreeMap::from([("weights", 1u8)])).unwrap())
            .unwrap();
        assert!(matches!(
            read_legacy_archive(&path),
            Err(CheckpointError::Corrupted(_))
        ));
    }
}
