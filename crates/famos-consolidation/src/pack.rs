//! Period pack files with block-level dedup.
//!
//! Low-value duplicate blobs leave the hot stores and land in
//! `packs/<period>/<hash>.pack` files. Blocks are addressed by content hash,
//! so packing the same text twice stores it once.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

use crate::ConsolidationError;

/// Content-addressed pack storage under a root directory.
#[derive(Debug, Clone)]
pub struct PackStore {
    root: PathBuf,
}

impl PackStore {
    /// Open (creating) the pack root, usually `consolidation/packs/`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ConsolidationError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn period_dir(&self, period: &str) -> PathBuf {
        self.root.join(period)
    }

    /// Pack one blob into a period, returning its content hash. A blob
    /// already packed in the period is not written again.
    pub fn pack(&self, period: &str, content: &[u8]) -> Result<String, ConsolidationError> {
        let hash = blake3::hash(content).to_hex().to_string();
        let dir = self.period_dir(period);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{hash}.pack"));
        if path.exists() {
            return Ok(hash);
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(content)?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(hash)
    }

    /// Read a packed blob back.
    pub fn read(&self, period: &str, hash: &str) -> Result<Option<Vec<u8>>, ConsolidationError> {
        let path = self.period_dir(period).join(format!("{hash}.pack"));
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Distinct block hashes stored for a period.
    pub fn block_count(&self, period: &str) -> Result<usize, ConsolidationError> {
        let dir = self.period_dir(period);
        if !dir.exists() {
            return Ok(0);
        }
        let mut hashes = HashSet::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "pack").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    hashes.insert(stem.to_string());
                }
            }
        }
        Ok(hashes.len())
    }
}
