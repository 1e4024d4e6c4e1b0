//! Per-KB source-file digest sidecar (`kb_hashes.json`).
//!
//! Each KB records a digest per source file at ingest time. At startup the
//! loader compares digests for the current files; any mismatch or a missing
//! sidecar means the collection is stale and must be dropped and rebuilt.
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::StoreError;

pub const MANIFEST_FILE: &str = "kb_hashes.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KbManifest {
    hashes: BTreeMap<String, String>,
}

impl KbManifest {
    pub fn digest(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Load the sidecar; `None` when it does not exist (first run or wiped).
    pub fn load(dir: &Path) -> Result<Option<Self>, StoreError> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Decode(format!("manifest {}: {e}", path.display())))
    }

    pub fn save(&self, dir: &Path) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Decode(format!("manifest encode: {e}")))?;
        std::fs::write(dir.join(MANIFEST_FILE), raw)?;
        Ok(())
    }

    pub fn record(&mut self, file_name: impl Into<String>, bytes: &[u8]) {
        self.hashes.insert(file_name.into(), Self::digest(bytes));
    }

    /// True when the recorded digests differ from the given files in any
    /// way: changed content, added files, or removed files.
    pub fn is_stale(&self, files: &[(String, Vec<u8>)]) -> bool {
        if files.len() != self.hashes.len() {
            return true;
        }
        files.iter().any(|(name, bytes)| {
            self.hashes
                .get(name)
                .is_none_or(|recorded| *recorded != Self::digest(bytes))
        })
    }
}
