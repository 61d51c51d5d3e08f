//! On-disk artifact store
//!
//! Layout under the base directory:
//! ```text
//! <base_dir>/
//! ├── gpt2-medium/
//! │   ├── model.safetensors
//! │   ├── model.safetensors.fp16.bin
//! │   ├── model.safetensors.int8.bin
//! │   ├── model.safetensors.backup
//! │   ├── config.json
//! │   └── tokenizer.json
//! └── minilm/
//!     └── ...
//! ```
//!
//! Staging directories (`.staging-*`) live inside the model directory while a
//! download is in flight so the final rename stays on one filesystem.

use super::descriptor::ModelDescriptor;
use super::quantize::PrecisionLevel;
use std::path::{Path, PathBuf};

/// Suffix for a weights file that failed plausibility checks and was kept
pub const BACKUP_SUFFIX: &str = "backup";

/// Prefix of per-download staging directories
pub const STAGING_PREFIX: &str = ".staging-";

/// Minimum size, in bytes, for a weights file to count as real
pub const DEFAULT_MIN_PLAUSIBLE_SIZE: u64 = 1_000_000;

/// Where model files live and whether they look usable
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_dir: PathBuf,
    min_plausible_size: u64,
}

impl ArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>, min_plausible_size: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            min_plausible_size,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn min_plausible_size(&self) -> u64 {
        self.min_plausible_size
    }

    /// Directory holding every file of one model
    pub fn model_dir(&self, desc: &ModelDescriptor) -> PathBuf {
        desc.model_dir()
    }

    pub fn weights_path(&self, desc: &ModelDescriptor) -> PathBuf {
        desc.weights_path()
    }

    /// `<weights>.backup`
    pub fn backup_path(&self, desc: &ModelDescriptor) -> PathBuf {
        desc.file_path(&format!("{}.{}", desc.weights_file, BACKUP_SUFFIX))
    }

    /// First unused backup name: `<weights>.backup`, then `<weights>.backup.1`, ...
    pub fn next_backup_path(&self, desc: &ModelDescriptor) -> PathBuf {
        let base = self.backup_path(desc);
        if !base.exists() {
            return base;
        }
        let mut n = 1u32;
        loop {
            let candidate = desc.file_path(&format!("{}.{}.{}", desc.weights_file, BACKUP_SUFFIX, n));
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }

    /// `<weights>.<precision>.bin`; FP32 is the source weights file itself
    pub fn variant_path(&self, desc: &ModelDescriptor, level: PrecisionLevel) -> PathBuf {
        match level {
            PrecisionLevel::Fp32 => desc.weights_path(),
            _ => desc.file_path(&format!("{}.{}.bin", desc.weights_file, level)),
        }
    }

    /// Size of a regular file, or None when it does not exist
    pub fn file_size(&self, path: &Path) -> Option<u64> {
        std::fs::metadata(path)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    pub fn is_plausible_size(&self, size: u64) -> bool {
        size > self.min_plausible_size
    }

    /// Weights present and larger than the plausibility threshold
    pub fn has_plausible_weights(&self, desc: &ModelDescriptor) -> bool {
        self.file_size(&desc.weights_path())
            .is_some_and(|size| self.is_plausible_size(size))
    }

    /// Required files that are not on disk yet
    ///
    /// An implausibly small weights file counts as missing.
    pub fn missing_files(&self, desc: &ModelDescriptor) -> Vec<String> {
        desc.required_files()
            .into_iter()
            .filter(|file| {
                if desc.is_weights(file) {
                    !self.has_plausible_weights(desc)
                } else {
                    self.file_size(&desc.file_path(file)).is_none()
                }
            })
            .map(str::to_string)
            .collect()
    }

    /// Every required file present with plausible weights
    pub fn is_complete(&self, desc: &ModelDescriptor) -> bool {
        self.missing_files(desc).is_empty()
    }

    /// Total size of the model directory in bytes
    pub fn model_size(&self, desc: &ModelDescriptor) -> Option<u64> {
        let dir = desc.model_dir();
        if !dir.exists() {
            return None;
        }
        Some(dir_size(&dir))
    }

    /// Model directory names found under the base directory
    pub fn list_model_dirs(&self) -> Vec<String> {
        let mut names = Vec::new();

        if let Ok(entries) = std::fs::read_dir(&self.base_dir) {
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with('.') {
                    names.push(name);
                }
            }
        }

        names.sort();
        names
    }

    /// Remove staging directories left behind by a crashed process
    pub fn sweep_stale_staging(&self, desc: &ModelDescriptor) -> usize {
        let mut removed = 0;

        if let Ok(entries) = std::fs::read_dir(desc.model_dir()) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(STAGING_PREFIX) && entry.path().is_dir() {
                    match std::fs::remove_dir_all(entry.path()) {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            tracing::warn!(path = ?entry.path(), error = %e, "Failed to remove stale staging directory")
                        }
                    }
                }
            }
        }

        removed
    }
}

/// Recursively calculate directory size
fn dir_size(path: &Path) -> u64 {
    let mut size = 0;

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                size += dir_size(&path);
            } else if let Ok(metadata) = std::fs::metadata(&path) {
                size += metadata.len();
            }
        }
    }

    size
}
