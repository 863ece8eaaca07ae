//! Filesystem store for the single-file model artifact.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

use super::TEMP_EXTENSION;

/// Anything smaller than this cannot be a complete model package; it is a
/// truncated download left over from a crash or a failed transfer.
pub const DEFAULT_MIN_PLAUSIBLE_BYTES: u64 = 10 * 1024 * 1024;

const HEAD_PROBE_BYTES: usize = 8192;

/// A validated, on-disk artifact.
#[derive(Clone, Debug)]
pub struct InstalledArtifact {
    pub path: PathBuf,
    pub byte_size: u64,
    pub validated_at: SystemTime,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorruptionReason {
    #[error("artifact file is missing")]
    Missing,
    #[error("artifact file is not readable: {0}")]
    NotReadable(String),
    #[error("artifact is implausibly small ({actual} bytes)")]
    ImplausiblySmall { actual: u64 },
    #[error("artifact size {actual} outside tolerance of expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("artifact head block is unreadable: {0}")]
    HeadUnreadable(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("install left destination incomplete: {copied} of {expected} bytes")]
    InstallSizeMismatch { expected: u64, copied: u64 },
}

impl StoreError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Io(_) => {
                "The app could not read or write its model files. Check disk space and permissions."
            }
            Self::InstallSizeMismatch { .. } => {
                "Installing the model failed part-way. Free up disk space and try again."
            }
        }
    }
}

pub struct ArtifactStore {
    root: PathBuf,
    extension: String,
    min_plausible_bytes: u64,
}

impl ArtifactStore {
    pub fn new(root: PathBuf, extension: &str) -> Self {
        Self {
            root,
            extension: extension.to_string(),
            min_plausible_bytes: DEFAULT_MIN_PLAUSIBLE_BYTES,
        }
    }

    /// Lowers the plausible-size floor. Test artifacts are tiny.
    pub fn min_plausible_bytes(mut self, bytes: u64) -> Self {
        self.min_plausible_bytes = bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn temp_path(&self, file_name: &str) -> PathBuf {
        self.root.join(format!("{file_name}.{TEMP_EXTENSION}"))
    }

    /// Files in the model directory with the configured extension. No side
    /// effects; validation is a separate step.
    pub fn list_candidates(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str())
            })
            .collect();
        candidates.sort();
        candidates
    }

    /// Checks existence, plausible size, expected-size tolerance and that
    /// the head block reads cleanly. The caller decides whether a corrupt
    /// file gets deleted.
    pub fn validate(
        &self,
        path: &Path,
        expected_bytes: Option<u64>,
    ) -> Result<InstalledArtifact, CorruptionReason> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CorruptionReason::Missing)
            }
            Err(err) => return Err(CorruptionReason::NotReadable(err.to_string())),
        };
        if !metadata.is_file() {
            return Err(CorruptionReason::Missing);
        }

        let actual = metadata.len();
        if actual < self.min_plausible_bytes {
            return Err(CorruptionReason::ImplausiblySmall { actual });
        }
        if let Some(expected) = expected_bytes {
            if !within_size_tolerance(expected, actual) {
                return Err(CorruptionReason::SizeMismatch { expected, actual });
            }
        }

        let mut head = [0u8; HEAD_PROBE_BYTES];
        match fs::File::open(path) {
            Ok(mut file) => {
                if let Err(err) = file.read(&mut head) {
                    return Err(CorruptionReason::HeadUnreadable(err.to_string()));
                }
            }
            Err(err) => return Err(CorruptionReason::NotReadable(err.to_string())),
        }

        Ok(InstalledArtifact {
            path: path.to_path_buf(),
            byte_size: actual,
            validated_at: SystemTime::now(),
        })
    }

    /// Moves a validated temp file under its final name. Rename is the fast
    /// path; a cross-device move falls back to copy + size re-verify +
    /// delete-source. A partially-written file is never visible under the
    /// final name.
    pub fn install_atomically(
        &self,
        tmp: &Path,
        final_name: &str,
    ) -> Result<InstalledArtifact, StoreError> {
        fs::create_dir_all(&self.root)?;
        let dest = self.artifact_path(final_name);

        match fs::rename(tmp, &dest) {
            Ok(()) => {}
            Err(rename_err) => {
                log::warn!(
                    "Rename install failed ({rename_err}), copying to {}",
                    dest.display()
                );
                let expected = fs::metadata(tmp)?.len();
                let copied = fs::copy(tmp, &dest)?;
                let landed = fs::metadata(&dest)?.len();
                if copied != expected || landed != expected {
                    let _ = fs::remove_file(&dest);
                    return Err(StoreError::InstallSizeMismatch {
                        expected,
                        copied: landed.min(copied),
                    });
                }
                fs::remove_file(tmp)?;
            }
        }

        let byte_size = fs::metadata(&dest)?.len();
        log::info!("Installed artifact {} ({byte_size} bytes)", dest.display());
        Ok(InstalledArtifact {
            path: dest,
            byte_size,
            validated_at: SystemTime::now(),
        })
    }

    /// Deletes temp files and implausibly small final files. Called before
    /// every acquisition attempt and after failed ones.
    pub fn purge_incomplete(&self) {
        self.purge_where(|path, len| {
            let ext = path.extension().and_then(|e| e.to_str());
            ext == Some(TEMP_EXTENSION)
                || (ext == Some(self.extension.as_str()) && len < self.min_plausible_bytes)
        });
    }

    /// Deletes every artifact and temp file. Backs `reset()`.
    pub fn purge_all(&self) {
        self.purge_where(|path, _len| {
            let ext = path.extension().and_then(|e| e.to_str());
            ext == Some(TEMP_EXTENSION) || ext == Some(self.extension.as_str())
        });
    }

    fn purge_where(&self, should_purge: impl Fn(&Path, u64) -> bool) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if !should_purge(&path, len) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => log::info!("Purged artifact {}", path.display()),
                Err(err) => log::warn!("Failed to purge {}: {err}", path.display()),
            }
        }
    }

    pub fn delete(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to delete artifact {}: {err}", path.display());
            }
        }
    }
}

/// ±5% band, integer math: `expected / 20` bytes of slack on either side.
pub(crate) fn within_size_tolerance(expected: u64, actual: u64) -> bool {
    let tolerance = expected / 20;
    actual >= expected.saturating_sub(tolerance) && actual <= expected.saturating_add(tolerance)
}
