pub mod capability;
pub mod download;
pub mod lifecycle;
pub mod progress;
pub mod store;

pub use capability::VisionMode;
pub use download::{DownloadError, Downloader, FetchResponse, HttpTransport, Transport};
pub use lifecycle::{LifecycleError, LifecycleState, ModelLifecycle};
pub use progress::{DownloadProgress, ProgressTracker};
pub use store::{ArtifactStore, CorruptionReason, InstalledArtifact, StoreError};

use serde::{Deserialize, Serialize};

/// Immutable description of the remote artifact for one download attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub source_url: String,
    /// Known up front for stock artifacts; otherwise filled from response
    /// headers or left unknown.
    pub expected_bytes: Option<u64>,
    pub file_extension: String,
}

impl ArtifactDescriptor {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.file_extension)
    }
}

pub(crate) const MAX_RETRIES: usize = 3;
pub(crate) const RETRY_BACKOFF_SECS: u64 = 2;
pub(crate) const TEMP_EXTENSION: &str = "download";
