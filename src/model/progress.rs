//! Download progress snapshots.

use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default, Serialize)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    /// `None` while the total is unknown; observers should fall back to a
    /// bytes-only display.
    pub bytes_total: Option<u64>,
    pub attempt: usize,
    pub done: bool,
    pub error: Option<String>,
}

/// Shared handle to the progress snapshot. The download worker writes
/// through one clone while observers poll another; readers always get a
/// copy, never a live reference.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    state: Arc<Mutex<DownloadProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn start_attempt(&self, attempt: usize) {
        if let Ok(mut progress) = self.state.lock() {
            progress.bytes_downloaded = 0;
            progress.bytes_total = None;
            progress.attempt = attempt;
            progress.done = false;
            progress.error = None;
        }
    }

    pub(crate) fn update_bytes(&self, downloaded: u64, total: Option<u64>) {
        if let Ok(mut progress) = self.state.lock() {
            progress.bytes_downloaded = downloaded;
            progress.bytes_total = total;
        }
    }

    pub(crate) fn mark_finished(&self) {
        if let Ok(mut progress) = self.state.lock() {
            progress.done = true;
        }
    }

    pub(crate) fn record_failure(&self, error: String) {
        if let Ok(mut progress) = self.state.lock() {
            progress.error = Some(error);
            progress.done = true;
        }
    }

    pub fn snapshot(&self) -> DownloadProgress {
        self.state
            .lock()
            .map(|progress| progress.clone())
            .unwrap_or_default()
    }
}
