//! Artifact download: retrying, resumable, cancellable.

use std::fs;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

use super::capability;
use super::progress::ProgressTracker;
use super::store::{ArtifactStore, CorruptionReason, InstalledArtifact, StoreError};
use super::{ArtifactDescriptor, MAX_RETRIES, RETRY_BACKOFF_SECS};

const IO_BUFFER_BYTES: usize = 256 * 1024;
/// Progress snapshots are batched; per-block updates would hammer the lock
/// on a fast link.
const PROGRESS_STEP_BYTES: u64 = 1024 * 1024;
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("{url}: request failed: {reason}")]
    Request { url: String, reason: String },
    #[error("{url}: unexpected status {status}")]
    Status { url: String, status: u16 },
    #[error("transfer interrupted: {0}")]
    Transfer(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("downloaded artifact failed validation: {0}")]
    Validation(CorruptionReason),
    #[error("install failed: {0}")]
    Install(#[from] StoreError),
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Transient transport faults earn another attempt; protocol and
    /// validation failures do not.
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Request { .. } | Self::Transfer(_) | Self::Io(_))
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Request { .. } | Self::Transfer(_) | Self::Status { .. } => {
                "Could not download the model. Check your internet connection and try again."
            }
            Self::Validation(_) => "The downloaded model looks corrupted. Please try again.",
            Self::Io(_) | Self::Install(_) => {
                "The app could not write the model to disk. Check disk space and permissions."
            }
            Self::Cancelled => "Model download was cancelled.",
        }
    }
}

/// One fetched byte stream. `resumed_from` is non-zero when the server
/// honored a `Range` request.
pub struct FetchResponse {
    pub resumed_from: u64,
    pub total_bytes: Option<u64>,
    pub body: Box<dyn Read>,
}

/// Transport seam so the retry/resume logic can be driven without sockets.
pub trait Transport: Send + Sync {
    fn fetch(&self, url: &str, resume_from: u64) -> Result<FetchResponse, DownloadError>;
}

pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new() -> Self {
        let config = ureq::config::Config::builder()
            .timeout_global(Some(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str, resume_from: u64) -> Result<FetchResponse, DownloadError> {
        let mut request = self.agent.get(url);
        if resume_from > 0 {
            request = request.header("Range", &format!("bytes={resume_from}-"));
        }

        let response = request.call().map_err(|e| DownloadError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !(200..300).contains(&status.as_u16()) {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_length = response
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let (resumed_from, total_bytes) = if status.as_u16() == 206 {
            (resume_from, content_length.map(|len| resume_from + len))
        } else {
            (0, content_length)
        };

        Ok(FetchResponse {
            resumed_from,
            total_bytes,
            body: Box::new(response.into_body().into_reader()),
        })
    }
}

pub struct Downloader {
    transport: Box<dyn Transport>,
    tracker: ProgressTracker,
    retry_delay: Duration,
}

impl Downloader {
    pub fn new(tracker: ProgressTracker) -> Self {
        Self::with_transport(Box::new(HttpTransport::new()), tracker)
    }

    pub fn with_transport(transport: Box<dyn Transport>, tracker: ProgressTracker) -> Self {
        Self {
            transport,
            tracker,
            retry_delay: Duration::from_secs(RETRY_BACKOFF_SECS),
        }
    }

    /// Shortens the linear backoff base; tests use this to avoid
    /// multi-second sleeps.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Fetches the artifact into a temp file and installs it atomically.
    /// Up to three attempts; transient transport faults back off linearly
    /// (2 s, 4 s) and re-purge partial state before retrying.
    pub fn download(
        &self,
        descriptor: &ArtifactDescriptor,
        store: &ArtifactStore,
        cancel: &AtomicBool,
    ) -> Result<InstalledArtifact, DownloadError> {
        store.purge_incomplete();

        let mut last_err: Option<DownloadError> = None;

        for attempt in 1..=MAX_RETRIES {
            self.tracker.start_attempt(attempt);
            log::info!(
                "Downloading {} from {} (attempt {attempt}/{MAX_RETRIES})",
                descriptor.file_name(),
                descriptor.source_url
            );

            match self.try_attempt(descriptor, store, cancel) {
                Ok(artifact) => {
                    self.tracker.mark_finished();
                    return Ok(artifact);
                }
                Err(DownloadError::Cancelled) => {
                    log::info!("Download of {} cancelled", descriptor.file_name());
                    store.purge_incomplete();
                    self.tracker.record_failure("cancelled".to_string());
                    return Err(DownloadError::Cancelled);
                }
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    log::warn!("Download attempt {attempt} failed: {err}");
                    last_err = Some(err);
                    std::thread::sleep(self.retry_delay * attempt as u32);
                    store.purge_incomplete();
                }
                Err(err) => {
                    log::error!("Download of {} failed: {err}", descriptor.file_name());
                    store.purge_incomplete();
                    self.tracker.record_failure(err.user_message().to_string());
                    return Err(err);
                }
            }
        }

        let err = last_err
            .unwrap_or_else(|| DownloadError::Transfer("exhausted retry attempts".to_string()));
        self.tracker.record_failure(err.user_message().to_string());
        Err(err)
    }

    fn try_attempt(
        &self,
        descriptor: &ArtifactDescriptor,
        store: &ArtifactStore,
        cancel: &AtomicBool,
    ) -> Result<InstalledArtifact, DownloadError> {
        fs::create_dir_all(store.root())?;
        let file_name = descriptor.file_name();
        let tmp = store.temp_path(&file_name);

        let resume_from = if tmp.exists() {
            fs::metadata(&tmp).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let fetch = self.transport.fetch(&descriptor.source_url, resume_from)?;

        let mut file = if fetch.resumed_from > 0 {
            log::debug!("Resuming download from byte {}", fetch.resumed_from);
            fs::OpenOptions::new().create(true).append(true).open(&tmp)?
        } else {
            fs::File::create(&tmp)?
        };

        let display_total = fetch
            .total_bytes
            .or(descriptor.expected_bytes)
            .or_else(|| capability::known_artifact_size(&descriptor.name));

        let mut downloaded = fetch.resumed_from;
        let mut last_reported = downloaded;
        self.tracker.update_bytes(downloaded, display_total);

        let mut reader = fetch.body;
        let mut buffer = vec![0u8; IO_BUFFER_BYTES];
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(DownloadError::Cancelled);
            }

            let bytes_read = reader
                .read(&mut buffer)
                .map_err(|e| DownloadError::Transfer(e.to_string()))?;
            if bytes_read == 0 {
                break;
            }

            file.write_all(&buffer[..bytes_read])?;
            downloaded += bytes_read as u64;

            if downloaded - last_reported >= PROGRESS_STEP_BYTES {
                self.tracker.update_bytes(downloaded, display_total);
                last_reported = downloaded;
            }
        }
        file.flush()?;
        self.tracker.update_bytes(downloaded, display_total);

        if let Some(total) = fetch.total_bytes {
            if downloaded != total {
                return Err(DownloadError::Transfer(format!(
                    "incomplete transfer: expected {total} bytes, got {downloaded}"
                )));
            }
        }

        match store.validate(&tmp, descriptor.expected_bytes) {
            Ok(_) => {}
            Err(reason) => {
                store.delete(&tmp);
                return Err(DownloadError::Validation(reason));
            }
        }

        Ok(store.install_atomically(&tmp, &file_name)?)
    }
}
