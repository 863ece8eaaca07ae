//! Model lifecycle state machine.
//!
//! Owns the installed artifact and the loaded engine handle. Transitions
//! are serialized behind one mutex; re-entrant calls are rejected with a
//! busy error instead of queued. Acquisition runs on a detached worker so
//! a multi-gigabyte download survives the caller being torn down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::ModelConfig;
use crate::infer::session::InferenceSession;
use crate::infer::{EngineError, EngineLoader, EngineSettings, GenerativeEngine};

use super::download::{DownloadError, Downloader};
use super::progress::{DownloadProgress, ProgressTracker};
use super::store::{ArtifactStore, InstalledArtifact};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LifecycleState {
    Absent,
    Acquiring,
    Installed,
    Initializing,
    Ready,
    Failed(String),
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("operation rejected: {0}")]
    Busy(&'static str),
    #[error("no artifact installed")]
    NotInstalled,
    #[error("model is not ready")]
    NotReady,
    #[error("timed out waiting for the model to become ready")]
    ReadyTimeout,
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("engine failed: {0}")]
    Engine(#[from] EngineError),
}

impl LifecycleError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Busy(_) => "The model is busy. Wait a moment and try again.",
            Self::NotInstalled => "The model is not downloaded yet. Download it to continue.",
            Self::NotReady => "The model is not loaded yet. Please try again.",
            Self::ReadyTimeout => "The model is taking too long to load. Try restarting the app.",
            Self::Download(err) => err.user_message(),
            Self::Engine(err) => err.user_message(),
        }
    }
}

struct LifecycleInner {
    state: LifecycleState,
    config: ModelConfig,
    store: Arc<ArtifactStore>,
    artifact: Option<InstalledArtifact>,
    engine: Option<Box<dyn GenerativeEngine>>,
}

pub struct ModelLifecycle {
    inner: Arc<Mutex<LifecycleInner>>,
    downloader: Arc<Downloader>,
    loader: Box<dyn EngineLoader>,
    tracker: ProgressTracker,
    download_cancel: Arc<AtomicBool>,
    session_latch: Arc<AtomicBool>,
}

impl ModelLifecycle {
    pub fn new(config: ModelConfig, loader: Box<dyn EngineLoader>) -> Self {
        let tracker = ProgressTracker::new();
        let downloader = Downloader::new(tracker.clone());
        let store = ArtifactStore::new(config.resolve_model_root(), &config.file_extension);
        Self::assemble(config, store, downloader, loader)
    }

    /// Injection seam: tests swap in a scripted transport and a store with
    /// a tiny plausible-size floor.
    pub fn with_parts(
        config: ModelConfig,
        store: ArtifactStore,
        downloader: Downloader,
        loader: Box<dyn EngineLoader>,
    ) -> Self {
        Self::assemble(config, store, downloader, loader)
    }

    fn assemble(
        config: ModelConfig,
        store: ArtifactStore,
        downloader: Downloader,
        loader: Box<dyn EngineLoader>,
    ) -> Self {
        let tracker = downloader.tracker().clone();
        let store = Arc::new(store);

        let (state, artifact) = Self::scan_store(&store, &config);

        Self {
            inner: Arc::new(Mutex::new(LifecycleInner {
                state,
                config,
                store,
                artifact,
                engine: None,
            })),
            downloader: Arc::new(downloader),
            loader,
            tracker,
            download_cancel: Arc::new(AtomicBool::new(false)),
            session_latch: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Startup scan: a validated on-disk artifact skips acquisition
    /// entirely; a corrupt one is deleted and the state stays `Absent`.
    fn scan_store(
        store: &ArtifactStore,
        config: &ModelConfig,
    ) -> (LifecycleState, Option<InstalledArtifact>) {
        let wanted = config.artifact_file_name();
        for candidate in store.list_candidates() {
            let matches_name =
                candidate.file_name().and_then(|n| n.to_str()) == Some(wanted.as_str());
            if !matches_name {
                continue;
            }
            match store.validate(&candidate, config.expected_bytes) {
                Ok(artifact) => {
                    log::info!("Found installed artifact {}", candidate.display());
                    return (LifecycleState::Installed, Some(artifact));
                }
                Err(reason) => {
                    log::warn!("Purging invalid artifact {}: {reason}", candidate.display());
                    store.delete(&candidate);
                }
            }
        }
        (LifecycleState::Absent, None)
    }

    fn lock_inner(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> LifecycleState {
        self.lock_inner().state.clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.lock_inner().state, LifecycleState::Ready)
    }

    pub fn config(&self) -> ModelConfig {
        self.lock_inner().config.clone()
    }

    pub fn download_progress(&self) -> DownloadProgress {
        self.tracker.snapshot()
    }

    /// Image capacity as the engine sees it: the loaded engine's word once
    /// one exists, the config's resolution before that.
    pub fn vision_enabled(&self) -> bool {
        let inner = self.lock_inner();
        match &inner.engine {
            Some(engine) => engine.vision_enabled(),
            None => inner.config.vision_enabled(),
        }
    }

    /// Starts acquiring the artifact on a background worker. No-op when an
    /// artifact is already installed; rejected while another transition is
    /// in flight.
    pub fn acquire(&self) -> Result<(), LifecycleError> {
        let (config, store) = {
            let mut inner = self.lock_inner();
            match inner.state {
                LifecycleState::Acquiring => {
                    return Err(LifecycleError::Busy("acquisition already in progress"))
                }
                LifecycleState::Initializing => {
                    return Err(LifecycleError::Busy("engine load in progress"))
                }
                LifecycleState::Installed | LifecycleState::Ready => return Ok(()),
                LifecycleState::Absent | LifecycleState::Failed(_) => {}
            }
            inner.state = LifecycleState::Acquiring;
            (inner.config.clone(), inner.store.clone())
        };

        self.download_cancel.store(false, Ordering::SeqCst);
        let cancel = self.download_cancel.clone();
        let downloader = self.downloader.clone();
        let inner_arc = self.inner.clone();
        let descriptor = config.descriptor();

        thread::spawn(move || {
            let result = downloader.download(&descriptor, &store, &cancel);

            let mut inner = inner_arc.lock().unwrap_or_else(|e| e.into_inner());
            if inner.state != LifecycleState::Acquiring {
                // A reset() superseded this download; leave its state alone.
                return;
            }
            match result {
                Ok(artifact) => {
                    log::info!("Artifact acquired: {}", artifact.path.display());
                    inner.artifact = Some(artifact);
                    inner.state = LifecycleState::Installed;
                }
                Err(DownloadError::Cancelled) => {
                    inner.state = LifecycleState::Absent;
                }
                Err(err) => {
                    inner.state = LifecycleState::Failed(err.user_message().to_string());
                }
            }
        });

        Ok(())
    }

    /// Cancels an in-flight acquisition. The worker purges partial state
    /// and moves the machine back to `Absent`.
    pub fn cancel_acquire(&self) {
        self.download_cancel.store(true, Ordering::SeqCst);
    }

    /// Constructs the engine from the installed artifact. Idempotent once
    /// `Ready`; rejected while another transition is in flight.
    pub fn load(&self) -> Result<(), LifecycleError> {
        let (artifact, settings) = {
            let mut inner = self.lock_inner();
            match inner.state {
                LifecycleState::Ready => return Ok(()),
                LifecycleState::Initializing => {
                    return Err(LifecycleError::Busy("engine load in progress"))
                }
                LifecycleState::Acquiring => {
                    return Err(LifecycleError::Busy("acquisition in progress"))
                }
                LifecycleState::Absent | LifecycleState::Failed(_) => {
                    return Err(LifecycleError::NotInstalled)
                }
                LifecycleState::Installed => {}
            }
            let artifact = inner.artifact.clone().ok_or(LifecycleError::NotInstalled)?;
            let settings = EngineSettings::for_config(&inner.config);
            inner.state = LifecycleState::Initializing;
            (artifact, settings)
        };

        log::info!(
            "Loading engine from {} (max_tokens={}, image_slots={})",
            artifact.path.display(),
            settings.max_tokens,
            settings.max_images
        );
        let start = Instant::now();
        let result = self.loader.load(&artifact, &settings);

        let mut inner = self.lock_inner();
        match result {
            Ok(engine) => {
                log::info!("Engine ready in {:?}", start.elapsed());
                inner.engine = Some(engine);
                inner.state = LifecycleState::Ready;
                Ok(())
            }
            Err(err) => {
                log::error!("Engine construction failed: {err}");
                inner.engine = None;
                inner.state = LifecycleState::Failed(err.to_string());
                Err(LifecycleError::Engine(err))
            }
        }
    }

    /// Releases the engine handle; the artifact file stays installed.
    pub fn unload(&self) -> Result<(), LifecycleError> {
        let mut inner = self.lock_inner();
        match inner.state {
            LifecycleState::Ready => {
                inner.engine = None;
                inner.state = LifecycleState::Installed;
                log::info!("Engine unloaded; artifact retained");
                Ok(())
            }
            LifecycleState::Initializing => Err(LifecycleError::Busy("engine load in progress")),
            _ => Ok(()),
        }
    }

    /// Back to `Absent` from any state: cancels an in-flight download,
    /// drops the engine, purges the store. Passing a config makes this the
    /// one sanctioned way to change model settings.
    pub fn reset(&self, new_config: Option<ModelConfig>) {
        self.download_cancel.store(true, Ordering::SeqCst);

        let store = {
            let mut inner = self.lock_inner();
            if let Some(config) = new_config {
                inner.store = Arc::new(ArtifactStore::new(
                    config.resolve_model_root(),
                    &config.file_extension,
                ));
                inner.config = config;
            }
            inner.engine = None;
            inner.artifact = None;
            inner.state = LifecycleState::Absent;
            inner.store.clone()
        };

        store.purge_all();
        log::info!("Lifecycle reset; store purged");
    }

    /// Bounded wait for `Ready`, polling at a fixed interval. Exceeding the
    /// bound is a failure, never an infinite wait.
    pub fn wait_until_ready(&self, timeout: Duration) -> Result<(), LifecycleError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state() {
                LifecycleState::Ready => return Ok(()),
                LifecycleState::Absent | LifecycleState::Failed(_) => {
                    return Err(LifecycleError::NotReady)
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(LifecycleError::ReadyTimeout);
            }
            thread::sleep(READY_POLL_INTERVAL);
        }
    }

    /// Claims a fresh single-use session from the loaded engine. Fails with
    /// `SessionActive` while a previous session is still live.
    pub fn create_session(&self) -> Result<InferenceSession, LifecycleError> {
        let mut inner = self.lock_inner();
        if inner.state != LifecycleState::Ready {
            return Err(LifecycleError::NotReady);
        }
        let engine = inner.engine.as_mut().ok_or(LifecycleError::NotReady)?;
        let session = InferenceSession::claim(engine.as_mut(), self.session_latch.clone())?;
        Ok(session)
    }
}
