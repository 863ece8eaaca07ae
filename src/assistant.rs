//! High-level facade: one user turn in, a spoken streamed answer out.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::ModelConfig;
use crate::error::AppError;
use crate::infer::{ImageInput, TokenFragment};
use crate::model::lifecycle::{LifecycleState, ModelLifecycle};
use crate::model::progress::DownloadProgress;
use crate::streaming::chunker::SpeechChunker;
use crate::streaming::router::{StreamHandle, StreamRouter};
use crate::streaming::{FragmentSink, SpeechSynthesizer, TranscriptSink};

/// One user turn: the camera frame plus the transcribed utterance, with any
/// prior conversation text carried ahead of it.
pub struct GenerateRequest {
    pub prior_context: String,
    pub user_text: String,
    pub image: Option<ImageInput>,
}

impl GenerateRequest {
    pub fn text_only(user_text: impl Into<String>) -> Self {
        Self {
            prior_context: String::new(),
            user_text: user_text.into(),
            image: None,
        }
    }
}

pub struct Assistant {
    lifecycle: Arc<ModelLifecycle>,
    active: Mutex<Option<StreamHandle>>,
}

impl Assistant {
    pub fn new(lifecycle: Arc<ModelLifecycle>) -> Self {
        Self {
            lifecycle,
            active: Mutex::new(None),
        }
    }

    pub fn lifecycle(&self) -> &Arc<ModelLifecycle> {
        &self.lifecycle
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle.is_ready()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn download_progress(&self) -> DownloadProgress {
        self.lifecycle.download_progress()
    }

    /// Starts a generation, superseding any in-flight one. Fragments stream
    /// to `on_fragment` in emission order; the same fragments, chunked into
    /// sentences, go to `synthesizer`.
    pub fn generate<F>(
        &self,
        request: GenerateRequest,
        on_fragment: F,
        synthesizer: Box<dyn SpeechSynthesizer>,
    ) -> Result<(), AppError>
    where
        F: FnMut(&TokenFragment) + Send + 'static,
    {
        self.cancel_active();

        let mut session = self.lifecycle.create_session()?;

        let text = if request.prior_context.is_empty() {
            request.user_text
        } else {
            format!("{}\n{}", request.prior_context, request.user_text)
        };
        session.add_text(&text)?;

        if let Some(image) = &request.image {
            if self.lifecycle.vision_enabled() {
                session.add_image(image)?;
            } else {
                // Text-only engine: the image is dropped rather than failing
                // the whole turn.
                log::debug!("Image input dropped: engine has no image slot");
            }
        }

        let sinks: Vec<Box<dyn FragmentSink>> = vec![
            Box::new(TranscriptSink::new(on_fragment)),
            Box::new(SpeechChunker::new(synthesizer)),
        ];

        let handle = StreamRouter::spawn(session, sinks);
        *self.lock_active() = Some(handle);
        Ok(())
    }

    /// Cancels the in-flight generation, if any. Idempotent.
    pub fn cancel_generation(&self) {
        if let Some(handle) = self.lock_active().as_ref() {
            handle.cancel();
        }
    }

    /// Blocks until the current generation finishes delivering.
    pub fn wait_for_idle(&self) {
        let handle = self.lock_active().take();
        if let Some(handle) = handle {
            handle.join();
        }
    }

    /// Discards everything and starts over, optionally with new settings.
    pub fn reset(&self, new_config: Option<ModelConfig>) {
        self.cancel_active();
        self.lifecycle.reset(new_config);
    }

    /// Retires and joins any in-flight stream so the session latch is free
    /// before a new session is claimed.
    fn cancel_active(&self) {
        let handle = self.lock_active().take();
        if let Some(handle) = handle {
            handle.cancel();
            handle.join();
            log::debug!("Superseded previous generation");
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<StreamHandle>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}
