//! Single-use inference sessions.
//!
//! Reusing an execution context across requests corrupts the engine's
//! internal ordering state, so every request claims a fresh session and the
//! previous one must be retired first. The engine-wide latch makes the
//! one-live-session rule a runtime guarantee rather than a convention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::{EngineError, GenerationContext, GenerativeEngine, ImageInput, TokenFragment};

/// Cross-thread retirement handle. Cloneable; retiring is idempotent and
/// never blocks.
#[derive(Clone)]
pub struct SessionControl {
    retired: Arc<AtomicBool>,
}

impl SessionControl {
    pub fn retire(&self) {
        if !self.retired.swap(true, Ordering::SeqCst) {
            log::debug!("Session retired");
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

/// A fresh execution context bound to the loaded engine. Dropping the
/// session retires it and releases the engine-wide latch.
pub struct InferenceSession {
    ctx: Box<dyn GenerationContext>,
    control: SessionControl,
    latch: Arc<AtomicBool>,
}

impl InferenceSession {
    pub(crate) fn claim(
        engine: &mut dyn GenerativeEngine,
        latch: Arc<AtomicBool>,
    ) -> Result<Self, EngineError> {
        if latch.swap(true, Ordering::SeqCst) {
            return Err(EngineError::SessionActive);
        }

        let ctx = match engine.create_context() {
            Ok(ctx) => ctx,
            Err(err) => {
                latch.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        Ok(Self {
            ctx,
            control: SessionControl {
                retired: Arc::new(AtomicBool::new(false)),
            },
            latch,
        })
    }

    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    pub fn add_text(&mut self, text: &str) -> Result<(), EngineError> {
        self.ctx.add_text(text)
    }

    pub fn add_image(&mut self, image: &ImageInput) -> Result<(), EngineError> {
        self.ctx.add_image(image)
    }

    /// Drives generation to completion, pushing each fragment into `tx`.
    /// Retirement stops emission at the next fragment boundary. An engine
    /// failure becomes one synthetic terminal fragment; it never escapes as
    /// an error.
    pub fn run(mut self, tx: Sender<TokenFragment>) {
        let control = self.control.clone();
        let result = self.ctx.generate(&mut |fragment| {
            if control.is_retired() {
                return false;
            }
            tx.send(fragment).is_ok()
        });

        if let Err(err) = result {
            log::error!("Generation failed: {err}");
            let _ = tx.send(TokenFragment::engine_failure(
                err.user_message().to_string(),
            ));
        }
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        self.control.retire();
        self.latch.store(false, Ordering::SeqCst);
        log::debug!("Session released");
    }
}
