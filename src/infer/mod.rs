//! The opaque generative-engine boundary.
//!
//! The crate never looks inside the model package; it loads, sessions and
//! streams through these traits. The production backend lives behind
//! `EngineLoader` so the runtime stays swappable and the lifecycle is
//! testable without gigabytes of weights.

pub mod session;

pub use session::{InferenceSession, SessionControl};

use serde::Serialize;
use thiserror::Error;

use crate::config::ModelConfig;
use crate::model::store::InstalledArtifact;

const THREAD_ENV: &str = "VOX_THREADS";

/// One incremental piece of a streamed response. Concatenating `text` in
/// delivery order up to and including the `is_final` fragment reconstructs
/// the full answer.
#[derive(Clone, Debug, Serialize)]
pub struct TokenFragment {
    pub text: String,
    pub is_final: bool,
    /// Set only on the synthetic terminal fragment emitted when the engine
    /// fails mid-generation.
    pub error: Option<String>,
}

impl TokenFragment {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            error: None,
        }
    }

    pub fn final_piece(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            error: None,
        }
    }

    pub(crate) fn engine_failure(message: String) -> Self {
        Self {
            text: String::new(),
            is_final: true,
            error: Some(message),
        }
    }
}

/// One image supplied with a request. The engine defines the accepted
/// encodings; this crate only moves the bytes.
#[derive(Clone)]
pub struct ImageInput {
    pub data: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine construction failed: {0}")]
    Construction(String),
    #[error("a session is already active")]
    SessionActive,
    #[error("session input rejected: {0}")]
    Input(String),
    #[error("generation failed: {0}")]
    Generation(String),
}

impl EngineError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Construction(_) => "The model failed to load. Try downloading it again.",
            Self::SessionActive => "The assistant is still answering. Wait a moment or cancel first.",
            Self::Input(_) | Self::Generation(_) => {
                "The assistant could not produce an answer. Please try again."
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub max_tokens: usize,
    /// 0 or 1. Image inputs beyond the capacity never reach the engine.
    pub max_images: usize,
    pub threads: usize,
}

impl EngineSettings {
    pub fn for_config(config: &ModelConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            max_images: if config.vision_enabled() { 1 } else { 0 },
            threads: resolve_thread_count(),
        }
    }
}

fn resolve_thread_count() -> usize {
    std::env::var(THREAD_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(num_cpus::get_physical)
}

/// Constructs engines from an installed artifact.
pub trait EngineLoader: Send + Sync {
    fn load(
        &self,
        artifact: &InstalledArtifact,
        settings: &EngineSettings,
    ) -> Result<Box<dyn GenerativeEngine>, EngineError>;
}

/// A loaded model. Owns the native resources; released on drop.
pub trait GenerativeEngine: Send {
    /// Opens a fresh execution context. The caller guarantees any previous
    /// context has been retired first.
    fn create_context(&mut self) -> Result<Box<dyn GenerationContext>, EngineError>;

    fn vision_enabled(&self) -> bool;
}

/// A single-use execution context. Inputs are added in order, then
/// `generate` runs to completion invoking `emit` once per fragment, in
/// order. `emit` returning `false` tells the engine to stop emitting and
/// return early.
pub trait GenerationContext: Send {
    fn add_text(&mut self, text: &str) -> Result<(), EngineError>;

    fn add_image(&mut self, image: &ImageInput) -> Result<(), EngineError>;

    fn generate(
        &mut self,
        emit: &mut dyn FnMut(TokenFragment) -> bool,
    ) -> Result<(), EngineError>;
}
