pub mod chunker;
pub mod router;

pub use chunker::SpeechChunker;
pub use router::{StreamHandle, StreamRouter};

use crate::infer::TokenFragment;

/// Why fragment delivery stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    /// The engine emitted its final fragment.
    Complete,
    /// The stream was cancelled before the final fragment arrived.
    Cancelled,
}

/// An ordered consumer of one fragment stream. `fragment` is called once
/// per fragment in emission order; `finish` exactly once afterwards.
pub trait FragmentSink: Send {
    fn fragment(&mut self, fragment: &TokenFragment);

    fn finish(&mut self, reason: FinishReason);
}

/// The external text-to-speech boundary. Utterances arrive in speaking
/// order, each exactly once.
pub trait SpeechSynthesizer: Send {
    fn speak(&mut self, utterance: &str);
}

/// Adapts a plain closure into a transcript sink.
pub struct TranscriptSink<F> {
    on_fragment: F,
}

impl<F: FnMut(&TokenFragment) + Send> TranscriptSink<F> {
    pub fn new(on_fragment: F) -> Self {
        Self { on_fragment }
    }
}

impl<F: FnMut(&TokenFragment) + Send> FragmentSink for TranscriptSink<F> {
    fn fragment(&mut self, fragment: &TokenFragment) {
        (self.on_fragment)(fragment);
    }

    fn finish(&mut self, _reason: FinishReason) {}
}
