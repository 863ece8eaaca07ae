//! Sentence-boundary buffering between the token stream and speech.
//!
//! The synthesizer wants whole sentences, not token dribble. Fragments are
//! buffered until a terminal character lands, then the buffer goes out as
//! one utterance. Driven synchronously by the router's delivery loop, so
//! the transcript and the speech stream see the same fragment order.

use super::{FinishReason, FragmentSink, SpeechSynthesizer};
use crate::infer::TokenFragment;

fn is_sentence_terminal(ch: char) -> bool {
    matches!(ch, '.' | '!' | '?' | '\n')
}

pub struct SpeechChunker {
    synthesizer: Box<dyn SpeechSynthesizer>,
    buffer: String,
}

impl SpeechChunker {
    pub fn new(synthesizer: Box<dyn SpeechSynthesizer>) -> Self {
        Self {
            synthesizer,
            buffer: String::new(),
        }
    }

    /// Appends fragment text, emitting the buffer each time it comes to end
    /// with a sentence terminator. A fragment carrying several sentences
    /// yields several utterances.
    pub fn push(&mut self, text: &str) {
        for ch in text.chars() {
            self.buffer.push(ch);
            if is_sentence_terminal(ch) {
                self.emit_buffer();
            }
        }
    }

    /// Emits whatever is buffered regardless of punctuation. Called when
    /// the stream completes or is cancelled.
    pub fn flush(&mut self) {
        self.emit_buffer();
    }

    fn emit_buffer(&mut self) {
        let utterance = self.buffer.trim();
        if !utterance.is_empty() {
            self.synthesizer.speak(utterance);
        }
        self.buffer.clear();
    }
}

impl FragmentSink for SpeechChunker {
    fn fragment(&mut self, fragment: &TokenFragment) {
        if !fragment.text.is_empty() {
            self.push(&fragment.text);
        }
    }

    fn finish(&mut self, _reason: FinishReason) {
        self.flush();
    }
}
