use std::sync::{Arc, Mutex};

use vox_lens_lib::infer::TokenFragment;
use vox_lens_lib::streaming::{FinishReason, FragmentSink, SpeechChunker, SpeechSynthesizer};

struct CollectingSynth {
    utterances: Arc<Mutex<Vec<String>>>,
}

impl SpeechSynthesizer for CollectingSynth {
    fn speak(&mut self, utterance: &str) {
        self.utterances.lock().unwrap().push(utterance.to_string());
    }
}

fn chunker() -> (SpeechChunker, Arc<Mutex<Vec<String>>>) {
    let utterances = Arc::new(Mutex::new(Vec::new()));
    let chunker = SpeechChunker::new(Box::new(CollectingSynth {
        utterances: utterances.clone(),
    }));
    (chunker, utterances)
}

#[test]
fn splits_at_sentence_boundaries_across_fragments() {
    let (mut chunker, utterances) = chunker();

    chunker.push("Hello world. How are");
    assert_eq!(*utterances.lock().unwrap(), vec!["Hello world.".to_string()]);

    chunker.push(" you?");
    assert_eq!(
        *utterances.lock().unwrap(),
        vec!["Hello world.".to_string(), "How are you?".to_string()]
    );
}

#[test]
fn flush_emits_the_unterminated_remainder() {
    let (mut chunker, utterances) = chunker();

    chunker.push("And then it stopped");
    assert!(utterances.lock().unwrap().is_empty());

    chunker.flush();
    assert_eq!(
        *utterances.lock().unwrap(),
        vec!["And then it stopped".to_string()]
    );
}

#[test]
fn flush_on_an_empty_buffer_emits_nothing() {
    let (mut chunker, utterances) = chunker();

    chunker.flush();
    chunker.flush();
    assert!(utterances.lock().unwrap().is_empty());
}

#[test]
fn newline_counts_as_a_terminator() {
    let (mut chunker, utterances) = chunker();

    chunker.push("First line\nsecond");
    assert_eq!(*utterances.lock().unwrap(), vec!["First line".to_string()]);

    chunker.flush();
    assert_eq!(
        *utterances.lock().unwrap(),
        vec!["First line".to_string(), "second".to_string()]
    );
}

#[test]
fn exclamations_and_questions_terminate_sentences() {
    let (mut chunker, utterances) = chunker();

    chunker.push("Wow! Really? Yes.");
    assert_eq!(
        *utterances.lock().unwrap(),
        vec![
            "Wow!".to_string(),
            "Really?".to_string(),
            "Yes.".to_string()
        ]
    );
}

#[test]
fn finish_flushes_via_the_sink_interface() {
    let (mut chunker, utterances) = chunker();

    chunker.fragment(&TokenFragment::partial("Unfinished thought"));
    assert!(utterances.lock().unwrap().is_empty());

    chunker.finish(FinishReason::Cancelled);
    assert_eq!(
        *utterances.lock().unwrap(),
        vec!["Unfinished thought".to_string()]
    );
}
