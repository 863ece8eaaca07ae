use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use vox_lens_lib::config::ModelConfig;
use vox_lens_lib::infer::{
    EngineError, EngineLoader, EngineSettings, GenerationContext, GenerativeEngine, ImageInput,
    TokenFragment,
};
use vox_lens_lib::model::{
    ArtifactStore, DownloadError, Downloader, FetchResponse, InstalledArtifact, ModelLifecycle,
    ProgressTracker, Transport, VisionMode,
};
use vox_lens_lib::streaming::SpeechSynthesizer;
use vox_lens_lib::{Assistant, GenerateRequest};

fn nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos()
}

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("vox_streaming_{tag}_{}", nanos()));
    fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

struct UnusedTransport;

impl Transport for UnusedTransport {
    fn fetch(&self, url: &str, _resume_from: u64) -> Result<FetchResponse, DownloadError> {
        Err(DownloadError::Request {
            url: url.to_string(),
            reason: "no network in streaming tests".to_string(),
        })
    }
}

#[derive(Clone)]
enum ContextScript {
    /// Emits each piece in order; the last one is the final fragment.
    Emit(Vec<&'static str>),
    /// Emits forever until the emit callback says stop.
    Chatty(&'static str),
    /// Emits one partial, then fails.
    FailAfter(&'static str),
}

struct ScriptedContext {
    script: ContextScript,
    images_added: Arc<AtomicUsize>,
}

impl GenerationContext for ScriptedContext {
    fn add_text(&mut self, _text: &str) -> Result<(), EngineError> {
        Ok(())
    }

    fn add_image(&mut self, _image: &ImageInput) -> Result<(), EngineError> {
        self.images_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn generate(
        &mut self,
        emit: &mut dyn FnMut(TokenFragment) -> bool,
    ) -> Result<(), EngineError> {
        match &self.script {
            ContextScript::Emit(pieces) => {
                let last = pieces.len().saturating_sub(1);
                for (index, piece) in pieces.iter().enumerate() {
                    let fragment = if index == last {
                        TokenFragment::final_piece(*piece)
                    } else {
                        TokenFragment::partial(*piece)
                    };
                    if !emit(fragment) {
                        return Ok(());
                    }
                }
                Ok(())
            }
            ContextScript::Chatty(piece) => {
                loop {
                    if !emit(TokenFragment::partial(*piece)) {
                        return Ok(());
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            }
            ContextScript::FailAfter(piece) => {
                emit(TokenFragment::partial(*piece));
                Err(EngineError::Generation("engine exploded".to_string()))
            }
        }
    }
}

struct ScriptedEngine {
    scripts: Vec<ContextScript>,
    contexts_created: Arc<AtomicUsize>,
    images_added: Arc<AtomicUsize>,
    vision: bool,
}

impl GenerativeEngine for ScriptedEngine {
    fn create_context(&mut self) -> Result<Box<dyn GenerationContext>, EngineError> {
        let index = self.contexts_created.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .get(index)
            .cloned()
            .ok_or_else(|| EngineError::Generation("no script left".to_string()))?;
        Ok(Box::new(ScriptedContext {
            script,
            images_added: self.images_added.clone(),
        }))
    }

    fn vision_enabled(&self) -> bool {
        self.vision
    }
}

struct ScriptedLoader {
    engine: Mutex<Option<ScriptedEngine>>,
}

impl EngineLoader for ScriptedLoader {
    fn load(
        &self,
        _artifact: &InstalledArtifact,
        _settings: &EngineSettings,
    ) -> Result<Box<dyn GenerativeEngine>, EngineError> {
        self.engine
            .lock()
            .unwrap()
            .take()
            .map(|engine| Box::new(engine) as Box<dyn GenerativeEngine>)
            .ok_or_else(|| EngineError::Construction("engine already taken".to_string()))
    }
}

struct Collector {
    fragments: Arc<Mutex<Vec<TokenFragment>>>,
}

impl Collector {
    fn new() -> (Self, Arc<Mutex<Vec<TokenFragment>>>) {
        let fragments = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                fragments: fragments.clone(),
            },
            fragments,
        )
    }

    fn sink(self) -> impl FnMut(&TokenFragment) + Send + 'static {
        move |fragment: &TokenFragment| {
            self.fragments.lock().unwrap().push(fragment.clone());
        }
    }
}

struct CollectingSynth {
    utterances: Arc<Mutex<Vec<String>>>,
}

impl SpeechSynthesizer for CollectingSynth {
    fn speak(&mut self, utterance: &str) {
        self.utterances.lock().unwrap().push(utterance.to_string());
    }
}

fn collecting_synth() -> (Box<dyn SpeechSynthesizer>, Arc<Mutex<Vec<String>>>) {
    let utterances = Arc::new(Mutex::new(Vec::new()));
    (
        Box::new(CollectingSynth {
            utterances: utterances.clone(),
        }),
        utterances,
    )
}

struct Fixture {
    dir: PathBuf,
    assistant: Assistant,
    contexts_created: Arc<AtomicUsize>,
    images_added: Arc<AtomicUsize>,
}

fn ready_assistant(tag: &str, scripts: Vec<ContextScript>, vision: bool) -> Fixture {
    let dir = temp_dir(tag);
    fs::write(dir.join("tiny-model.task"), vec![0u8; 256]).expect("write should succeed");

    let contexts_created = Arc::new(AtomicUsize::new(0));
    let images_added = Arc::new(AtomicUsize::new(0));
    let loader = ScriptedLoader {
        engine: Mutex::new(Some(ScriptedEngine {
            scripts,
            contexts_created: contexts_created.clone(),
            images_added: images_added.clone(),
            vision,
        })),
    };

    let config = ModelConfig {
        artifact_name: "tiny-model".to_string(),
        source_url: "https://example.invalid/tiny-model.task".to_string(),
        file_extension: "task".to_string(),
        vision: if vision {
            VisionMode::Enabled
        } else {
            VisionMode::Disabled
        },
        ..ModelConfig::default()
    };
    let store = ArtifactStore::new(dir.clone(), "task").min_plausible_bytes(16);
    let downloader = Downloader::with_transport(Box::new(UnusedTransport), ProgressTracker::new());
    let lifecycle = Arc::new(ModelLifecycle::with_parts(
        config,
        store,
        downloader,
        Box::new(loader),
    ));
    lifecycle.load().expect("load should succeed");

    Fixture {
        dir,
        assistant: Assistant::new(lifecycle),
        contexts_created,
        images_added,
    }
}

fn wait_for_fragments(
    fragments: &Arc<Mutex<Vec<TokenFragment>>>,
    at_least: usize,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;
    while fragments.lock().unwrap().len() < at_least {
        assert!(Instant::now() < deadline, "timed out waiting for fragments");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn fragments_reconstruct_the_full_response_with_one_final() {
    let f = ready_assistant(
        "reconstruct",
        vec![ContextScript::Emit(vec!["Hel", "lo ", "wor", "ld!"])],
        false,
    );
    let (collector, fragments) = Collector::new();
    let (synth, utterances) = collecting_synth();

    f.assistant
        .generate(GenerateRequest::text_only("hi"), collector.sink(), synth)
        .expect("generate should start");
    f.assistant.wait_for_idle();

    let fragments = fragments.lock().unwrap();
    let text: String = fragments.iter().map(|f| f.text.as_str()).collect();
    assert_eq!(text, "Hello world!");
    assert_eq!(fragments.iter().filter(|f| f.is_final).count(), 1);
    assert!(fragments.last().expect("fragments should exist").is_final);

    assert_eq!(*utterances.lock().unwrap(), vec!["Hello world!".to_string()]);

    let _ = fs::remove_dir_all(&f.dir);
}

#[test]
fn cancellation_stops_delivery_and_the_next_generate_succeeds() {
    let f = ready_assistant(
        "cancel",
        vec![
            ContextScript::Chatty("tick "),
            ContextScript::Emit(vec!["done."]),
        ],
        false,
    );

    let (collector, first_fragments) = Collector::new();
    let (synth, _) = collecting_synth();
    f.assistant
        .generate(GenerateRequest::text_only("go"), collector.sink(), synth)
        .expect("generate should start");

    wait_for_fragments(&first_fragments, 2, Duration::from_secs(2));
    f.assistant.cancel_generation();
    f.assistant.wait_for_idle();

    let first = first_fragments.lock().unwrap();
    assert!(!first.is_empty());
    assert!(first.iter().all(|fragment| !fragment.is_final));
    drop(first);

    let (collector, second_fragments) = Collector::new();
    let (synth, utterances) = collecting_synth();
    f.assistant
        .generate(GenerateRequest::text_only("again"), collector.sink(), synth)
        .expect("a fresh session should be claimable after cancellation");
    f.assistant.wait_for_idle();

    let second = second_fragments.lock().unwrap();
    assert_eq!(second.len(), 1);
    assert!(second[0].is_final);
    assert_eq!(second[0].text, "done.");
    assert_eq!(*utterances.lock().unwrap(), vec!["done.".to_string()]);
    assert_eq!(f.contexts_created.load(Ordering::SeqCst), 2);

    let _ = fs::remove_dir_all(&f.dir);
}

#[test]
fn a_second_generate_supersedes_the_first_without_interleaving() {
    let f = ready_assistant(
        "supersede",
        vec![
            ContextScript::Chatty("tick "),
            ContextScript::Emit(vec!["b1 ", "b2."]),
        ],
        false,
    );

    let (first_collector, first_fragments) = Collector::new();
    let (synth, _) = collecting_synth();
    f.assistant
        .generate(
            GenerateRequest::text_only("first"),
            first_collector.sink(),
            synth,
        )
        .expect("first generate should start");
    wait_for_fragments(&first_fragments, 1, Duration::from_secs(2));

    let (second_collector, second_fragments) = Collector::new();
    let (synth, _) = collecting_synth();
    f.assistant
        .generate(
            GenerateRequest::text_only("second"),
            second_collector.sink(),
            synth,
        )
        .expect("second generate should supersede the first");
    f.assistant.wait_for_idle();

    let first = first_fragments.lock().unwrap();
    let second = second_fragments.lock().unwrap();

    assert!(first.iter().all(|fragment| fragment.text == "tick "));
    assert!(first.iter().all(|fragment| !fragment.is_final));

    let second_text: String = second.iter().map(|f| f.text.as_str()).collect();
    assert_eq!(second_text, "b1 b2.");
    assert_eq!(second.iter().filter(|f| f.is_final).count(), 1);

    assert_eq!(f.contexts_created.load(Ordering::SeqCst), 2);

    let _ = fs::remove_dir_all(&f.dir);
}

#[test]
fn engine_failure_surfaces_as_one_synthetic_final_fragment() {
    let f = ready_assistant(
        "engine_error",
        vec![
            ContextScript::FailAfter("partial "),
            ContextScript::Emit(vec!["recovered."]),
        ],
        false,
    );

    let (collector, fragments) = Collector::new();
    let (synth, utterances) = collecting_synth();
    f.assistant
        .generate(GenerateRequest::text_only("boom"), collector.sink(), synth)
        .expect("generate should start");
    f.assistant.wait_for_idle();

    {
        let fragments = fragments.lock().unwrap();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].text, "partial ");
        assert!(fragments[1].is_final);
        assert!(fragments[1].error.is_some());
        // The chunker flushed the partial text when the stream ended.
        assert_eq!(*utterances.lock().unwrap(), vec!["partial".to_string()]);
    }

    // The failed session is retired; the next turn works normally.
    let (collector, fragments) = Collector::new();
    let (synth, _) = collecting_synth();
    f.assistant
        .generate(GenerateRequest::text_only("retry"), collector.sink(), synth)
        .expect("generate after an engine failure should succeed");
    f.assistant.wait_for_idle();

    let fragments = fragments.lock().unwrap();
    assert_eq!(fragments.len(), 1);
    assert!(fragments[0].is_final);
    assert!(fragments[0].error.is_none());

    let _ = fs::remove_dir_all(&f.dir);
}

#[test]
fn image_is_dropped_when_the_engine_has_no_image_slot() {
    let f = ready_assistant(
        "no_vision",
        vec![ContextScript::Emit(vec!["text only."])],
        false,
    );

    let (collector, fragments) = Collector::new();
    let (synth, _) = collecting_synth();
    f.assistant
        .generate(
            GenerateRequest {
                prior_context: String::new(),
                user_text: "what is this?".to_string(),
                image: Some(ImageInput {
                    data: vec![0u8; 16],
                }),
            },
            collector.sink(),
            synth,
        )
        .expect("a dropped image must not fail the turn");
    f.assistant.wait_for_idle();

    assert_eq!(f.images_added.load(Ordering::SeqCst), 0);
    assert!(fragments.lock().unwrap().last().unwrap().is_final);

    let _ = fs::remove_dir_all(&f.dir);
}

#[test]
fn image_reaches_the_engine_when_vision_is_enabled() {
    let f = ready_assistant(
        "vision",
        vec![ContextScript::Emit(vec!["I see a cat."])],
        true,
    );

    let (collector, _fragments) = Collector::new();
    let (synth, utterances) = collecting_synth();
    f.assistant
        .generate(
            GenerateRequest {
                prior_context: "Earlier we talked about pets.".to_string(),
                user_text: "what is this?".to_string(),
                image: Some(ImageInput {
                    data: vec![0u8; 16],
                }),
            },
            collector.sink(),
            synth,
        )
        .expect("generate should start");
    f.assistant.wait_for_idle();

    assert_eq!(f.images_added.load(Ordering::SeqCst), 1);
    assert_eq!(*utterances.lock().unwrap(), vec!["I see a cat.".to_string()]);

    let _ = fs::remove_dir_all(&f.dir);
}
