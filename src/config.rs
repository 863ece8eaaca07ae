//! Model configuration.
//!
//! `ModelConfig` is an immutable value handed to `ModelLifecycle` at
//! construction; changing anything after the model is ready means building
//! a new config and calling `reset()` with it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::capability::{self, VisionMode};
use crate::model::ArtifactDescriptor;

const ENV_PREFIX: &str = "VOX_";

const DEFAULT_ARTIFACT_NAME: &str = "gemma-3n-e2b-it-int4";
const DEFAULT_SOURCE_URL: &str =
    "https://huggingface.co/google/gemma-3n-E2B-it-litert-preview/resolve/main/gemma-3n-E2B-it-int4.task";
const DEFAULT_EXTENSION: &str = "task";
const DEFAULT_MAX_TOKENS: usize = 2048;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub artifact_name: String,
    pub source_url: String,
    pub file_extension: String,
    /// Expected artifact size when known; enables the ±5% size check after
    /// download and at startup scan.
    pub expected_bytes: Option<u64>,
    /// Context/token budget handed to the engine.
    pub max_tokens: usize,
    pub vision: VisionMode,
    /// Overrides the default cache-dir model root.
    pub model_root: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            artifact_name: DEFAULT_ARTIFACT_NAME.to_string(),
            source_url: DEFAULT_SOURCE_URL.to_string(),
            file_extension: DEFAULT_EXTENSION.to_string(),
            expected_bytes: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            vision: VisionMode::Auto,
            model_root: None,
        }
    }
}

impl ModelConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides(ENV_PREFIX);
        config
    }

    fn apply_env_overrides(&mut self, prefix: &str) {
        let parse_env = |suffix: &str| std::env::var(format!("{prefix}{suffix}")).ok();

        if let Some(v) = parse_env("ARTIFACT_NAME") {
            self.artifact_name = v;
        }
        if let Some(v) = parse_env("SOURCE_URL") {
            self.source_url = v;
        }
        if let Some(v) = parse_env("EXPECTED_BYTES").and_then(|s| s.parse().ok()) {
            self.expected_bytes = Some(v);
        }
        if let Some(v) = parse_env("MAX_TOKENS").and_then(|s| s.parse().ok()) {
            self.max_tokens = v;
        }
        if let Some(v) = parse_env("VISION") {
            self.vision = match v.to_lowercase().as_str() {
                "on" | "enabled" | "true" => VisionMode::Enabled,
                "off" | "disabled" | "false" => VisionMode::Disabled,
                _ => VisionMode::Auto,
            };
        }
        if let Some(v) = parse_env("MODEL_ROOT") {
            self.model_root = Some(PathBuf::from(v));
        }
    }

    /// Reads a saved config file. A missing or unparseable file falls back
    /// to defaults with env overrides applied.
    pub fn load_or_default(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(err) => {
                    log::warn!("Failed to parse config {}: {err}", path.display());
                    Self::from_env()
                }
            },
            Err(_) => Self::from_env(),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        let raw = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;
        fs::write(path, raw).map_err(|e| format!("Failed to write config: {e}"))
    }

    pub fn resolve_model_root(&self) -> PathBuf {
        if let Some(root) = &self.model_root {
            return root.clone();
        }
        fallback_model_root()
    }

    /// Final on-disk file name for the artifact.
    pub fn artifact_file_name(&self) -> String {
        format!("{}.{}", self.artifact_name, self.file_extension)
    }

    pub fn descriptor(&self) -> ArtifactDescriptor {
        ArtifactDescriptor {
            name: self.artifact_name.clone(),
            source_url: self.source_url.clone(),
            expected_bytes: self.expected_bytes,
            file_extension: self.file_extension.clone(),
        }
    }

    /// Whether the engine gets an image slot. Explicit modes win; `Auto`
    /// falls back to the artifact-name guess.
    pub fn vision_enabled(&self) -> bool {
        match self.vision {
            VisionMode::Enabled => true,
            VisionMode::Disabled => false,
            VisionMode::Auto => capability::guess_vision_support(&self.artifact_name),
        }
    }
}

pub fn fallback_model_root() -> PathBuf {
    let base = dirs_next::cache_dir()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("vox-lens").join("models")
}
