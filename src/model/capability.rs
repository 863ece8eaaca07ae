//! Vision-capability detection for model artifacts.
//!
//! Nothing inside the artifact package declares whether it accepts an image
//! input; the stock artifacts encode it in their names. The keyword guess
//! below is therefore only a default — callers that know their artifact
//! should pin `VisionMode::Enabled` or `Disabled` in the config.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisionMode {
    /// Guess from the artifact name.
    #[default]
    Auto,
    Enabled,
    Disabled,
}

const VISION_NAME_HINTS: &[&str] = &["gemma-3n", "vision", "-vl", "vlm", "llava", "paligemma"];

pub fn guess_vision_support(artifact_name: &str) -> bool {
    let name = artifact_name.to_lowercase();
    VISION_NAME_HINTS.iter().any(|hint| name.contains(hint))
}

/// Published sizes for the stock artifacts, substituted when a download
/// response carries no length so progress can still show a percentage.
pub fn known_artifact_size(artifact_name: &str) -> Option<u64> {
    let name = artifact_name.to_lowercase();
    if name.contains("gemma-3n-e2b") {
        Some(3_100_000_000)
    } else if name.contains("gemma-3n-e4b") {
        Some(4_400_000_000)
    } else {
        None
    }
}
