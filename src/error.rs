use thiserror::Error;

use crate::infer::EngineError;
use crate::model::download::DownloadError;
use crate::model::lifecycle::LifecycleError;
use crate::model::store::StoreError;

/// Unified app errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Lifecycle: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Download: {0}")]
    Download(#[from] DownloadError),

    #[error("Store: {0}")]
    Store(#[from] StoreError),

    #[error("Engine: {0}")]
    Engine(#[from] EngineError),
}

impl AppError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Lifecycle(err) => err.user_message(),
            Self::Download(err) => err.user_message(),
            Self::Store(err) => err.user_message(),
            Self::Engine(err) => err.user_message(),
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
