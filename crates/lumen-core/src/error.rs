use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LumenError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Model load already in progress")]
    AlreadyInProgress,

    #[error("Generation already in progress")]
    GenerationInProgress,

    #[error("Model not ready")]
    ModelNotReady,

    #[error("History error: {0}")]
    History(String),

    #[error("Engine initialization failed: {0}")]
    EngineInit(String),

    #[error("Generation failed: {0}")]
    EngineGeneration(String),

    #[error("No fragment received within {0:?}")]
    StreamTimeout(Duration),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Unload failed: {0}")]
    Unload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Recovery class of an error, as seen by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; nothing changed.
    Validation,
    /// Overlapping operation rejected; nothing changed.
    ConcurrencyRejection,
    /// Model failed to initialize; lifecycle is in `Error`.
    EngineInit,
    /// Generation failed; generation state is `Failed`.
    EngineGeneration,
    /// Best-effort cleanup failed; never blocks progress.
    UnloadWarning,
    /// Settings could not be read or written.
    Storage,
}

impl LumenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LumenError::Validation(_)
            | LumenError::UnknownModel(_)
            | LumenError::History(_)
            | LumenError::ModelNotReady => ErrorKind::Validation,
            LumenError::AlreadyInProgress | LumenError::GenerationInProgress => {
                ErrorKind::ConcurrencyRejection
            }
            LumenError::EngineInit(_) => ErrorKind::EngineInit,
            LumenError::EngineGeneration(_)
            | LumenError::StreamTimeout(_)
            | LumenError::Cancelled => ErrorKind::EngineGeneration,
            LumenError::Unload(_) => ErrorKind::UnloadWarning,
            LumenError::Storage(_)
            | LumenError::Config(_)
            | LumenError::Io(_)
            | LumenError::Json(_) => ErrorKind::Storage,
        }
    }

    /// True for rejections the caller should surface as a warning and retry later.
    pub fn is_rejection(&self) -> bool {
        self.kind() == ErrorKind::ConcurrencyRejection
    }
}

pub type Result<T> = std::result::Result<T, LumenError>;
