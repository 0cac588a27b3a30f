//! Contract of the inference engine the chat controller drives.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ChatMessage, Fragment};

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("No model loaded")]
    NotLoaded,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Malformed response: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub include_usage: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self { include_usage: true }
    }
}

/// Receives human-readable initialization progress text.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, EngineError>> + Send>>;

/// An in-process (or local) inference engine.
///
/// Implementations may assume calls are never overlapped by the controller:
/// at most one `reload` and at most one open completion stream at a time.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// (Re)initialize the engine with `model_id`, reporting progress as it goes.
    async fn reload(
        &self,
        model_id: &str,
        config: &GenerationConfig,
        progress: ProgressFn,
    ) -> Result<(), EngineError>;

    /// Release the current model. Failures are non-fatal to callers.
    async fn unload(&self) -> Result<(), EngineError>;

    /// Start a streamed completion over the full ordered history.
    async fn stream_completion(
        &self,
        history: &[ChatMessage],
        options: CompletionOptions,
    ) -> Result<FragmentStream, EngineError>;
}
