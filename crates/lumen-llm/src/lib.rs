pub mod ollama;
pub mod placeholder;

use std::sync::Arc;
use std::time::Duration;

use lumen_core::{EngineConfig, EngineKind, InferenceEngine};

pub use ollama::{OllamaEngine, OllamaMetrics};
pub use placeholder::{PlaceholderEngine, GREETING};

/// Build the engine selected by config.
pub fn build_engine(config: &EngineConfig) -> Arc<dyn InferenceEngine> {
    match config.kind {
        EngineKind::Ollama => Arc::new(
            OllamaEngine::new(&config.host)
                .with_request_timeout(Duration::from_secs(config.request_timeout_secs)),
        ),
        EngineKind::Placeholder => Arc::new(PlaceholderEngine::new()),
    }
}
