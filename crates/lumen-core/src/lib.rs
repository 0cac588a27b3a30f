// Domain modules
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod generation;
pub mod history;
pub mod lifecycle;
pub mod message;
pub mod model;
pub mod settings;
pub mod usage;

pub use config::{ChatConfig, EngineConfig, EngineKind, LumenConfig, StorageConfig};
pub use engine::{
    CompletionOptions, EngineError, FragmentStream, GenerationConfig, InferenceEngine, ProgressFn,
};
pub use error::{ErrorKind, LumenError, Result};
pub use event::{ChatEvent, LogEntry, LogLevel};
pub use generation::{GenerationState, GenerationTracker};
pub use history::ConversationHistory;
pub use lifecycle::{LoadTicket, ModelLifecycle, ModelLifecycleState};
pub use message::{ChatMessage, MessageRole};
pub use model::{ModelCatalog, ModelDescriptor, ResourceHint, ResourceTier};
pub use settings::{SelectedSettings, Theme};
pub use usage::{aggregate, Aggregate, FinishReason, Flow, Fragment, UsageAggregator, UsageMetadata, UsageStats};
