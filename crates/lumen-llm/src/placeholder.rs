use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lumen_core::{
    ChatMessage, CompletionOptions, EngineError, FinishReason, Fragment, FragmentStream,
    GenerationConfig, InferenceEngine, MessageRole, ProgressFn, UsageMetadata,
};
use tracing::{debug, instrument};

/// First assistant line shown before any model is loaded.
pub const GREETING: &str =
    "Hello! I'm a bare-bones chat interface. How can I pretend to help you today?";

/// Offline stand-in engine that echoes the last user message back word by word.
pub struct PlaceholderEngine {
    loaded: Mutex<Option<String>>,
    word_delay: Duration,
}

impl Default for PlaceholderEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderEngine {
    pub const GREETING: &'static str = GREETING;

    pub fn new() -> Self {
        Self {
            loaded: Mutex::new(None),
            word_delay: Duration::from_millis(40),
        }
    }

    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = delay;
        self
    }

    fn loaded_model(&self) -> Option<String> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_loaded(&self, model: Option<String>) {
        *self.loaded.lock().unwrap_or_else(|e| e.into_inner()) = model;
    }
}

fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Builds the reply fragments: one per word, then a terminal fragment with usage.
fn reply_fragments(history: &[ChatMessage], include_usage: bool) -> Vec<Fragment> {
    let last_user = history
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default();

    let reply = format!("I'm a placeholder LLM. I received: '{}'", last_user);
    let mut fragments: Vec<Fragment> = reply.split_inclusive(' ').map(Fragment::text).collect();

    let mut last = Fragment::finish(FinishReason::Stop);
    if include_usage {
        let prompt: u32 = history.iter().map(|m| word_count(&m.content)).sum();
        last = last.with_usage(UsageMetadata::tokens(prompt, word_count(&reply)));
    }
    fragments.push(last);
    fragments
}

#[async_trait]
impl InferenceEngine for PlaceholderEngine {
    #[instrument(skip(self, _config, progress))]
    async fn reload(
        &self,
        model_id: &str,
        _config: &GenerationConfig,
        progress: ProgressFn,
    ) -> Result<(), EngineError> {
        progress(&format!("Preparing placeholder for {}", model_id));
        tokio::time::sleep(self.word_delay).await;
        self.set_loaded(Some(model_id.to_string()));
        progress("Ready");
        Ok(())
    }

    async fn unload(&self) -> Result<(), EngineError> {
        self.set_loaded(None);
        Ok(())
    }

    #[instrument(skip(self, history), fields(messages = history.len()))]
    async fn stream_completion(
        &self,
        history: &[ChatMessage],
        options: CompletionOptions,
    ) -> Result<FragmentStream, EngineError> {
        let model = self.loaded_model().ok_or(EngineError::NotLoaded)?;
        debug!(model = %model, "Placeholder reply");

        let delay = self.word_delay;
        let fragments = reply_fragments(history, options.include_usage);
        let stream = futures::stream::iter(fragments).then(move |fragment| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(fragment)
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::aggregate;
    use std::sync::Arc;

    fn history(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::system("Be nice."), ChatMessage::user(text)]
    }

    #[test]
    fn test_reply_echoes_last_user_message() {
        let result = aggregate(reply_fragments(&history("hi there"), true));
        assert_eq!(result.final_text, "I'm a placeholder LLM. I received: 'hi there'");
        assert_eq!(result.finish_reason, Some(FinishReason::Stop));

        let usage = result.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 8);
        assert_eq!(usage.total_tokens, 12);
    }

    #[test]
    fn test_reply_without_usage() {
        let result = aggregate(reply_fragments(&history("x"), false));
        assert!(result.usage.is_none());
    }

    #[tokio::test]
    async fn test_stream_requires_reload() {
        let engine = PlaceholderEngine::new().with_word_delay(Duration::ZERO);
        let err = engine
            .stream_completion(&history("hi"), CompletionOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::NotLoaded));

        let steps = Arc::new(Mutex::new(Vec::new()));
        let sink = steps.clone();
        let progress: ProgressFn = Arc::new(move |text: &str| sink.lock().unwrap().push(text.to_string()));
        engine
            .reload("m1", &GenerationConfig::default(), progress)
            .await
            .unwrap();
        assert_eq!(steps.lock().unwrap().len(), 2);

        let stream = engine
            .stream_completion(&history("hi"), CompletionOptions::default())
            .await
            .unwrap();
        let fragments: Vec<Fragment> = stream.map(|f| f.unwrap()).collect().await;
        assert_eq!(aggregate(fragments).final_text, "I'm a placeholder LLM. I received: 'hi'");

        engine.unload().await.unwrap();
        assert!(engine.loaded_model().is_none());
    }
}
