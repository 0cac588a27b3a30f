//! Chat session controller.
//!
//! Owns the model lifecycle, the generation state and the conversation
//! history for one conversation. State is checked and transitioned under a
//! short synchronous lock; engine calls are awaited with the lock released so
//! overlapping intents observe `Loading` / `Streaming` and are rejected.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use futures::StreamExt;
use lumen_core::{
    Aggregate, ChatConfig, ChatEvent, ChatMessage, ConversationHistory, EngineError, FinishReason,
    Flow, Fragment, FragmentStream, GenerationState, GenerationTracker, InferenceEngine,
    LoadTicket, LumenError, MessageRole, ModelCatalog, ModelDescriptor, ModelLifecycle,
    ModelLifecycleState, ProgressFn, Result, UsageAggregator, UsageStats,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, instrument, Instrument};
use uuid::Uuid;

use crate::Notifier;

/// Result of a successful `send`.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub request_id: Uuid,
    pub final_text: String,
    pub usage: Option<UsageStats>,
    pub finish_reason: Option<FinishReason>,
}

struct SessionState {
    lifecycle: ModelLifecycle,
    generation: GenerationTracker,
    history: ConversationHistory,
    cancel: Option<CancellationToken>,
}

struct Inner {
    engine: Arc<dyn InferenceEngine>,
    catalog: ModelCatalog,
    chat: ChatConfig,
    stream_timeout: Option<Duration>,
    state: Mutex<SessionState>,
    notifier: Notifier,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Moves an outstanding load to `Error` if the `load` future is dropped
/// before the engine answers.
struct LoadGuard<'a> {
    inner: &'a Inner,
    ticket: LoadTicket,
    settled: bool,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.inner.lock();
        if !state.lifecycle.finish_load(&self.ticket, Err("load abandoned".into())) {
            return;
        }
        self.inner.notifier.lifecycle(state.lifecycle.state());
        drop(state);
        self.inner
            .notifier
            .error(format!("Load of {} abandoned", self.ticket.model_id));
    }
}

/// Fails the generation and drops its cancel token if the `send` future is
/// dropped mid-stream.
struct StreamGuard<'a> {
    inner: &'a Inner,
    request_id: Uuid,
    settled: bool,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.inner.lock();
        state.cancel = None;
        if !state.generation.fail(LumenError::Cancelled.to_string()) {
            return;
        }
        self.inner.notifier.generation(state.generation.state());
        drop(state);
        self.inner
            .notifier
            .error(format!("Generation {} abandoned", self.request_id));
    }
}

/// Handle to one conversation. Clones share the same session.
#[derive(Clone)]
pub struct ChatController {
    inner: Arc<Inner>,
}

impl ChatController {
    /// Controller whose per-fragment read timeout comes from `chat`.
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        chat: ChatConfig,
        catalog: ModelCatalog,
    ) -> (Self, UnboundedReceiver<ChatEvent>) {
        let stream_timeout = chat.stream_read_timeout();
        Self::with_stream_timeout(engine, chat, catalog, stream_timeout)
    }

    /// Like `new` with an explicit per-fragment read timeout. `None` waits forever.
    pub fn with_stream_timeout(
        engine: Arc<dyn InferenceEngine>,
        chat: ChatConfig,
        catalog: ModelCatalog,
        stream_timeout: Option<Duration>,
    ) -> (Self, UnboundedReceiver<ChatEvent>) {
        let (notifier, rx) = Notifier::channel();
        let state = SessionState {
            lifecycle: ModelLifecycle::new(),
            generation: GenerationTracker::new(),
            history: ConversationHistory::with_system_prompt(&chat.system_prompt),
            cancel: None,
        };
        let inner = Inner {
            engine,
            catalog,
            stream_timeout,
            chat,
            state: Mutex::new(state),
            notifier,
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.inner.catalog
    }

    pub fn current_state(&self) -> ModelLifecycleState {
        self.inner.lock().lifecycle.state().clone()
    }

    pub fn generation_state(&self) -> GenerationState {
        self.inner.lock().generation.state().clone()
    }

    pub fn selected_model(&self) -> Option<String> {
        self.inner.lock().lifecycle.candidate().map(str::to_string)
    }

    pub fn history(&self) -> Arc<[ChatMessage]> {
        self.inner.lock().history.snapshot()
    }

    fn reject<T>(&self, err: LumenError) -> Result<T> {
        self.inner.notifier.warn(err.to_string());
        Err(err)
    }

    /// Record the candidate model. Reselecting the same id changes nothing.
    pub fn select_model(&self, model_id: &str) -> Result<ModelDescriptor> {
        let mut state = self.inner.lock();
        let unchanged = state.lifecycle.candidate() == Some(model_id.trim());
        let model = match state.lifecycle.select(&self.inner.catalog, model_id) {
            Ok(model) => model.clone(),
            Err(e) => {
                drop(state);
                return self.reject(e);
            }
        };
        if !unchanged {
            self.inner
                .notifier
                .info(format!("Selected model: {}", model.display_name));
        }
        Ok(model)
    }

    fn progress_callback(&self, epoch: u64) -> ProgressFn {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |text: &str| {
            let Some(inner) = weak.upgrade() else { return };
            if inner.lock().lifecycle.is_current(epoch) {
                inner.notifier.progress(text);
            } else {
                debug!(epoch, "Dropping stale load progress");
            }
        })
    }

    /// Load `model_id`, replacing any ready model and resetting the conversation.
    #[instrument(skip(self))]
    pub async fn load(&self, model_id: &str) -> Result<()> {
        let notifier = &self.inner.notifier;

        let ticket = {
            let mut state = self.inner.lock();
            if !state.generation.state().is_idle() {
                drop(state);
                return self.reject(LumenError::GenerationInProgress);
            }
            let model_id = match self.inner.catalog.validate(model_id) {
                Ok(model) => model.id.clone(),
                Err(e) => {
                    drop(state);
                    return self.reject(e);
                }
            };
            let ticket = match state.lifecycle.begin_load(&model_id) {
                Ok(ticket) => ticket,
                Err(e) => {
                    drop(state);
                    return self.reject(e);
                }
            };
            state.history.reset(&self.inner.chat.system_prompt);
            notifier.lifecycle(state.lifecycle.state());
            ticket
        };
        let mut guard = LoadGuard {
            inner: &self.inner,
            ticket,
            settled: false,
        };
        let ticket = &guard.ticket;

        notifier.info(format!("Loading model: {}", ticket.model_id));

        if let Some(previous) = &ticket.previous {
            if let Err(e) = self.inner.engine.unload().await {
                notifier.warn(format!("Failed to unload {}: {}", previous, e));
            }
        }

        let outcome = self
            .inner
            .engine
            .reload(
                &ticket.model_id,
                &self.inner.chat.generation(),
                self.progress_callback(ticket.epoch),
            )
            .await
            .map_err(|e| e.to_string());

        let mut state = self.inner.lock();
        if !state.lifecycle.finish_load(ticket, outcome.clone()) {
            debug!(epoch = ticket.epoch, "Ignoring stale load outcome");
        } else {
            notifier.lifecycle(state.lifecycle.state());
        }
        drop(state);
        let model_id = ticket.model_id.clone();
        guard.settled = true;

        match outcome {
            Ok(()) => {
                notifier.info(format!("Model {} loaded.", model_id));
                Ok(())
            }
            Err(reason) => {
                notifier.error(format!("Failed to load {}: {}", model_id, reason));
                Err(LumenError::EngineInit(reason))
            }
        }
    }

    /// `Ready | Error -> Unloaded`.
    #[instrument(skip(self))]
    pub async fn unload(&self) -> Result<()> {
        let previous = {
            let mut state = self.inner.lock();
            if !state.generation.state().is_idle() {
                drop(state);
                return self.reject(LumenError::GenerationInProgress);
            }
            let previous = match state.lifecycle.unload() {
                Ok(previous) => previous,
                Err(e) => {
                    drop(state);
                    return self.reject(e);
                }
            };
            self.inner.notifier.lifecycle(state.lifecycle.state());
            previous
        };

        if let Some(model_id) = previous {
            if let Err(e) = self.inner.engine.unload().await {
                let warning = LumenError::Unload(e.to_string());
                self.inner.notifier.warn(format!("{} ({})", warning, model_id));
            }
            self.inner.notifier.info(format!("Model {} unloaded.", model_id));
        }
        Ok(())
    }

    /// Send one user turn and stream the reply.
    ///
    /// Blank input is ignored and returns `Ok(None)`. On success the assistant
    /// turn is committed to history; on failure only the user turn remains.
    /// Either way the generation must be acknowledged before the next send.
    pub async fn send(&self, user_text: &str) -> Result<Option<Completion>> {
        let user_text = user_text.trim();
        if user_text.is_empty() {
            return Ok(None);
        }

        let request_id = Uuid::new_v4();
        let (snapshot, cancel) = {
            let mut state = self.inner.lock();
            if !state.lifecycle.state().is_ready() {
                drop(state);
                return self.reject(LumenError::ModelNotReady);
            }
            if !state.generation.state().is_idle() {
                drop(state);
                return self.reject(LumenError::GenerationInProgress);
            }
            if let Err(e) = state.history.append(MessageRole::User, user_text) {
                drop(state);
                return self.reject(e);
            }
            state.generation.begin()?;
            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());
            self.inner.notifier.generation(state.generation.state());
            (state.history.snapshot(), cancel)
        };
        let mut guard = StreamGuard {
            inner: &self.inner,
            request_id,
            settled: false,
        };

        let span = info_span!("generation", request_id = %request_id);
        let outcome = self
            .stream_reply(&snapshot, &cancel)
            .instrument(span)
            .await;

        let mut state = self.inner.lock();
        state.cancel = None;
        guard.settled = true;

        let outcome = outcome.and_then(|aggregate| {
            state
                .history
                .append(MessageRole::Assistant, aggregate.final_text.clone())?;
            Ok(aggregate)
        });

        match outcome {
            Ok(aggregate) => {
                let completion = Completion {
                    request_id,
                    final_text: aggregate.final_text,
                    usage: aggregate.usage,
                    finish_reason: aggregate.finish_reason,
                };
                state
                    .generation
                    .complete(completion.final_text.clone(), completion.usage.clone());
                self.inner.notifier.generation(state.generation.state());
                drop(state);

                match &completion.usage {
                    Some(usage) => self
                        .inner
                        .notifier
                        .info(format!("Generation {} complete: {}", request_id, usage)),
                    None => self
                        .inner
                        .notifier
                        .info(format!("Generation {} complete.", request_id)),
                }
                Ok(Some(completion))
            }
            Err(e) => {
                state.generation.fail(e.to_string());
                self.inner.notifier.generation(state.generation.state());
                drop(state);

                self.inner
                    .notifier
                    .error(format!("Generation {} failed: {}", request_id, e));
                Err(e)
            }
        }
    }

    async fn stream_reply(
        &self,
        history: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<Aggregate> {
        let options = self.inner.chat.completion_options();
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LumenError::Cancelled),
            opened = self.inner.engine.stream_completion(history, options) => {
                opened.map_err(|e| LumenError::EngineGeneration(e.to_string()))?
            }
        };

        let mut aggregator = UsageAggregator::new();
        let mut first_text: Option<Instant> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LumenError::Cancelled),
                next = self.next_fragment(&mut stream) => next?,
            };

            let Some(fragment) = next else {
                debug!(fragments = aggregator.consumed(), "Stream exhausted");
                break;
            };
            let fragment = fragment.map_err(|e| LumenError::EngineGeneration(e.to_string()))?;

            if first_text.is_none() && fragment.delta.as_deref().is_some_and(|d| !d.is_empty()) {
                first_text = Some(Instant::now());
            }

            let flow = aggregator.push(fragment);
            {
                let mut state = self.inner.lock();
                if state.generation.update(aggregator.partial_text()) {
                    self.inner.notifier.generation(state.generation.state());
                }
            }

            if flow == Flow::Stop {
                break;
            }
        }

        Ok(aggregator.finalize(first_text.map(|t| t.elapsed())))
    }

    async fn next_fragment(
        &self,
        stream: &mut FragmentStream,
    ) -> Result<Option<std::result::Result<Fragment, EngineError>>> {
        match self.inner.stream_timeout {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| LumenError::StreamTimeout(limit)),
            None => Ok(stream.next().await),
        }
    }

    /// Request cancellation of the in-flight generation. Returns false when
    /// nothing is streaming.
    pub fn cancel(&self) -> bool {
        let state = self.inner.lock();
        match &state.cancel {
            Some(token) => {
                token.cancel();
                drop(state);
                self.inner.notifier.info("Cancelling generation");
                true
            }
            None => false,
        }
    }

    /// `Completed | Failed -> Idle`, re-arming `send`.
    pub fn acknowledge(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.generation.acknowledge()?;
        self.inner.notifier.generation(state.generation.state());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lumen_core::{CompletionOptions, GenerationConfig, LogLevel, ResourceHint, UsageMetadata};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Script {
        fragments: Vec<std::result::Result<Fragment, EngineError>>,
        hang: bool,
    }

    /// Engine double driven by queued scripts.
    #[derive(Default)]
    struct ScriptedEngine {
        load_gate: Option<Arc<Notify>>,
        load_errors: Mutex<VecDeque<String>>,
        unload_error: Option<String>,
        scripts: Mutex<VecDeque<Script>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
        reloads: AtomicUsize,
        unloads: AtomicUsize,
    }

    impl ScriptedEngine {
        fn script(&self, fragments: Vec<std::result::Result<Fragment, EngineError>>) {
            self.scripts.lock().unwrap().push_back(Script {
                fragments,
                hang: false,
            });
        }

        fn script_hanging(&self, fragments: Vec<std::result::Result<Fragment, EngineError>>) {
            self.scripts.lock().unwrap().push_back(Script {
                fragments,
                hang: true,
            });
        }
    }

    #[async_trait]
    impl InferenceEngine for ScriptedEngine {
        async fn reload(
            &self,
            model_id: &str,
            _config: &GenerationConfig,
            progress: ProgressFn,
        ) -> std::result::Result<(), EngineError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            progress(&format!("Fetching {}", model_id));
            if let Some(gate) = &self.load_gate {
                gate.notified().await;
            }
            match self.load_errors.lock().unwrap().pop_front() {
                Some(reason) => Err(EngineError::Engine(reason)),
                None => Ok(()),
            }
        }

        async fn unload(&self) -> std::result::Result<(), EngineError> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            match &self.unload_error {
                Some(reason) => Err(EngineError::Engine(reason.clone())),
                None => Ok(()),
            }
        }

        async fn stream_completion(
            &self,
            history: &[ChatMessage],
            _options: CompletionOptions,
        ) -> std::result::Result<FragmentStream, EngineError> {
            self.seen.lock().unwrap().push(history.to_vec());
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Script {
                fragments: vec![Ok(Fragment::finish(FinishReason::Stop))],
                hang: false,
            });
            let fragments = futures::stream::iter(script.fragments);
            if script.hang {
                Ok(Box::pin(fragments.chain(futures::stream::pending())))
            } else {
                Ok(Box::pin(fragments))
            }
        }
    }

    fn catalog() -> ModelCatalog {
        ModelCatalog::new(vec![
            ModelDescriptor::new("m1", "Model One", ResourceHint::Megabytes(800)),
            ModelDescriptor::new("m2", "Model Two", ResourceHint::Megabytes(1600)),
        ])
    }

    fn controller(engine: Arc<ScriptedEngine>) -> (ChatController, UnboundedReceiver<ChatEvent>) {
        ChatController::new(engine, ChatConfig::default(), catalog())
    }

    fn hello_script() -> Vec<std::result::Result<Fragment, EngineError>> {
        vec![
            Ok(Fragment::text("He")),
            Ok(Fragment::text("llo!")),
            Ok(Fragment::finish(FinishReason::Stop).with_usage(UsageMetadata::tokens(3, 2))),
        ]
    }

    async fn wait_for<F>(rx: &mut UnboundedReceiver<ChatEvent>, pred: F) -> ChatEvent
    where
        F: Fn(&ChatEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn is_streaming_text(event: &ChatEvent, text: &str) -> bool {
        matches!(event, ChatEvent::Generation(GenerationState::Streaming { partial_text }) if partial_text == text)
    }

    #[tokio::test]
    async fn test_end_to_end_hello() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script(hello_script());
        let (chat, mut rx) = controller(engine.clone());

        chat.select_model("m1").unwrap();
        chat.load("m1").await.unwrap();
        assert_eq!(chat.current_state(), ModelLifecycleState::Ready { model_id: "m1".into() });

        let completion = chat.send("hello").await.unwrap().unwrap();
        assert_eq!(completion.final_text, "Hello!");
        assert_eq!(completion.finish_reason, Some(FinishReason::Stop));
        assert_eq!(
            completion.usage.as_ref().unwrap().to_string(),
            "3 (prompt) + 2 (completion) = 5 (total)"
        );

        let history = chat.history();
        assert_eq!(
            history.to_vec(),
            vec![
                ChatMessage::system(lumen_core::config::DEFAULT_SYSTEM_PROMPT),
                ChatMessage::user("hello"),
                ChatMessage::assistant("Hello!"),
            ]
        );

        wait_for(&mut rx, |e| matches!(e, ChatEvent::Progress(p) if p == "Loading: Fetching m1")).await;
        wait_for(&mut rx, |e| is_streaming_text(e, "He")).await;
        wait_for(&mut rx, |e| is_streaming_text(e, "Hello!")).await;
        wait_for(&mut rx, |e| matches!(e, ChatEvent::Generation(GenerationState::Completed { .. }))).await;

        assert!(chat.generation_state().is_terminal());
        chat.acknowledge().unwrap();
        assert!(chat.generation_state().is_idle());
    }

    #[tokio::test]
    async fn test_concurrent_load_is_rejected() {
        let gate = Arc::new(Notify::new());
        let engine = Arc::new(ScriptedEngine {
            load_gate: Some(gate.clone()),
            ..Default::default()
        });
        let (chat, mut rx) = controller(engine.clone());

        let first = tokio::spawn({
            let chat = chat.clone();
            async move { chat.load("m1").await }
        });
        wait_for(&mut rx, |e| matches!(e, ChatEvent::Lifecycle(s) if s.is_loading())).await;

        assert!(matches!(chat.load("m2").await, Err(LumenError::AlreadyInProgress)));
        assert!(matches!(chat.load("m1").await, Err(LumenError::AlreadyInProgress)));
        assert!(matches!(chat.unload().await, Err(LumenError::AlreadyInProgress)));

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(chat.current_state(), ModelLifecycleState::Ready { model_id: "m1".into() });
        assert_eq!(engine.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_only_user_turn() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script(vec![
            Ok(Fragment::text("He")),
            Err(EngineError::Engine("GPU lost".into())),
        ]);
        let (chat, _rx) = controller(engine.clone());
        chat.load("m1").await.unwrap();

        let before = chat.history().len();
        let err = chat.send("hello").await.unwrap_err();
        assert!(matches!(err, LumenError::EngineGeneration(_)));

        let history = chat.history();
        assert_eq!(history.len(), before + 1);
        assert_eq!(history.last(), Some(&ChatMessage::user("hello")));
        match chat.generation_state() {
            GenerationState::Failed { partial_text, .. } => assert_eq!(partial_text, "He"),
            other => panic!("unexpected state: {:?}", other),
        }

        assert!(matches!(chat.send("again").await, Err(LumenError::GenerationInProgress)));
        assert_eq!(chat.history().len(), before + 1);

        chat.acknowledge().unwrap();
        chat.send("again").await.unwrap();
        assert_eq!(chat.history().len(), before + 3);
    }

    #[tokio::test]
    async fn test_load_resets_history_before_next_request() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script(hello_script());
        engine.script(hello_script());
        let (chat, _rx) = controller(engine.clone());

        chat.load("m1").await.unwrap();
        chat.send("hello").await.unwrap();
        chat.acknowledge().unwrap();
        assert_eq!(chat.history().len(), 3);

        chat.load("m2").await.unwrap();
        let history = chat.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, MessageRole::System);
        assert_eq!(engine.unloads.load(Ordering::SeqCst), 1);

        chat.send("hi").await.unwrap();
        let seen = engine.seen.lock().unwrap();
        assert_eq!(seen[1].len(), 2);
        assert_eq!(seen[1][0].role, MessageRole::System);
    }

    #[tokio::test]
    async fn test_unload_failure_does_not_block_switch() {
        let engine = Arc::new(ScriptedEngine {
            unload_error: Some("busy".into()),
            ..Default::default()
        });
        let (chat, mut rx) = controller(engine.clone());

        chat.load("m1").await.unwrap();
        chat.load("m2").await.unwrap();
        assert_eq!(chat.current_state(), ModelLifecycleState::Ready { model_id: "m2".into() });

        let event = wait_for(&mut rx, |e| matches!(e, ChatEvent::Log(entry) if entry.level == LogLevel::Warn)).await;
        let ChatEvent::Log(entry) = event else { unreachable!() };
        assert!(entry.message.contains("busy"));

        chat.unload().await.unwrap();
        assert_eq!(chat.current_state(), ModelLifecycleState::Unloaded);
        assert_eq!(engine.unloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_load_failure_then_retry() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.load_errors.lock().unwrap().push_back("out of memory".into());
        let (chat, _rx) = controller(engine.clone());

        let err = chat.load("m1").await.unwrap_err();
        assert!(matches!(err, LumenError::EngineInit(ref r) if r.contains("out of memory")));
        assert!(matches!(chat.current_state(), ModelLifecycleState::Error { .. }));
        assert!(matches!(chat.send("hello").await, Err(LumenError::ModelNotReady)));
        assert_eq!(chat.history().len(), 1);

        chat.load("m1").await.unwrap();
        assert!(chat.current_state().is_ready());
        assert_eq!(engine.unloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_validation_and_blank_input() {
        let engine = Arc::new(ScriptedEngine::default());
        let (chat, _rx) = controller(engine.clone());

        assert!(matches!(chat.select_model(""), Err(LumenError::Validation(_))));
        assert!(matches!(chat.load("nope").await, Err(LumenError::UnknownModel(_))));
        assert_eq!(chat.current_state(), ModelLifecycleState::Unloaded);

        chat.select_model("m2").unwrap();
        chat.select_model("m2").unwrap();
        assert_eq!(chat.selected_model().as_deref(), Some("m2"));
        assert_eq!(chat.current_state(), ModelLifecycleState::Unloaded);

        chat.load("m2").await.unwrap();
        assert_eq!(chat.send("   ").await.unwrap(), None);
        assert!(chat.generation_state().is_idle());
        assert!(engine.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_and_load_while_streaming() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_hanging(vec![Ok(Fragment::text("He"))]);
        let (chat, mut rx) = controller(engine.clone());
        chat.load("m1").await.unwrap();

        let pending = tokio::spawn({
            let chat = chat.clone();
            async move { chat.send("hello").await }
        });
        wait_for(&mut rx, |e| is_streaming_text(e, "He")).await;

        assert!(matches!(chat.load("m2").await, Err(LumenError::GenerationInProgress)));
        assert!(matches!(chat.unload().await, Err(LumenError::GenerationInProgress)));
        assert!(chat.current_state().is_ready());

        assert!(matches!(chat.send("again").await, Err(LumenError::GenerationInProgress)));
        assert_eq!(chat.history().len(), 2);
        assert_eq!(engine.seen.lock().unwrap().len(), 1);

        assert!(chat.cancel());
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, LumenError::Cancelled));
        assert_eq!(
            chat.generation_state(),
            GenerationState::Failed {
                reason: "Generation cancelled".into(),
                partial_text: "He".into(),
            }
        );
        assert_eq!(chat.history().len(), 2);
        assert!(!chat.cancel());

        // Unacknowledged terminal state still blocks a reload.
        assert!(matches!(chat.load("m2").await, Err(LumenError::GenerationInProgress)));
        chat.acknowledge().unwrap();
        chat.load("m2").await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_read_timeout() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_hanging(vec![Ok(Fragment::text("partial"))]);
        let (chat, _rx) = ChatController::with_stream_timeout(
            engine,
            ChatConfig::default(),
            catalog(),
            Some(Duration::from_millis(50)),
        );
        chat.load("m1").await.unwrap();

        let err = chat.send("hello").await.unwrap_err();
        assert!(matches!(err, LumenError::StreamTimeout(_)));
        assert!(matches!(chat.generation_state(), GenerationState::Failed { .. }));
        assert_eq!(chat.history().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_load_future_settles_in_error() {
        let gate = Arc::new(Notify::new());
        let engine = Arc::new(ScriptedEngine {
            load_gate: Some(gate.clone()),
            ..Default::default()
        });
        let (chat, mut rx) = controller(engine.clone());

        let timed_out = tokio::time::timeout(Duration::from_millis(50), chat.load("m1")).await;
        assert!(timed_out.is_err());
        assert_eq!(
            chat.current_state(),
            ModelLifecycleState::Error {
                model_id: "m1".into(),
                reason: "load abandoned".into(),
            }
        );
        wait_for(&mut rx, |e| matches!(e, ChatEvent::Log(entry) if entry.level == LogLevel::Error)).await;

        gate.notify_one();
        chat.load("m1").await.unwrap();
        assert_eq!(chat.current_state(), ModelLifecycleState::Ready { model_id: "m1".into() });
        assert_eq!(engine.reloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_send_future_fails_generation() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.script_hanging(vec![Ok(Fragment::text("He"))]);
        let (chat, mut rx) =
            ChatController::with_stream_timeout(engine, ChatConfig::default(), catalog(), None);
        chat.load("m1").await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(50), chat.send("hello")).await;
        assert!(timed_out.is_err());
        assert_eq!(
            chat.generation_state(),
            GenerationState::Failed {
                reason: "Generation cancelled".into(),
                partial_text: "He".into(),
            }
        );
        assert!(!chat.cancel());
        assert_eq!(chat.history().len(), 2);
        wait_for(&mut rx, |e| matches!(e, ChatEvent::Generation(GenerationState::Failed { .. }))).await;

        chat.acknowledge().unwrap();
        chat.load("m2").await.unwrap();
        assert!(chat.current_state().is_ready());
    }

    #[tokio::test]
    async fn test_dropped_receiver_with_placeholder_engine() {
        let engine = Arc::new(
            lumen_llm::PlaceholderEngine::new().with_word_delay(Duration::ZERO),
        );
        let (chat, rx) = ChatController::new(engine, ChatConfig::default(), catalog());
        drop(rx);

        chat.load("m1").await.unwrap();
        let completion = chat.send("ping").await.unwrap().unwrap();
        assert_eq!(completion.final_text, "I'm a placeholder LLM. I received: 'ping'");
        assert!(completion.usage.is_some());
    }
}
