use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use lumen_core::{
    ChatMessage, CompletionOptions, EngineError, FinishReason, Fragment, FragmentStream,
    GenerationConfig, InferenceEngine, ModelDescriptor, ProgressFn, ResourceHint, UsageMetadata,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_err(e: impl ToString) -> EngineError {
    EngineError::Http(e.to_string())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OllamaMetrics {
    #[serde(default)]
    pub total_duration: u64,
    #[serde(default)]
    pub load_duration: u64,
    #[serde(default)]
    pub prompt_eval_count: Option<u32>,
    #[serde(default)]
    pub prompt_eval_duration: u64,
    #[serde(default)]
    pub eval_count: Option<u32>,
    #[serde(default)]
    pub eval_duration: u64,
}

impl OllamaMetrics {
    pub fn prompt_eval_ms(&self) -> f64 {
        self.prompt_eval_duration as f64 / 1_000_000.0
    }

    pub fn eval_ms(&self) -> f64 {
        self.eval_duration as f64 / 1_000_000.0
    }

    fn per_sec(count: Option<u32>, duration_ns: u64) -> Option<f64> {
        match count {
            Some(count) if duration_ns > 0 => {
                Some(count as f64 / (duration_ns as f64 / 1_000_000_000.0))
            }
            _ => None,
        }
    }

    pub fn tokens_per_sec(&self) -> Option<f64> {
        Self::per_sec(self.eval_count, self.eval_duration)
    }

    pub fn prompt_tokens_per_sec(&self) -> Option<f64> {
        Self::per_sec(self.prompt_eval_count, self.prompt_eval_duration)
    }

    fn to_usage(&self) -> UsageMetadata {
        let ms = |ns: u64| (ns > 0).then(|| ns as f64 / 1_000_000.0);
        UsageMetadata {
            prompt_tokens: self.prompt_eval_count,
            completion_tokens: self.eval_count,
            total_tokens: None,
            prefill_tokens_per_s: self.prompt_tokens_per_sec(),
            decode_tokens_per_s: self.tokens_per_sec(),
            prefill_time_ms: ms(self.prompt_eval_duration),
            decode_time_ms: ms(self.eval_duration),
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl From<&GenerationConfig> for OllamaOptions {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            num_predict: config.max_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    metrics: OllamaMetrics,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
    size: u64,
    #[serde(default)]
    details: Option<ModelDetails>,
}

#[derive(Debug, Deserialize)]
struct ModelDetails {
    #[serde(default)]
    quantization_level: Option<String>,
}

#[derive(Serialize)]
struct UnloadRequest<'a> {
    model: &'a str,
    keep_alive: i32,
}

#[derive(Debug, Clone)]
struct ActiveModel {
    id: String,
    config: GenerationConfig,
}

/// Engine backed by a local Ollama daemon.
pub struct OllamaEngine {
    client: Client,
    host: String,
    request_timeout: Duration,
    active: Mutex<Option<ActiveModel>>,
}

impl OllamaEngine {
    pub fn new(host: &str) -> Self {
        Self {
            client: Client::new(),
            host: host.trim_end_matches('/').replace("/v1", ""),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            active: Mutex::new(None),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn active_model(&self) -> Option<String> {
        self.active_guard().as_ref().map(|m| m.id.clone())
    }

    fn active_guard(&self) -> std::sync::MutexGuard<'_, Option<ActiveModel>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Installed models as catalog entries.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn list_models(&self) -> Result<Vec<ModelDescriptor>, EngineError> {
        let url = format!("{}/api/tags", self.host);
        let resp = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(http_err)?;

        if !resp.status().is_success() {
            return Err(EngineError::Http(format!(
                "Failed to list models: {}",
                resp.status()
            )));
        }

        let tags: TagsResponse = resp.json().await.map_err(http_err)?;
        info!(count = tags.models.len(), "Fetched models from Ollama");

        let models = tags
            .models
            .into_iter()
            .map(|m| {
                let quantization = m.details.and_then(|d| d.quantization_level);
                let display_name = match &quantization {
                    Some(q) => format!("{}:{} (Local)", m.name, q),
                    None => format!("{} (Local)", m.name),
                };
                ModelDescriptor::new(
                    m.name,
                    display_name,
                    ResourceHint::Megabytes(m.size / (1024 * 1024)),
                )
            })
            .collect();

        Ok(models)
    }

    async fn warmup(&self, model_id: &str) -> Result<(), EngineError> {
        let url = format!("{}/api/chat", self.host);
        let request = OllamaChatRequest {
            model: model_id,
            messages: vec![OllamaMessage {
                role: "user",
                content: "hi",
            }],
            stream: false,
            options: OllamaOptions {
                temperature: 0.0,
                top_p: 1.0,
                num_predict: Some(1),
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(http_err)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Engine(format!(
                "Warmup failed: {} - {}",
                status, body
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceEngine for OllamaEngine {
    #[instrument(skip(self, config, progress), fields(host = %self.host))]
    async fn reload(
        &self,
        model_id: &str,
        config: &GenerationConfig,
        progress: ProgressFn,
    ) -> Result<(), EngineError> {
        progress(&format!("Checking model {}", model_id));
        let installed = self.list_models().await?;
        if !installed.iter().any(|m| m.id == model_id) {
            return Err(EngineError::ModelNotFound(model_id.to_string()));
        }

        progress(&format!("Warming up {}", model_id));
        self.warmup(model_id).await?;

        *self.active_guard() = Some(ActiveModel {
            id: model_id.to_string(),
            config: config.clone(),
        });

        progress("Ready");
        info!(model = model_id, "Model loaded");
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn unload(&self) -> Result<(), EngineError> {
        let Some(active) = self.active_guard().take() else {
            debug!("Nothing to unload");
            return Ok(());
        };

        let url = format!("{}/api/generate", self.host);
        info!(model = %active.id, "Unloading model");

        self.client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&UnloadRequest {
                model: &active.id,
                keep_alive: 0,
            })
            .send()
            .await
            .map_err(http_err)?;

        Ok(())
    }

    #[instrument(skip(self, history), fields(messages = history.len()))]
    async fn stream_completion(
        &self,
        history: &[ChatMessage],
        options: CompletionOptions,
    ) -> Result<FragmentStream, EngineError> {
        let active = self.active_guard().clone().ok_or(EngineError::NotLoaded)?;
        let url = format!("{}/api/chat", self.host);

        let request = OllamaChatRequest {
            model: &active.id,
            messages: history
                .iter()
                .map(|m| OllamaMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: true,
            options: OllamaOptions::from(&active.config),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(http_err)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Engine(format!("Chat failed: {} - {}", status, body)));
        }

        let include_usage = options.include_usage;
        let fragments = ndjson_lines(Box::pin(response.bytes_stream()))
            .map(move |batch| match batch {
                Ok(lines) => lines
                    .into_iter()
                    .map(|line| parse_chunk(&line, include_usage))
                    .collect::<Vec<_>>(),
                Err(e) => vec![Err(http_err(e))],
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(fragments))
    }
}

/// Regroups a chunked byte stream into batches of complete lines. A final
/// line without a trailing newline is emitted once the input ends.
fn ndjson_lines<S, B, E>(bytes: S) -> impl Stream<Item = Result<Vec<String>, E>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    stream::unfold(Some((bytes, LineBuffer::default())), |state| async move {
        let (mut bytes, mut lines) = state?;
        match bytes.next().await {
            Some(Ok(chunk)) => {
                let batch = lines.push(chunk.as_ref());
                Some((Ok(batch), Some((bytes, lines))))
            }
            Some(Err(e)) => Some((Err(e), Some((bytes, lines)))),
            None => Some((Ok(lines.flush().into_iter().collect()), None)),
        }
    })
}

/// Splits a byte stream into complete NDJSON lines, carrying partial lines
/// across chunk boundaries.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    /// Take whatever is left after the last newline.
    fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        if text.is_empty() {
            return None;
        }
        debug!(bytes = rest.len(), "Flushing unterminated final line");
        Some(text)
    }
}

fn finish_reason(done_reason: Option<&str>) -> FinishReason {
    match done_reason {
        None | Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some(other) => {
            warn!(reason = other, "Unrecognized done_reason");
            FinishReason::Other
        }
    }
}

fn parse_chunk(line: &str, include_usage: bool) -> Result<Fragment, EngineError> {
    let chunk: OllamaChatChunk = serde_json::from_str(line).map_err(|e| {
        let preview: String = line.chars().take(200).collect();
        EngineError::Parse(format!("{} - line: {}", e, preview))
    })?;

    if let Some(error) = chunk.error {
        return Err(EngineError::Engine(error));
    }

    let mut fragment = Fragment {
        delta: chunk.message.map(|m| m.content).filter(|c| !c.is_empty()),
        ..Default::default()
    };

    if chunk.done {
        fragment.finish_reason = Some(finish_reason(chunk.done_reason.as_deref()));
        if include_usage {
            debug!(
                "Ollama: {:.0}ms prompt eval, {:.0}ms eval, {:?} tok/s",
                chunk.metrics.prompt_eval_ms(),
                chunk.metrics.eval_ms(),
                chunk.metrics.tokens_per_sec()
            );
            fragment.usage = Some(chunk.metrics.to_usage());
        }
    }

    Ok(fragment)
}
