//! Streaming generation client abstraction
//!
//! Provides a unified interface over chat-completion backends:
//! - OpenAI-compatible HTTP APIs, consumed as server-sent events
//! - A scripted mock for tests and offline development
//!
//! Clients emit [`GenerationEvent`]s in generation order; the engine
//! turns those into response chunks and tool dispatches.

use docpilot_common::config::GenerationConfig;
use docpilot_common::errors::{AppError, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Failures specific to generation calls
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("model API error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("model stream transport failed: {message}")]
    Transport { message: String },
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        AppError::Generation {
            message: err.to_string(),
        }
    }
}

/// One step of a generation stream
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// A fragment of response text, in arrival order
    Delta(String),

    /// The model requested a tool invocation
    ToolCall(ToolCall),

    /// End of stream; nothing follows
    Done,
}

/// Closed set of tools the model may request. Anything else the model
/// asks for is logged and dropped before it reaches the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    /// Fetch additional documentation passages for a refined query
    RetrieveContent { query: String },
}

/// One streaming completion request
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,

    /// Advertise the retrieval tool to the model
    pub allow_tools: bool,
}

pub type GenerationStream = Pin<Box<dyn Stream<Item = Result<GenerationEvent>> + Send>>;

/// Trait for streaming response generation
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Open a streaming completion. A healthy stream ends with
    /// [`GenerationEvent::Done`]; transport failures surface as `Err`
    /// items and end the stream.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// OpenAI-compatible streaming chat client
pub struct OpenAiGenerationClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,

    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,

    #[serde(default)]
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Deserialize)]
struct ToolCallFragment {
    #[serde(default)]
    index: u32,

    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Deserialize, Default)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,

    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct RetrieveArgs {
    query: String,
}

impl OpenAiGenerationClient {
    /// Create a new client from configuration
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AppError::Configuration {
                message: "generation.api_key required for the openai provider".to_string(),
            })?;

        // The whole-request timeout also bounds how long a stream may
        // stay open, which is the per-call generation budget.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        })
    }

    fn tool_definitions() -> serde_json::Value {
        serde_json::json!([{
            "type": "function",
            "function": {
                "name": "retrieve_content",
                "description": "Search the documentation for passages matching a refined query, when the provided sources are not enough to answer.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Search query"
                        }
                    },
                    "required": ["query"]
                }
            }
        }])
    }
}

#[async_trait]
impl GenerationClient for OpenAiGenerationClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: request.system,
                },
                ChatMessage {
                    role: "user",
                    content: request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
            tools: request.allow_tools.then(Self::tool_definitions),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Transport {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(GenerationError::Upstream { status, message }.into());
        }

        let stream = response
            .bytes_stream()
            .scan(SseDecoder::default(), |decoder, chunk| {
                let events = match chunk {
                    Ok(bytes) => decoder.push(&bytes),
                    Err(e) => vec![Err(GenerationError::Transport {
                        message: e.to_string(),
                    }
                    .into())],
                };
                futures::future::ready(Some(stream::iter(events)))
            })
            .flatten();

        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Incremental server-sent-events decoder.
///
/// Network chunks split lines at arbitrary byte offsets, so raw bytes
/// accumulate in a buffer and only complete lines are decoded. Tool-call
/// arguments arrive as string fragments spread over many chunks and are
/// reassembled until the matching `finish_reason`.
#[derive(Default)]
struct SseDecoder {
    line_buffer: String,
    tool_name: String,
    tool_arguments: String,
    finished: bool,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<GenerationEvent>> {
        self.line_buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=pos).collect();
            self.decode_line(line.trim(), &mut events);
        }
        events
    }

    fn decode_line(&mut self, line: &str, events: &mut Vec<Result<GenerationEvent>>) {
        let Some(data) = line.strip_prefix("data: ") else {
            return;
        };
        if self.finished {
            return;
        }
        if data == "[DONE]" {
            self.flush_tool_call(events);
            events.push(Ok(GenerationEvent::Done));
            self.finished = true;
            return;
        }

        let chunk = match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping unparseable stream chunk");
                return;
            }
        };

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    events.push(Ok(GenerationEvent::Delta(content)));
                }
            }
            if let Some(fragments) = choice.delta.tool_calls {
                for fragment in fragments {
                    // Parallel tool calls are not supported; only the
                    // first slot is assembled.
                    if fragment.index != 0 {
                        continue;
                    }
                    if let Some(function) = fragment.function {
                        if let Some(name) = function.name {
                            self.tool_name = name;
                        }
                        if let Some(arguments) = function.arguments {
                            self.tool_arguments.push_str(&arguments);
                        }
                    }
                }
            }
            if choice.finish_reason.as_deref() == Some("tool_calls") {
                self.flush_tool_call(events);
            }
        }
    }

    fn flush_tool_call(&mut self, events: &mut Vec<Result<GenerationEvent>>) {
        if self.tool_name.is_empty() {
            return;
        }
        let name = std::mem::take(&mut self.tool_name);
        let raw_arguments = std::mem::take(&mut self.tool_arguments);

        match name.as_str() {
            "retrieve_content" => match serde_json::from_str::<RetrieveArgs>(&raw_arguments) {
                Ok(args) if !args.query.trim().is_empty() => {
                    events.push(Ok(GenerationEvent::ToolCall(ToolCall::RetrieveContent {
                        query: args.query,
                    })));
                }
                Ok(_) => warn!("retrieve_content call with empty query, skipping"),
                Err(e) => {
                    warn!(error = %e, "retrieve_content call with malformed arguments, skipping")
                }
            },
            other => warn!(tool = other, "model requested unknown tool, skipping"),
        }
    }
}

const DEFAULT_MOCK_TEXT: &str =
    "This answer was produced by the mock model. See [1] for the source passage.";

/// What one scripted [`MockGenerationClient`] call streams
pub enum MockResponse {
    /// Stream these events; `Done` is appended if missing
    Events(Vec<GenerationEvent>),

    /// Stream `after`, then fail
    Failure {
        after: Vec<GenerationEvent>,
        message: String,
    },

    /// Never yield an event (for cancellation and watchdog tests)
    Stall,
}

/// Scripted generation client for tests and offline development.
///
/// Each `generate` call pops the next scripted response; with no script
/// it streams a fixed one-citation answer.
pub struct MockGenerationClient {
    responses: Mutex<VecDeque<MockResponse>>,
    calls: AtomicUsize,
    last_request: std::sync::Mutex<Option<GenerationRequest>>,
    model: String,
}

impl MockGenerationClient {
    pub fn new() -> Self {
        Self::with_script(Vec::new())
    }

    pub fn with_script(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            last_request: std::sync::Mutex::new(None),
            model: "mock-generation".to_string(),
        }
    }

    /// One scripted response streaming `text` word by word
    pub fn with_text(text: &str) -> Self {
        Self::with_script(vec![MockResponse::Events(Self::split_deltas(text))])
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most recent request, for asserting on prompt assembly
    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().ok()?.clone()
    }

    fn split_deltas(text: &str) -> Vec<GenerationEvent> {
        text.split_inclusive(' ')
            .map(|fragment| GenerationEvent::Delta(fragment.to_string()))
            .collect()
    }
}

impl Default for MockGenerationClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationClient for MockGenerationClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(request);
        }

        let response = self
            .responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| MockResponse::Events(Self::split_deltas(DEFAULT_MOCK_TEXT)));

        match response {
            MockResponse::Events(events) => {
                let mut items: Vec<Result<GenerationEvent>> =
                    events.into_iter().map(Ok).collect();
                if !matches!(items.last(), Some(Ok(GenerationEvent::Done))) {
                    items.push(Ok(GenerationEvent::Done));
                }
                Ok(Box::pin(stream::iter(items)))
            }
            MockResponse::Failure { after, message } => {
                let mut items: Vec<Result<GenerationEvent>> =
                    after.into_iter().map(Ok).collect();
                items.push(Err(AppError::Generation { message }));
                Ok(Box::pin(stream::iter(items)))
            }
            MockResponse::Stall => Ok(Box::pin(stream::pending())),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Create a generation client based on configuration
pub fn create_generation_client(config: &GenerationConfig) -> Result<Arc<dyn GenerationClient>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiGenerationClient::new(config)?)),
        "mock" => Ok(Arc::new(MockGenerationClient::new())),
        other => {
            tracing::warn!(provider = other, "Unknown generation provider, using mock");
            Ok(Arc::new(MockGenerationClient::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_ok(events: Vec<Result<GenerationEvent>>) -> Vec<GenerationEvent> {
        events.into_iter().map(|e| e.unwrap()).collect()
    }

    #[test]
    fn test_decoder_handles_ragged_chunks() {
        let mut decoder = SseDecoder::default();
        let payload = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
            "data: [DONE]\n\n",
        );

        // Split mid-line to mimic arbitrary network framing.
        let (head, tail) = payload.split_at(37);
        let mut events = decoder.push(head.as_bytes());
        events.extend(decoder.push(tail.as_bytes()));

        assert_eq!(
            collect_ok(events),
            vec![
                GenerationEvent::Delta("Hel".to_string()),
                GenerationEvent::Delta("lo".to_string()),
                GenerationEvent::Done,
            ]
        );
    }

    #[test]
    fn test_decoder_assembles_tool_call_fragments() {
        let mut decoder = SseDecoder::default();
        let payload = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"name\":\"retrieve_content\",\"arguments\":\"\"}}]},\"finish_reason\":null}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"query\\\":\\\"inst\"}}]},\"finish_reason\":null}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"all steps\\\"}\"}}]},\"finish_reason\":null}]}\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n",
            "data: [DONE]\n",
        );

        let events = collect_ok(decoder.push(payload.as_bytes()));
        assert_eq!(
            events,
            vec![
                GenerationEvent::ToolCall(ToolCall::RetrieveContent {
                    query: "install steps".to_string()
                }),
                GenerationEvent::Done,
            ]
        );
    }

    #[test]
    fn test_decoder_skips_unknown_tool() {
        let mut decoder = SseDecoder::default();
        let payload = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"name\":\"delete_everything\",\"arguments\":\"{}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n",
            "data: [DONE]\n",
        );

        let events = collect_ok(decoder.push(payload.as_bytes()));
        assert_eq!(events, vec![GenerationEvent::Done]);
    }

    #[test]
    fn test_decoder_ignores_data_after_done() {
        let mut decoder = SseDecoder::default();
        let payload = concat!(
            "data: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"late\"},\"finish_reason\":null}]}\n",
        );

        let events = collect_ok(decoder.push(payload.as_bytes()));
        assert_eq!(events, vec![GenerationEvent::Done]);
    }

    #[tokio::test]
    async fn test_mock_appends_done_and_counts_calls() {
        let client = MockGenerationClient::with_text("two words");
        let stream = client
            .generate(GenerationRequest {
                system: String::new(),
                prompt: String::new(),
                max_tokens: 64,
                temperature: 0.0,
                allow_tools: false,
            })
            .await
            .unwrap();

        let events: Vec<_> = StreamExt::collect::<Vec<_>>(stream)
            .await
            .into_iter()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(events.last(), Some(&GenerationEvent::Done));
        assert_eq!(events.len(), 3);
        assert_eq!(client.call_count(), 1);
    }

    #[test]
    fn test_factory_requires_api_key() {
        let config = GenerationConfig {
            provider: "openai".into(),
            api_key: None,
            ..GenerationConfig::default()
        };
        assert!(create_generation_client(&config).is_err());
    }
}
