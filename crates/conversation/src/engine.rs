//! Conversation answer engine
//!
//! Turns a query plus its retrieved context into a streamed answer:
//! - builds a bounded prompt from numbered source excerpts and recent
//!   history
//! - streams model deltas into a channel the transport forwards
//! - dispatches at most one `retrieve_content` tool round
//! - extracts `[n]` citations into the sources actually used
//!
//! Empty retrieval never reaches the model; the engine answers with a
//! fixed no-content message instead. A model failure degrades to an
//! apology that still carries the retrieved sources.

use crate::generation::{
    GenerationClient, GenerationEvent, GenerationRequest, GenerationStream, ToolCall,
};
use docpilot_common::config::GenerationConfig;
use docpilot_common::errors::{AppError, Result};
use docpilot_common::metrics::record_generation;
use docpilot_common::types::{
    GenerationParams, HistoryTurn, QueryAnswer, RetrievedItem, Retrieval, Role, SourceRef,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Sent verbatim when retrieval finds nothing relevant. The model is
/// never called on that path.
pub const NO_CONTENT_FALLBACK: &str = "I couldn't find anything in the documentation that covers \
     this. Try rephrasing your question, or ask about a topic the docs cover.";

/// Appended when the model fails mid-answer; retrieved sources still
/// accompany the response.
pub const GENERATION_FALLBACK: &str = "I wasn't able to finish composing an answer just now. The \
     sources listed with this response should still point you in the right direction; please try \
     again in a moment.";

/// History entries longer than this are truncated in the prompt window
const HISTORY_SNIPPET_CHARS: usize = 1_500;

/// Executes tool calls the model requests during generation
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Search the documentation for additional passages
    async fn retrieve_content(&self, query: &str) -> Result<Vec<RetrievedItem>>;
}

/// Everything the engine needs to answer one query
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub query: String,
    pub retrieval: Retrieval,
    pub history: Vec<HistoryTurn>,
    pub require_sources: bool,
    pub params: GenerationParams,
}

/// Retrieval-grounded answer generator
pub struct ConversationEngine {
    client: Arc<dyn GenerationClient>,
    tools: Option<Arc<dyn ToolExecutor>>,
    config: GenerationConfig,
}

impl ConversationEngine {
    pub fn new(client: Arc<dyn GenerationClient>, config: GenerationConfig) -> Self {
        Self {
            client,
            tools: None,
            config,
        }
    }

    /// Enable the retrieval tool, dispatched through `tools`
    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Answer one query, streaming text fragments into `deltas` as they
    /// arrive. The returned answer's `response_text` is exactly the
    /// concatenation of the streamed fragments.
    ///
    /// Fails only when the delta receiver is gone (the query was
    /// cancelled); model failures degrade to a fallback answer instead.
    pub async fn answer(
        &self,
        request: AnswerRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<QueryAnswer> {
        if request.retrieval.items.is_empty() {
            deltas
                .send(NO_CONTENT_FALLBACK.to_string())
                .await
                .map_err(|_| AppError::Cancelled)?;
            return Ok(QueryAnswer {
                response_text: NO_CONTENT_FALLBACK.to_string(),
                sources: Vec::new(),
                has_relevant_content: false,
            });
        }

        let params = request.params.clamped();
        // Clients may lower the server's response budget, never raise it.
        let max_tokens = params
            .max_tokens
            .unwrap_or(self.config.max_tokens)
            .min(self.config.max_tokens);
        let temperature = params.temperature.unwrap_or(self.config.temperature);

        let mut items = request.retrieval.items.clone();
        let mut text = String::new();
        let started = Instant::now();
        let outcome = self
            .run_generation(&request, &mut items, max_tokens, temperature, &deltas, &mut text)
            .await;
        record_generation(
            started.elapsed().as_secs_f64(),
            self.client.model_name(),
            outcome.is_ok(),
        );

        match outcome {
            Ok(()) => {
                let sources = self.extract_citations(&text, &items);
                Ok(QueryAnswer {
                    response_text: text,
                    sources,
                    has_relevant_content: true,
                })
            }
            Err(AppError::Cancelled) => Err(AppError::Cancelled),
            Err(e) => {
                warn!(error = %e, "generation failed, degrading to fallback answer");
                let suffix = if text.is_empty() {
                    GENERATION_FALLBACK.to_string()
                } else {
                    format!("\n\n{}", GENERATION_FALLBACK)
                };
                deltas
                    .send(suffix.clone())
                    .await
                    .map_err(|_| AppError::Cancelled)?;
                text.push_str(&suffix);
                let sources = items.iter().map(|i| i.source_ref()).collect();
                Ok(QueryAnswer {
                    response_text: text,
                    sources,
                    has_relevant_content: true,
                })
            }
        }
    }

    async fn run_generation(
        &self,
        request: &AnswerRequest,
        items: &mut Vec<RetrievedItem>,
        max_tokens: u32,
        temperature: f32,
        deltas: &mpsc::Sender<String>,
        text: &mut String,
    ) -> Result<()> {
        let first = GenerationRequest {
            system: self.system_prompt(request.require_sources),
            prompt: build_prompt(
                &request.query,
                items,
                &request.history,
                self.config.history_window,
            ),
            max_tokens,
            temperature,
            allow_tools: self.tools.is_some(),
        };
        let tool_call = drain_stream(self.client.generate(first).await?, deltas, text).await?;

        let Some(ToolCall::RetrieveContent { query }) = tool_call else {
            return Ok(());
        };
        let Some(tools) = self.tools.as_ref() else {
            return Ok(());
        };

        debug!(%query, "model requested additional retrieval");
        match tools.retrieve_content(&query).await {
            Ok(extra) => merge_items(items, extra),
            Err(e) => warn!(error = %e, "tool retrieval failed, continuing with original sources"),
        }

        // One tool round only; the follow-up cannot request another.
        let followup = GenerationRequest {
            system: self.system_prompt(request.require_sources),
            prompt: build_prompt(
                &request.query,
                items,
                &request.history,
                self.config.history_window,
            ),
            max_tokens,
            temperature,
            allow_tools: false,
        };
        drain_stream(self.client.generate(followup).await?, deltas, text).await?;
        Ok(())
    }

    fn system_prompt(&self, require_sources: bool) -> String {
        let mut prompt = String::from(
            "You are the assistant for this documentation site. Answer the question based ONLY \
             on the provided source excerpts. If the excerpts do not contain enough information, \
             say so plainly. Do not make up information.",
        );
        if require_sources {
            prompt.push_str(
                " Cite the excerpts you used inline in the format [1], [2], etc. Only cite \
                 excerpts that were provided.",
            );
        }
        prompt
    }

    /// Map `[n]` markers back to the excerpts they reference. A response
    /// with no markers keeps every supplied excerpt as provenance.
    fn extract_citations(&self, response: &str, items: &[RetrievedItem]) -> Vec<SourceRef> {
        let citation_pattern = regex_lite::Regex::new(r"\[(\d+)\]").unwrap();

        let mut cited_indices = Vec::new();
        for cap in citation_pattern.captures_iter(response) {
            if let Some(num) = cap.get(1) {
                if let Ok(idx) = num.as_str().parse::<usize>() {
                    if idx > 0 && idx <= items.len() && !cited_indices.contains(&idx) {
                        cited_indices.push(idx);
                    }
                }
            }
        }
        cited_indices.sort_unstable();

        let refs: Vec<SourceRef> = if cited_indices.is_empty() {
            items.iter().map(|i| i.source_ref()).collect()
        } else {
            cited_indices
                .iter()
                .map(|&idx| items[idx - 1].source_ref())
                .collect()
        };

        let mut sources: Vec<SourceRef> = Vec::new();
        for r in refs {
            let seen = sources
                .iter()
                .any(|s| s.source_path == r.source_path && s.heading_path == r.heading_path);
            if !seen {
                sources.push(r);
            }
        }
        sources
    }
}

/// Forward one stream into `text`/`deltas`, capturing the first tool
/// call. A closed delta receiver means the query was cancelled.
async fn drain_stream(
    mut stream: GenerationStream,
    deltas: &mpsc::Sender<String>,
    text: &mut String,
) -> Result<Option<ToolCall>> {
    let mut tool_call = None;
    while let Some(event) = stream.next().await {
        match event? {
            GenerationEvent::Delta(delta) => {
                text.push_str(&delta);
                deltas.send(delta).await.map_err(|_| AppError::Cancelled)?;
            }
            GenerationEvent::ToolCall(call) => {
                if tool_call.is_none() {
                    tool_call = Some(call);
                } else {
                    debug!("ignoring extra tool call in the same stream");
                }
            }
            GenerationEvent::Done => break,
        }
    }
    Ok(tool_call)
}

/// Append tool-retrieved items, skipping chunks already in context
fn merge_items(items: &mut Vec<RetrievedItem>, extra: Vec<RetrievedItem>) {
    for item in extra {
        if !items.iter().any(|existing| existing.chunk_id == item.chunk_id) {
            items.push(item);
        }
    }
}

/// Assemble the user prompt: numbered source excerpts, a bounded window
/// of recent history, then the question.
fn build_prompt(
    query: &str,
    items: &[RetrievedItem],
    history: &[HistoryTurn],
    history_window: usize,
) -> String {
    let mut prompt = String::from("Source excerpts from the documentation:\n");
    for (i, item) in items.iter().enumerate() {
        let heading = if item.heading_path.is_empty() {
            String::new()
        } else {
            format!(" — {}", item.heading_path.join(" > "))
        };
        prompt.push_str(&format!(
            "\n[{}] {}{}\n{}\n",
            i + 1,
            item.source_path,
            heading,
            item.text
        ));
    }

    let window = &history[history.len().saturating_sub(history_window)..];
    if !window.is_empty() {
        prompt.push_str("\nRecent conversation:\n");
        for turn in window {
            let speaker = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            prompt.push_str(&format!(
                "{}: {}\n",
                speaker,
                truncate_chars(&turn.content, HISTORY_SNIPPET_CHARS)
            ));
        }
    }

    prompt.push_str(&format!("\nQuestion: {}\n\nAnswer:", query));
    prompt
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{MockGenerationClient, MockResponse};
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn item(n: usize, path: &str) -> RetrievedItem {
        RetrievedItem {
            chunk_id: Uuid::from_u128(n as u128),
            text: format!("Excerpt number {n} about installing."),
            source_path: path.to_string(),
            heading_path: vec!["Guide".to_string(), format!("Section {n}")],
            relevance_score: 0.8,
        }
    }

    fn request_with(items: Vec<RetrievedItem>) -> AnswerRequest {
        AnswerRequest {
            query: "how do I install?".to_string(),
            retrieval: Retrieval {
                has_relevant_content: !items.is_empty(),
                items,
            },
            history: Vec::new(),
            require_sources: true,
            params: GenerationParams::default(),
        }
    }

    async fn run(
        engine: &ConversationEngine,
        request: AnswerRequest,
    ) -> (QueryAnswer, Vec<String>) {
        let (tx, mut rx) = mpsc::channel(64);
        let answer = engine.answer(request, tx).await.unwrap();
        let mut deltas = Vec::new();
        while let Ok(delta) = rx.try_recv() {
            deltas.push(delta);
        }
        (answer, deltas)
    }

    struct StubTools {
        queries: Mutex<Vec<String>>,
        result: Vec<RetrievedItem>,
    }

    #[async_trait]
    impl ToolExecutor for StubTools {
        async fn retrieve_content(&self, query: &str) -> Result<Vec<RetrievedItem>> {
            self.queries.lock().unwrap().push(query.to_string());
            Ok(self.result.clone())
        }
    }

    #[tokio::test]
    async fn test_empty_retrieval_skips_model_entirely() {
        let client = Arc::new(MockGenerationClient::new());
        let engine = ConversationEngine::new(client.clone(), GenerationConfig::default());

        let (answer, deltas) = run(&engine, request_with(Vec::new())).await;
        assert_eq!(answer.response_text, NO_CONTENT_FALLBACK);
        assert!(!answer.has_relevant_content);
        assert!(answer.sources.is_empty());
        assert_eq!(deltas.join(""), NO_CONTENT_FALLBACK);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_streams_deltas_and_extracts_citations() {
        let client = Arc::new(MockGenerationClient::with_text(
            "Run the installer first. [2]",
        ));
        let engine = ConversationEngine::new(client.clone(), GenerationConfig::default());

        let items = vec![item(1, "guides/setup.md"), item(2, "guides/install.md")];
        let (answer, deltas) = run(&engine, request_with(items)).await;

        assert_eq!(answer.response_text, "Run the installer first. [2]");
        assert_eq!(deltas.join(""), answer.response_text);
        assert!(answer.has_relevant_content);
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].source_path, "guides/install.md");
    }

    #[tokio::test]
    async fn test_uncited_response_keeps_all_sources() {
        let client = Arc::new(MockGenerationClient::with_text("Just run make install."));
        let engine = ConversationEngine::new(client, GenerationConfig::default());

        let items = vec![item(1, "a.md"), item(2, "b.md")];
        let (answer, _) = run(&engine, request_with(items)).await;
        assert_eq!(answer.sources.len(), 2);
    }

    #[tokio::test]
    async fn test_generation_failure_degrades_with_sources() {
        let client = Arc::new(MockGenerationClient::with_script(vec![
            MockResponse::Failure {
                after: vec![GenerationEvent::Delta("Partial ".to_string())],
                message: "upstream 500".to_string(),
            },
        ]));
        let engine = ConversationEngine::new(client, GenerationConfig::default());

        let (answer, deltas) = run(&engine, request_with(vec![item(1, "a.md")])).await;
        assert!(answer.response_text.starts_with("Partial "));
        assert!(answer.response_text.contains(GENERATION_FALLBACK));
        assert_eq!(deltas.join(""), answer.response_text);
        assert!(answer.has_relevant_content);
        assert_eq!(answer.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_single_tool_round_merges_sources() {
        let client = Arc::new(MockGenerationClient::with_script(vec![
            MockResponse::Events(vec![GenerationEvent::ToolCall(ToolCall::RetrieveContent {
                query: "installer flags".to_string(),
            })]),
            MockResponse::Events(vec![GenerationEvent::Delta(
                "Pass --prefix as shown. [3]".to_string(),
            )]),
        ]));
        let tools = Arc::new(StubTools {
            queries: Mutex::new(Vec::new()),
            result: vec![item(3, "reference/flags.md")],
        });
        let engine = ConversationEngine::new(client.clone(), GenerationConfig::default())
            .with_tools(tools.clone());

        let items = vec![item(1, "a.md"), item(2, "b.md")];
        let (answer, _) = run(&engine, request_with(items)).await;

        assert_eq!(client.call_count(), 2);
        assert_eq!(*tools.queries.lock().unwrap(), vec!["installer flags"]);
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].source_path, "reference/flags.md");
        let followup = client.last_request().unwrap();
        assert!(!followup.allow_tools);
        assert!(followup.prompt.contains("[3] reference/flags.md"));
    }

    #[tokio::test]
    async fn test_tool_call_without_executor_is_inert() {
        let client = Arc::new(MockGenerationClient::with_script(vec![
            MockResponse::Events(vec![GenerationEvent::ToolCall(ToolCall::RetrieveContent {
                query: "anything".to_string(),
            })]),
        ]));
        let engine = ConversationEngine::new(client.clone(), GenerationConfig::default());

        let (answer, _) = run(&engine, request_with(vec![item(1, "a.md")])).await;
        assert_eq!(client.call_count(), 1);
        assert_eq!(answer.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_prompt_carries_sources_history_and_instructions() {
        let client = Arc::new(MockGenerationClient::new());
        let engine = ConversationEngine::new(
            client.clone(),
            GenerationConfig {
                history_window: 2,
                ..GenerationConfig::default()
            },
        );

        let mut request = request_with(vec![item(1, "guides/install.md")]);
        request.history = vec![
            HistoryTurn {
                role: Role::User,
                content: "older question".to_string(),
                timestamp: Utc::now(),
                sources: Vec::new(),
            },
            HistoryTurn {
                role: Role::User,
                content: "what is docpilot?".to_string(),
                timestamp: Utc::now(),
                sources: Vec::new(),
            },
            HistoryTurn {
                role: Role::Assistant,
                content: "A docs assistant.".to_string(),
                timestamp: Utc::now(),
                sources: Vec::new(),
            },
        ];
        let _ = run(&engine, request).await;

        let sent = client.last_request().unwrap();
        assert!(sent.prompt.contains("[1] guides/install.md — Guide > Section 1"));
        assert!(sent.prompt.contains("user: what is docpilot?"));
        assert!(sent.prompt.contains("assistant: A docs assistant."));
        // Window of 2 drops the oldest entry.
        assert!(!sent.prompt.contains("older question"));
        assert!(sent.prompt.ends_with("Answer:"));
        assert!(sent.system.contains("[1], [2]"));
    }

    #[tokio::test]
    async fn test_client_may_lower_but_not_raise_token_budget() {
        let client = Arc::new(MockGenerationClient::new());
        let engine = ConversationEngine::new(client.clone(), GenerationConfig::default());

        let mut request = request_with(vec![item(1, "a.md")]);
        request.params = GenerationParams {
            max_tokens: Some(9999),
            temperature: Some(5.0),
        };
        let _ = run(&engine, request).await;

        let sent = client.last_request().unwrap();
        assert_eq!(sent.max_tokens, GenerationConfig::default().max_tokens);
        assert!((sent.temperature - GenerationParams::TEMPERATURE_RANGE.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
