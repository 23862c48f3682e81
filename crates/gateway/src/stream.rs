//! Per-connection query lifecycle driver
//!
//! One [`ConnectionDriver`] per socket. It admits inbound messages,
//! runs each query in its own task, and owns the protocol guarantee:
//! every admitted query gets exactly one terminal event (`response_end`
//! or `error`), no matter how it ends.
//!
//! The split of responsibilities is deliberate. A query task emits only
//! non-terminal events; the driver joins the task and emits the
//! terminal afterwards. Aborting a task (cancel, supersede, disconnect)
//! therefore cannot leave a stream half-terminated, and a task that
//! panics still produces a clean `error` event.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use docpilot_common::config::AppConfig;
use docpilot_common::errors::{AppError, Result};
use docpilot_common::metrics::{record_query, record_rate_limited};
use docpilot_common::types::{QueryTurn, SourceRef};
use docpilot_conversation::{AnswerRequest, ConversationEngine, SessionStore};
use docpilot_retrieval::{RetrieveRequest, Retriever};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;
use validator::Validate;

use crate::middleware::rate_limit::RateGuard;
use crate::protocol::{ClientMessage, HighlightMessage, QueryMessage, QueryState, ServerEvent};

/// Retry hint sent when the per-connection queue is full
const QUEUE_FULL_RETRY_MS: u64 = 1_000;

/// Everything the query path needs, shared by every connection
pub struct QueryServices {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionStore>,
    pub retriever: Arc<dyn Retriever>,
    pub engine: Arc<ConversationEngine>,
}

/// What a finished query task hands back to the driver
pub struct QueryOutcome {
    sources: Vec<SourceRef>,
    has_relevant_content: bool,
    response_time_ms: u64,
}

pub type TaskResult = Result<QueryOutcome>;

/// Join result the socket loop feeds into [`ConnectionDriver::finish_in_flight`]
pub type JoinOutcome = std::result::Result<TaskResult, JoinError>;

/// An admitted query waiting to run (or running). The protocol state
/// travels with it so the `received` ack sent at admission stays part
/// of the same lifecycle once the query starts.
struct QueryJob {
    query_id: Uuid,
    session_id: Uuid,
    message: QueryMessage,
    state: Arc<Mutex<QueryState>>,
}

struct InFlight {
    query_id: Uuid,
    session_id: Uuid,
    state: Arc<Mutex<QueryState>>,
    handle: JoinHandle<TaskResult>,
    started: Instant,
}

/// Emits events for one query through the shared outbound channel,
/// refusing anything the state machine does not permit. The driver and
/// the query task hold the same state, so the terminal check and the
/// task's own emissions cannot race past each other.
#[derive(Clone)]
struct EventChannel {
    session_id: Uuid,
    query_id: Uuid,
    events: mpsc::Sender<ServerEvent>,
    state: Arc<Mutex<QueryState>>,
}

impl EventChannel {
    async fn emit(&self, event: ServerEvent) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if !state.permits(&event) {
                warn!(
                    query_id = %self.query_id,
                    event = event.event_name(),
                    state = ?*state,
                    "dropping protocol event the state machine does not permit"
                );
                return Ok(());
            }
            *state = state.apply(&event);
        }
        self.events.send(event).await.map_err(|_| AppError::Cancelled)
    }

    async fn retrieving(&self) -> Result<()> {
        self.emit(ServerEvent::retrieving(self.session_id, self.query_id))
            .await
    }

    async fn response_start(&self) -> Result<()> {
        self.emit(ServerEvent::response_start(self.session_id, self.query_id))
            .await
    }

    async fn chunk(&self, delta: String) -> Result<()> {
        self.emit(ServerEvent::response_chunk(
            self.session_id,
            self.query_id,
            delta,
        ))
        .await
    }
}

/// Drives one websocket connection's queries and highlights
pub struct ConnectionDriver {
    services: Arc<QueryServices>,
    events: mpsc::Sender<ServerEvent>,
    guard: RateGuard,
    in_flight: Option<InFlight>,
    pending: VecDeque<QueryJob>,
}

impl ConnectionDriver {
    pub fn new(
        services: Arc<QueryServices>,
        events: mpsc::Sender<ServerEvent>,
        guard: RateGuard,
    ) -> Self {
        Self {
            services,
            events,
            guard,
            in_flight: None,
            pending: VecDeque::new(),
        }
    }

    pub async fn on_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Query(query) => self.on_query(query).await,
            ClientMessage::Highlight(highlight) => self.on_highlight(highlight).await,
            ClientMessage::Cancel => self.on_cancel().await,
        }
    }

    /// Error event for a frame that could not be parsed at all. The
    /// connection stays open; only the frame is refused.
    pub async fn on_unparseable(&self, detail: String) {
        let error = AppError::InvalidFormat { message: detail };
        self.reject(Uuid::nil(), Uuid::new_v4(), &error).await;
    }

    /// Resolves when the in-flight query's task finishes; pends forever
    /// when nothing is running. Cancel-safe, so the socket loop can
    /// select on it next to the inbound read.
    pub async fn wait_in_flight(&mut self) -> JoinOutcome {
        match self.in_flight.as_mut() {
            Some(in_flight) => (&mut in_flight.handle).await,
            None => std::future::pending().await,
        }
    }

    /// Emit the terminal event for the joined query, then start the
    /// next queued one if any.
    pub async fn finish_in_flight(&mut self, joined: JoinOutcome) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        self.settle(in_flight, joined).await;
        self.next_pending().await;
    }

    /// Abort everything on disconnect. No events; the socket is gone.
    pub fn shutdown(&mut self) {
        self.pending.clear();
        if let Some(in_flight) = self.in_flight.take() {
            debug!(query_id = %in_flight.query_id, "aborting in-flight query on disconnect");
            in_flight.handle.abort();
        }
    }

    async fn on_query(&mut self, query: QueryMessage) {
        // Rejections happen before a session is resolved, so they carry
        // whatever session the client claimed (or nil).
        let fallback_session = query.session_id.unwrap_or_else(Uuid::nil);
        let query_id = Uuid::new_v4();

        if let Err(error) = validate_query(&query) {
            self.reject(fallback_session, query_id, &error).await;
            return;
        }

        if let Err(error) = self.guard.check_query() {
            self.reject(fallback_session, query_id, &error).await;
            return;
        }

        if self.in_flight.is_some() {
            match self.services.config.stream.overlap_policy.as_str() {
                "queue" => {
                    if self.pending.len() >= self.services.config.stream.queue_depth {
                        record_rate_limited("queue");
                        let error = AppError::RateLimited {
                            retry_after_ms: QUEUE_FULL_RETRY_MS,
                        };
                        self.reject(fallback_session, query_id, &error).await;
                        return;
                    }
                    let job = self.admit(query_id, query).await;
                    debug!(
                        query_id = %job.query_id,
                        depth = self.pending.len() + 1,
                        "queueing query behind the in-flight one"
                    );
                    self.pending.push_back(job);
                    return;
                }
                // "cancel": the newest query wins.
                _ => {
                    debug!("superseding the in-flight query");
                    self.cancel_in_flight().await;
                }
            }
        }

        let job = self.admit(query_id, query).await;
        self.start(job);
    }

    async fn on_highlight(&mut self, highlight: HighlightMessage) {
        if let Err(error) = validate_highlight(&highlight) {
            let session_id = highlight.session_id.unwrap_or_else(Uuid::nil);
            self.reject(session_id, Uuid::new_v4(), &error).await;
            return;
        }

        let chunk = self
            .services
            .sessions
            .add_highlight(highlight.session_id, highlight.text)
            .await;
        debug!(session_id = %chunk.session_id, highlight_id = %chunk.id, "highlight added");

        if self
            .events
            .send(ServerEvent::highlight_added(&chunk))
            .await
            .is_err()
        {
            debug!("client went away before the highlight ack was sent");
        }
    }

    /// Explicit cancellation: the in-flight query and every queued one
    /// get their `error` terminal with the cancellation code.
    async fn on_cancel(&mut self) {
        if self.in_flight.is_none() && self.pending.is_empty() {
            debug!("cancel received with nothing in flight");
            return;
        }

        let pending: Vec<QueryJob> = self.pending.drain(..).collect();
        for job in pending {
            let channel = self.channel(job.session_id, job.query_id, &job.state);
            channel
                .emit(ServerEvent::error(
                    job.session_id,
                    job.query_id,
                    &AppError::Cancelled,
                ))
                .await
                .ok();
        }

        self.cancel_in_flight().await;
    }

    /// Resolve the session and acknowledge the query. Queued queries
    /// are acknowledged at admission, not when they start.
    async fn admit(&mut self, query_id: Uuid, message: QueryMessage) -> QueryJob {
        let session = self.services.sessions.get_or_create(message.session_id).await;
        let job = QueryJob {
            query_id,
            session_id: session.session_id,
            message,
            state: Arc::new(Mutex::new(QueryState::Pending)),
        };
        let channel = self.channel(job.session_id, job.query_id, &job.state);
        channel
            .emit(ServerEvent::received(job.session_id, job.query_id))
            .await
            .ok();
        job
    }

    /// Spawn the query task under the watchdog timeout.
    fn start(&mut self, job: QueryJob) {
        let services = self.services.clone();
        let channel = self.channel(job.session_id, job.query_id, &job.state);
        let timeout = services.config.query_timeout();
        let timeout_secs = services.config.stream.query_timeout_secs;
        let message = job.message;

        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, run_query(services, channel, message)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::QueryTimeout { timeout_secs }),
            }
        });

        self.in_flight = Some(InFlight {
            query_id: job.query_id,
            session_id: job.session_id,
            state: job.state,
            handle,
            started: Instant::now(),
        });
    }

    /// Abort the in-flight query and emit its terminal right away.
    async fn cancel_in_flight(&mut self) {
        let Some(mut in_flight) = self.in_flight.take() else {
            return;
        };
        in_flight.handle.abort();
        let joined = (&mut in_flight.handle).await;
        self.settle(in_flight, joined).await;
    }

    async fn next_pending(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(job) = self.pending.pop_front() else {
            return;
        };
        debug!(query_id = %job.query_id, "starting queued query");
        self.start(job);
    }

    /// The single place a terminal event is produced.
    async fn settle(&mut self, in_flight: InFlight, joined: JoinOutcome) {
        let elapsed = in_flight.started.elapsed().as_secs_f64();
        let channel = self.channel(in_flight.session_id, in_flight.query_id, &in_flight.state);

        let (event, outcome) = match joined {
            Ok(Ok(done)) => {
                let outcome = if done.has_relevant_content {
                    "completed"
                } else {
                    "fallback"
                };
                (
                    ServerEvent::response_end(
                        in_flight.session_id,
                        in_flight.query_id,
                        done.sources,
                        done.has_relevant_content,
                        done.response_time_ms,
                    ),
                    outcome,
                )
            }
            Ok(Err(error)) => {
                let outcome = match &error {
                    AppError::Cancelled => "cancelled",
                    AppError::QueryTimeout { .. } => "timeout",
                    _ => "error",
                };
                if outcome == "error" {
                    warn!(query_id = %in_flight.query_id, error = %error, "query failed");
                } else {
                    debug!(query_id = %in_flight.query_id, outcome, "query stopped");
                }
                (
                    ServerEvent::error(in_flight.session_id, in_flight.query_id, &error),
                    outcome,
                )
            }
            Err(join_error) => {
                let error = if join_error.is_cancelled() {
                    AppError::Cancelled
                } else {
                    warn!(query_id = %in_flight.query_id, "query task panicked");
                    AppError::Internal {
                        message: "query processing failed".to_string(),
                    }
                };
                let outcome = if matches!(error, AppError::Cancelled) {
                    "cancelled"
                } else {
                    "error"
                };
                (
                    ServerEvent::error(in_flight.session_id, in_flight.query_id, &error),
                    outcome,
                )
            }
        };

        record_query(elapsed, outcome);
        channel.emit(event).await.ok();
    }

    /// Error event for a query refused before admission; these have no
    /// state machine of their own.
    async fn reject(&self, session_id: Uuid, query_id: Uuid, error: &AppError) {
        debug!(%query_id, code = ?error.code(), "rejecting query");
        let event = ServerEvent::error(session_id, query_id, error);
        if self.events.send(event).await.is_err() {
            debug!("client went away before the rejection was sent");
        }
    }

    fn channel(
        &self,
        session_id: Uuid,
        query_id: Uuid,
        state: &Arc<Mutex<QueryState>>,
    ) -> EventChannel {
        EventChannel {
            session_id,
            query_id,
            events: self.events.clone(),
            state: state.clone(),
        }
    }
}

/// The spawned body of one query: retrieval, generation, history.
/// Emits every non-terminal event; the terminal belongs to the driver.
async fn run_query(
    services: Arc<QueryServices>,
    channel: EventChannel,
    message: QueryMessage,
) -> TaskResult {
    let started = Instant::now();
    let session_id = channel.session_id;

    channel.retrieving().await?;

    let highlights = services.sessions.live_highlights(session_id).await;
    let request = RetrieveRequest {
        query: message.message.clone(),
        highlights,
        top_k: services.config.retrieval.top_k,
        min_score: services.config.retrieval.min_score,
        max_items: services.config.retrieval.max_items,
    };
    let retrieval = services.retriever.retrieve(&request).await?;

    channel.response_start().await?;

    let history = services.sessions.history(session_id).await;
    let capacity = services.config.stream.channel_capacity.max(1);
    let (delta_tx, mut delta_rx) = mpsc::channel(capacity);

    let answer_request = AnswerRequest {
        query: message.message.clone(),
        retrieval,
        history,
        require_sources: message.require_sources,
        params: message.params,
    };
    let answer = services.engine.answer(answer_request, delta_tx);
    tokio::pin!(answer);

    let mut deltas_done = false;
    let answer = loop {
        tokio::select! {
            delta = delta_rx.recv(), if !deltas_done => {
                match delta {
                    Some(delta) => channel.chunk(delta).await?,
                    None => deltas_done = true,
                }
            }
            result = answer.as_mut() => {
                // Forward fragments still buffered in the channel.
                while let Ok(delta) = delta_rx.try_recv() {
                    channel.chunk(delta).await?;
                }
                break result?;
            }
        }
    };

    let response_time_ms = started.elapsed().as_millis() as u64;
    let turn = QueryTurn {
        query_text: message.message,
        require_sources: message.require_sources,
        resolved_session_id: session_id,
        retrieved_items: answer.sources.clone(),
        response_text: answer.response_text,
        response_time_ms,
        has_relevant_content: answer.has_relevant_content,
    };
    services.sessions.record_turn(&turn).await;

    Ok(QueryOutcome {
        sources: answer.sources,
        has_relevant_content: answer.has_relevant_content,
        response_time_ms,
    })
}

fn validate_query(query: &QueryMessage) -> Result<()> {
    query.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;
    if query.message.trim().is_empty() {
        return Err(AppError::Validation {
            message: "message must not be blank".to_string(),
            field: Some("message".to_string()),
        });
    }
    Ok(())
}

fn validate_highlight(highlight: &HighlightMessage) -> Result<()> {
    highlight.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;
    if highlight.text.trim().is_empty() {
        return Err(AppError::Validation {
            message: "highlight text must not be blank".to_string(),
            field: Some("text".to_string()),
        });
    }
    Ok(())
}
