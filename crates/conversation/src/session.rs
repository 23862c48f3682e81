//! In-memory chat session store
//!
//! Sessions live in a fixed array of shards, each an `RwLock<HashMap>`,
//! so concurrent connections rarely contend on the same lock. Expiry is
//! lazy (checked on access) plus a background sweeper that reclaims
//! memory for sessions nobody touches again.
//!
//! Losing this state on restart is acceptable; conversations degrade to
//! first-contact behavior and nothing else breaks.

use chrono::{DateTime, Duration, Utc};
use docpilot_common::config::SessionConfig;
use docpilot_common::metrics::record_sessions;
use docpilot_common::types::{ContextChunk, HistoryTurn, QueryTurn, Role, MAX_HIGHLIGHTS};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;

/// One conversation: bounded history plus pinned highlights.
///
/// History holds individual entries (a completed exchange contributes a
/// user entry and an assistant entry), oldest evicted first once the cap
/// is reached.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub history: VecDeque<HistoryTurn>,
    pub highlights: VecDeque<ContextChunk>,
}

impl ChatSession {
    fn new(session_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            created_at: now,
            last_activity_at: now,
            history: VecDeque::new(),
            highlights: VecDeque::new(),
        }
    }

    /// A session is active until it has been idle for the full TTL.
    pub fn is_active(&self, now: DateTime<Utc>, idle_ttl: Duration) -> bool {
        now.signed_duration_since(self.last_activity_at) < idle_ttl
    }
}

/// Result of resolving a session id supplied by the client
#[derive(Debug, Clone, Copy)]
pub struct SessionSnapshot {
    pub session_id: Uuid,

    /// True when the store had no live session under this id and made a
    /// fresh one (covers both unknown and expired ids)
    pub created: bool,
}

/// What one sweep reclaimed
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub expired_sessions: usize,
    pub expired_highlights: usize,
    pub live_sessions: usize,
}

/// Sharded session store.
///
/// All mutation goes through a shard's write lock, which serializes
/// concurrent appends to the same session.
pub struct SessionStore {
    shards: Vec<RwLock<HashMap<Uuid, ChatSession>>>,
    history_cap: usize,
    idle_ttl: Duration,
    highlight_ttl: Duration,
    sweep_interval: std::time::Duration,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        let shard_count = config.shards.max(1);
        Self {
            shards: (0..shard_count)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            history_cap: config.history_cap.max(2),
            idle_ttl: Duration::seconds(config.idle_ttl_secs as i64),
            highlight_ttl: Duration::seconds(config.highlight_ttl_secs as i64),
            sweep_interval: std::time::Duration::from_secs(config.sweep_interval_secs.max(1)),
        }
    }

    fn shard_for(&self, session_id: &Uuid) -> &RwLock<HashMap<Uuid, ChatSession>> {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Resolve a client-supplied session id to a live session.
    ///
    /// Absent, unknown, and expired ids all get a fresh session; a
    /// supplied id is kept as the new session's id so the client's
    /// reference stays valid across expiry.
    pub async fn get_or_create(&self, requested: Option<Uuid>) -> SessionSnapshot {
        let now = Utc::now();
        let session_id = requested.unwrap_or_else(Uuid::new_v4);
        let mut sessions = self.shard_for(&session_id).write().await;

        match sessions.get_mut(&session_id) {
            Some(session) if session.is_active(now, self.idle_ttl) => {
                session.last_activity_at = now;
                SessionSnapshot {
                    session_id,
                    created: false,
                }
            }
            stale => {
                if stale.is_some() {
                    debug!(%session_id, "replacing expired session");
                }
                sessions.insert(session_id, ChatSession::new(session_id, now));
                SessionSnapshot {
                    session_id,
                    created: true,
                }
            }
        }
    }

    /// History snapshot for the prompt window. Missing or expired
    /// sessions read as empty.
    pub async fn history(&self, session_id: Uuid) -> Vec<HistoryTurn> {
        let now = Utc::now();
        let sessions = self.shard_for(&session_id).read().await;
        match sessions.get(&session_id) {
            Some(session) if session.is_active(now, self.idle_ttl) => {
                session.history.iter().cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Append a completed exchange: one user entry, one assistant entry,
    /// then evict oldest entries beyond the cap.
    pub async fn record_turn(&self, turn: &QueryTurn) {
        let now = Utc::now();
        let session_id = turn.resolved_session_id;
        let mut sessions = self.shard_for(&session_id).write().await;

        let idle_ttl = self.idle_ttl;
        let session = sessions
            .entry(session_id)
            .and_modify(|s| {
                if !s.is_active(now, idle_ttl) {
                    *s = ChatSession::new(session_id, now);
                }
            })
            .or_insert_with(|| ChatSession::new(session_id, now));
        session.last_activity_at = now;
        session.history.push_back(HistoryTurn {
            role: Role::User,
            content: turn.query_text.clone(),
            timestamp: now,
            sources: Vec::new(),
        });
        session.history.push_back(HistoryTurn {
            role: Role::Assistant,
            content: turn.response_text.clone(),
            timestamp: now,
            sources: turn.retrieved_items.clone(),
        });
        while session.history.len() > self.history_cap {
            session.history.pop_front();
        }
    }

    /// Pin a highlight, creating the session if needed. At most
    /// [`MAX_HIGHLIGHTS`] live per session; the oldest is evicted to make
    /// room.
    pub async fn add_highlight(&self, requested: Option<Uuid>, text: String) -> ContextChunk {
        let now = Utc::now();
        let session_id = requested.unwrap_or_else(Uuid::new_v4);
        let mut sessions = self.shard_for(&session_id).write().await;

        let idle_ttl = self.idle_ttl;
        let session = sessions
            .entry(session_id)
            .and_modify(|s| {
                if !s.is_active(now, idle_ttl) {
                    *s = ChatSession::new(session_id, now);
                }
            })
            .or_insert_with(|| ChatSession::new(session_id, now));
        session.last_activity_at = now;

        let highlight = ContextChunk {
            id: Uuid::new_v4(),
            session_id,
            text,
            created_at: now,
            expires_at: now + self.highlight_ttl,
        };
        session.highlights.push_back(highlight.clone());
        while session.highlights.len() > MAX_HIGHLIGHTS {
            session.highlights.pop_front();
        }
        highlight
    }

    /// Highlights that are still within their TTL, pruning dead ones in
    /// passing. Order is insertion order (oldest first).
    pub async fn live_highlights(&self, session_id: Uuid) -> Vec<ContextChunk> {
        let now = Utc::now();
        let mut sessions = self.shard_for(&session_id).write().await;
        match sessions.get_mut(&session_id) {
            Some(session) if session.is_active(now, self.idle_ttl) => {
                session.highlights.retain(|h| !h.is_expired(now));
                session.highlights.iter().cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Remove expired sessions and expired highlights across all shards.
    pub async fn sweep_expired(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for shard in &self.shards {
            let mut sessions = shard.write().await;
            sessions.retain(|_, session| {
                let keep = session.is_active(now, self.idle_ttl);
                if !keep {
                    report.expired_sessions += 1;
                }
                keep
            });
            for session in sessions.values_mut() {
                let before = session.highlights.len();
                session.highlights.retain(|h| !h.is_expired(now));
                report.expired_highlights += before - session.highlights.len();
            }
            report.live_sessions += sessions.len();
        }
        report
    }

    pub async fn live_sessions(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }

    /// Periodic sweep loop. Runs until the handle is aborted (process
    /// shutdown).
    pub fn spawn_sweeper(store: Arc<SessionStore>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = store.sweep_expired().await;
                if report.expired_sessions > 0 || report.expired_highlights > 0 {
                    debug!(
                        expired_sessions = report.expired_sessions,
                        expired_highlights = report.expired_highlights,
                        live_sessions = report.live_sessions,
                        "session sweep"
                    );
                }
                record_sessions(report.live_sessions, report.expired_sessions);
            }
        })
    }

    /// Rewind a session's activity clock and highlight deadlines, so
    /// tests can cross TTL boundaries without sleeping.
    #[cfg(test)]
    pub async fn backdate(&self, session_id: Uuid, by: Duration) {
        let mut sessions = self.shard_for(&session_id).write().await;
        if let Some(session) = sessions.get_mut(&session_id) {
            session.last_activity_at -= by;
            for highlight in session.highlights.iter_mut() {
                highlight.expires_at -= by;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpilot_common::types::SourceRef;

    fn test_config() -> SessionConfig {
        SessionConfig {
            history_cap: 4,
            idle_ttl_secs: 1800,
            highlight_ttl_secs: 900,
            shards: 4,
            sweep_interval_secs: 60,
        }
    }

    fn turn(session_id: Uuid, query: &str, response: &str) -> QueryTurn {
        QueryTurn {
            query_text: query.to_string(),
            require_sources: true,
            resolved_session_id: session_id,
            retrieved_items: vec![SourceRef {
                source_path: "guides/install.md".to_string(),
                heading_path: vec!["Install".to_string()],
                relevance_score: 0.9,
            }],
            response_text: response.to_string(),
            response_time_ms: 40,
            has_relevant_content: true,
        }
    }

    #[tokio::test]
    async fn test_absent_id_creates_fresh_session() {
        let store = SessionStore::new(&test_config());
        let snapshot = store.get_or_create(None).await;
        assert!(snapshot.created);
        assert_eq!(store.live_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_id_is_adopted() {
        let store = SessionStore::new(&test_config());
        let requested = Uuid::new_v4();
        let snapshot = store.get_or_create(Some(requested)).await;
        assert!(snapshot.created);
        assert_eq!(snapshot.session_id, requested);

        let again = store.get_or_create(Some(requested)).await;
        assert!(!again.created);
        assert_eq!(store.live_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_expired_id_yields_fresh_state_under_same_id() {
        let store = SessionStore::new(&test_config());
        let snapshot = store.get_or_create(None).await;
        let id = snapshot.session_id;
        store.record_turn(&turn(id, "how do I install?", "Run the installer. [1]")).await;
        assert_eq!(store.history(id).await.len(), 2);

        store.backdate(id, Duration::seconds(3600)).await;

        let revived = store.get_or_create(Some(id)).await;
        assert!(revived.created);
        assert_eq!(revived.session_id, id);
        assert!(store.history(id).await.is_empty());
    }

    #[tokio::test]
    async fn test_history_cap_evicts_oldest_entries() {
        let store = SessionStore::new(&test_config());
        let id = store.get_or_create(None).await.session_id;

        store.record_turn(&turn(id, "q1", "a1")).await;
        store.record_turn(&turn(id, "q2", "a2")).await;
        store.record_turn(&turn(id, "q3", "a3")).await;

        // cap 4 keeps the two most recent exchanges
        let history = store.history(id).await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "q2");
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[3].content, "a3");
        assert_eq!(history[3].role, Role::Assistant);
        assert!(!history[3].sources.is_empty());
    }

    #[tokio::test]
    async fn test_highlight_cap_evicts_oldest() {
        let store = SessionStore::new(&test_config());
        let id = store.get_or_create(None).await.session_id;

        for i in 0..MAX_HIGHLIGHTS + 1 {
            store.add_highlight(Some(id), format!("highlight {i}")).await;
        }

        let live = store.live_highlights(id).await;
        assert_eq!(live.len(), MAX_HIGHLIGHTS);
        assert_eq!(live[0].text, "highlight 1");
    }

    #[tokio::test]
    async fn test_highlights_expire_independently_of_session() {
        let store = SessionStore::new(&test_config());
        let id = store.get_or_create(None).await.session_id;
        store.add_highlight(Some(id), "pin me".to_string()).await;

        // Past the highlight TTL but well inside the session TTL.
        store.backdate(id, Duration::seconds(901)).await;
        store.get_or_create(Some(id)).await;

        assert!(store.live_highlights(id).await.is_empty());
        assert_eq!(store.live_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_highlight_before_first_query_creates_session() {
        let store = SessionStore::new(&test_config());
        let highlight = store.add_highlight(None, "setup steps".to_string()).await;
        assert_eq!(store.live_sessions().await, 1);
        assert_eq!(
            store.live_highlights(highlight.session_id).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_sessions() {
        let store = SessionStore::new(&test_config());
        let keep = store.get_or_create(None).await.session_id;
        let drop = store.get_or_create(None).await.session_id;
        store.backdate(drop, Duration::seconds(3600)).await;

        let report = store.sweep_expired().await;
        assert_eq!(report.expired_sessions, 1);
        assert_eq!(report.live_sessions, 1);
        assert!(store.history(drop).await.is_empty());
        assert!(!store.get_or_create(Some(keep)).await.created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_reclaims() {
        let store = Arc::new(SessionStore::new(&test_config()));
        let id = store.get_or_create(None).await.session_id;
        store.backdate(id, Duration::seconds(3600)).await;

        let sweeper = SessionStore::spawn_sweeper(store.clone());
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;

        assert_eq!(store.live_sessions().await, 0);
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_concurrent_appends_serialize() {
        let store = Arc::new(SessionStore::new(&SessionConfig {
            history_cap: 64,
            ..test_config()
        }));
        let id = store.get_or_create(None).await.session_id;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .record_turn(&turn(id, &format!("q{i}"), &format!("a{i}")))
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.history(id).await.len(), 16);
    }
}
