//! Configuration management for docpilot services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
///
/// Every section has usable defaults so a bare `AppConfig::load()` yields a
/// working development setup (memory index, mock providers).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration (pgvector backend)
    pub database: DatabaseConfig,

    /// Redis configuration (cache layer)
    pub redis: RedisConfig,

    /// Vector index configuration
    pub index: IndexConfig,

    /// Embedding provider configuration
    pub embedding: EmbeddingConfig,

    /// Language model configuration
    pub generation: GenerationConfig,

    /// Retrieval tuning
    pub retrieval: RetrievalConfig,

    /// Session store configuration
    pub session: SessionConfig,

    /// Streaming / query lifecycle configuration
    pub stream: StreamConfig,

    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,

    /// Ingestion pipeline configuration
    pub ingestion: IngestionConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds (REST surface)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Enable the Redis cache layer; when false every lookup is a miss
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// TTL for cached embeddings (content-addressed, safe to keep long)
    #[serde(default = "default_embedding_ttl")]
    pub embedding_ttl_secs: u64,

    /// TTL for cached retrieval results (short; index contents change)
    #[serde(default = "default_response_ttl")]
    pub response_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    /// Vector index backend: pgvector, memory
    #[serde(default = "default_index_backend")]
    pub backend: String,

    /// Create the table and vector extension on startup if missing
    #[serde(default = "default_enabled")]
    pub ensure_schema: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for the embedding service
    pub api_key: Option<String>,

    /// API base URL (for OpenAI-compatible endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries per batch
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,

    /// Texts per embedding request
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationConfig {
    /// Generation provider: openai, mock
    #[serde(default = "default_generation_provider")]
    pub provider: String,

    /// API key for the language model service
    pub api_key: Option<String>,

    /// API base URL (for OpenAI-compatible endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_generation_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,

    /// Default maximum response tokens (client may lower, not raise)
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Default sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// History entries included in the prompt window
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Vector hits requested per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum relevance score; hits below are discarded
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Cap on merged items (highlights + hits) handed to generation
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// History entries kept per session (user and assistant each count one)
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// Inactivity window after which a session expires
    #[serde(default = "default_session_ttl")]
    pub idle_ttl_secs: u64,

    /// Highlight lifetime, independent of session expiry
    #[serde(default = "default_highlight_ttl")]
    pub highlight_ttl_secs: u64,

    /// Shard count for the session store (power of two)
    #[serde(default = "default_session_shards")]
    pub shards: usize,

    /// Background sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Wall-clock budget per query before the watchdog fires
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// What to do with a query that arrives while one is in flight:
    /// "cancel" aborts the in-flight query, "queue" defers the new one
    #[serde(default = "default_overlap_policy")]
    pub overlap_policy: String,

    /// Pending queries held per connection in queue mode
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Outbound event channel capacity per connection
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Queries per second per connection (token bucket refill)
    #[serde(default = "default_connection_rate")]
    pub connection_per_second: u32,

    /// Burst capacity per connection
    #[serde(default = "default_connection_burst")]
    pub connection_burst: u32,

    /// Queries per second per client identity (IP), across connections
    #[serde(default = "default_identity_rate")]
    pub identity_per_second: u32,

    /// Burst capacity per client identity
    #[serde(default = "default_identity_burst")]
    pub identity_burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    /// Soft target chunk size in estimated tokens
    #[serde(default = "default_target_tokens")]
    pub target_tokens: u32,

    /// Hard ceiling before splitting at a finer boundary
    #[serde(default = "default_max_tokens_per_chunk")]
    pub max_tokens_per_chunk: u32,

    /// Overlap fraction carried between consecutive chunks
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f32,

    /// Chunks embedded per upstream call
    #[serde(default = "default_ingest_batch_size")]
    pub batch_size: usize,

    /// Delay between embedding batches, to avoid saturating the provider
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// File extensions picked up by the scanner
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_database_url() -> String { "postgres://localhost/docpilot".to_string() }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_embedding_ttl() -> u64 { 604_800 }
fn default_response_ttl() -> u64 { 300 }
fn default_index_backend() -> String { "pgvector".to_string() }
fn default_embedding_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 1536 }
fn default_embedding_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_embedding_batch_size() -> usize { 64 }
fn default_generation_provider() -> String { "openai".to_string() }
fn default_generation_model() -> String { "gpt-4o-mini".to_string() }
fn default_generation_timeout() -> u64 { 60 }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f32 { 0.3 }
fn default_history_window() -> usize { 8 }
fn default_top_k() -> usize { 8 }
fn default_min_score() -> f32 { 0.35 }
fn default_max_items() -> usize { 10 }
fn default_history_cap() -> usize { 20 }
fn default_session_ttl() -> u64 { 1800 }
fn default_highlight_ttl() -> u64 { 900 }
fn default_session_shards() -> usize { 16 }
fn default_sweep_interval() -> u64 { 60 }
fn default_query_timeout() -> u64 { 30 }
fn default_overlap_policy() -> String { "cancel".to_string() }
fn default_queue_depth() -> usize { 4 }
fn default_channel_capacity() -> usize { 64 }
fn default_connection_rate() -> u32 { 2 }
fn default_connection_burst() -> u32 { 5 }
fn default_identity_rate() -> u32 { 10 }
fn default_identity_burst() -> u32 { 20 }
fn default_enabled() -> bool { true }
fn default_target_tokens() -> u32 { 800 }
fn default_max_tokens_per_chunk() -> u32 { 1200 }
fn default_overlap_fraction() -> f32 { 0.2 }
fn default_ingest_batch_size() -> usize { 64 }
fn default_batch_delay_ms() -> u64 { 50 }
fn default_extensions() -> Vec<String> {
    vec!["md".into(), "markdown".into(), "mdx".into(), "txt".into()]
}
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "docpilot".to_string() }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the per-query watchdog budget as Duration
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.stream.query_timeout_secs)
    }

    /// Get session inactivity window as Duration
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.idle_ttl_secs)
    }

    /// Get highlight lifetime as Duration
    pub fn highlight_ttl(&self) -> Duration {
        Duration::from_secs(self.session.highlight_ttl_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            enabled: default_enabled(),
            embedding_ttl_secs: default_embedding_ttl(),
            response_ttl_secs: default_response_ttl(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            ensure_schema: default_enabled(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
            batch_size: default_embedding_batch_size(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            api_key: None,
            api_base: None,
            model: default_generation_model(),
            timeout_secs: default_generation_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            history_window: default_history_window(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            max_items: default_max_items(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
            idle_ttl_secs: default_session_ttl(),
            highlight_ttl_secs: default_highlight_ttl(),
            shards: default_session_shards(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: default_query_timeout(),
            overlap_policy: default_overlap_policy(),
            queue_depth: default_queue_depth(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connection_per_second: default_connection_rate(),
            connection_burst: default_connection_burst(),
            identity_per_second: default_identity_rate(),
            identity_burst: default_identity_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            max_tokens_per_chunk: default_max_tokens_per_chunk(),
            overlap_fraction: default_overlap_fraction(),
            batch_size: default_ingest_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            extensions: default_extensions(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}
