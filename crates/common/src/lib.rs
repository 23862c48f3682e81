//! docpilot common library
//!
//! Shared code for the docpilot services:
//! - Core domain types (chunks, retrieved items, sessions, turns)
//! - Error taxonomy and HTTP mapping
//! - Configuration management
//! - Cache layer (Redis / in-memory)
//! - Database pool
//! - Metrics and observability

pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod types;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{AppError, ErrorCode, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
