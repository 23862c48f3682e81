//! Conversation layer: session state, generation clients, and the
//! retrieval-grounded answer engine.
//!
//! [`SessionStore`] keeps per-session history and highlight state in
//! sharded in-memory maps with TTL expiry. [`ConversationEngine`] turns
//! a query plus its retrieved context into a streamed, cited answer
//! through a [`GenerationClient`].

pub mod engine;
pub mod generation;
pub mod session;

pub use engine::{
    AnswerRequest, ConversationEngine, ToolExecutor, GENERATION_FALLBACK, NO_CONTENT_FALLBACK,
};
pub use generation::{
    create_generation_client, GenerationClient, GenerationEvent, GenerationRequest,
    GenerationStream, MockGenerationClient, MockResponse, OpenAiGenerationClient, ToolCall,
};
pub use session::{ChatSession, SessionSnapshot, SessionStore, SweepReport};
