//! # AgentForge Core
//!
//! Domain types, traits, and error definitions for the AgentForge agent
//! runtime. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem boundary is a trait here (chat caller, key stores, tool
//! store). Implementations live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod caller;
pub mod error;
pub mod event;
pub mod keys;
pub mod memory;
pub mod message;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use caller::{ChatCaller, Embedder};
pub use error::{Error, MemoryError, ProviderError, Result, StoreError, ToolError};
pub use event::{AgentEvent, EventPublisher, EventType};
pub use keys::{ApiKeyStore, EmbeddingConfig, EmbeddingModelStore, KeyPurpose, ProviderConfig, UserApiKey};
pub use memory::{EmbeddingModelConfig, MemoryItem, MemoryRecord, MemoryType};
pub use message::{ChatMessage, ChatRequest, ChatResponse, Role, StreamingChunk, ToolCall};
pub use session::{Session, SessionStatus};
pub use tool::{ToolDefinition, ToolDescriptor, ToolKind, ToolStore};
