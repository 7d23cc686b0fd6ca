//! Tooling for AgentForge: the catalog ([`ToolRegistry`]), semantic
//! retrieval over it ([`ToolIndex`]), and execution dispatch
//! ([`ToolExecutor`]).

pub mod exec;
pub mod index;
pub mod registry;

pub use exec::{NativeToolHandler, ScriptRunner, ToolExecutor};
pub use index::ToolIndex;
pub use registry::{ToolRegistry, BUILTIN_RECALL_MEMORY, BUILTIN_STORE_MEMORY};
