//! Long-term memory for AgentForge.
//!
//! A [`VectorStore`] trait abstracts the ANN database; two backends ship:
//! Milvus over its HTTP v2 API and an in-memory store for tests and
//! vector-database-free deployments. [`MemoryService`] layers per-user
//! embedding resolution and the remember/recall/browse/compress operations
//! on top.

pub mod compress;
pub mod memdb;
pub mod milvus;
pub mod service;
pub mod store;

pub use compress::{CompressPrepareResult, CompressedMemory, MemoryCompressService};
pub use memdb::InMemoryVectorStore;
pub use milvus::MilvusRestStore;
pub use service::MemoryService;
pub use store::{tool_index_collection_name, SearchHit, VectorRow, VectorStore};
