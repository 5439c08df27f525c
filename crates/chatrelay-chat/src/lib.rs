//! Upstream chat streaming for chatrelay.
//!
//! Each provider adapter posts one streaming request and normalizes the
//! provider's SSE lines into [`ChatChunk`]s. Dify keeps conversation state on
//! its side; SiliconFlow is stateless and receives the message history.

pub mod adapters;
pub mod config;
pub mod sse;
pub mod types;

pub use adapters::{AdapterKind, AdapterSet, ChatAdapter, ChunkStream, UpstreamRequest};
pub use config::ProviderSettings;
pub use types::*;
