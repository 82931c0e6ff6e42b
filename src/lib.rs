//! qwq-serve: an HTTP chat-completion service for a single causal language model
//!
//! This library provides:
//! - Model download from the Hugging Face hub (or a local directory)
//! - A candle-backed Qwen2 model provider with chat-template rendering
//! - Background model loading with retry and backoff
//! - A bounded worker pool so generation never blocks the async executor
//! - An axum router exposing `/`, `/health` and `/chat`
//!
//! # Example
//!
//! ```no_run
//! use qwq_serve::{ModelManager, ModelSource, Result, ServeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ServeConfig::new(ModelSource::new("Qwen/QwQ-32B-Preview"));
//!     ModelManager::new(config).serve().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod generation;
pub mod hub;
pub mod loader;
pub mod manager;
pub mod pool;
pub mod protocol;
pub mod provider;
pub mod qwen2;
pub mod server;
pub mod template;

// Re-export main types for library users
pub use config::{ModelSource, ServeArgs, ServeConfig};
pub use error::ApiError;
pub use generation::{Completion, GenerationParams};
pub use loader::{LoadPolicy, LoadState, ModelSlot};
pub use manager::ModelManager;
pub use pool::WorkerPool;
pub use protocol::{ChatMessage, ChatRequest, ChatResponse, Role};
pub use provider::ModelProvider;
pub use server::{create_router, AppState};

pub type Result<T> = std::result::Result<T, anyhow::Error>;
