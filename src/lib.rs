//! # promptpool
//!
//! Concurrent, rate-limit-aware batch client for chat-completion HTTP APIs
//! (OpenAI-style).
//!
//! Given a list of input texts, a selected model, and an optional system
//! prompt, promptpool dispatches one completion request per text across a
//! bounded worker pool, honours the request and token budgets the server
//! advertises in its `x-ratelimit-*` headers, surfaces progress, and
//! returns results ordered to match the inputs.
//!
//! ## Features
//!
//! - **Bounded concurrency**: at most `max_workers` requests in flight
//! - **Server-driven rate limiting**: budgets are pre-debited before each
//!   request and replaced from every response's headers
//! - **Input-order results**: `results()[i]` always answers input `i`
//! - **Progress reporting**: an optional callback receives the completed
//!   fraction as texts finish
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use promptpool::LlmClient;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut client =
//!         LlmClient::connect("https://api.openai.com/v1/", "sk-...", vec![]).await?;
//!
//!     client.set_model("gpt-4o-mini")?;
//!     client.set_prompt("Answer briefly.");
//!     client.set_max_workers(4);
//!     client.add_texts(["first text", "second text"]);
//!     client.run().await?;
//!
//!     for (i, result) in client.results().iter().enumerate() {
//!         println!("[{}] {}", i + 1, result);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod limits;
pub mod processor;
pub mod request;
pub mod tracker;
pub mod transport;

// Re-exports for convenience
pub use client::{LlmClient, DEFAULT_TOKENS_PER_CHARACTER};
pub use config::{Args, Settings};
pub use error::{PoolError, Result};
pub use limits::{
    estimate_tokens, format_duration_ms, parse_duration_ms, RateLimitLedger, RateLimitUpdate,
};
pub use processor::JobSnapshot;
pub use request::{build_chat_body, extract_content};
pub use tracker::{ProgressCallback, ProgressTracker};
pub use transport::{ApiCall, ApiReply, HttpTransport, Transport};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
