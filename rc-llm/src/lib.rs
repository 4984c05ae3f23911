//! Completion-provider client for ReplyChain.
//!
//! Pure HTTP client against OpenAI-compatible chat completion endpoints, plus
//! the provider registry with per-provider credential rotation.

mod client;
mod error;
mod openai;
mod provider;
mod reasoning;
mod types;

pub use client::{ChatCompletion, LlmClient};
pub use error::{LlmError, Result};
pub use provider::{ProviderConfig, ProviderRegistry};
pub use reasoning::{THINK_CLOSE, THINK_OPEN, split_reasoning};
pub use types::{ChatMessage, Role};
