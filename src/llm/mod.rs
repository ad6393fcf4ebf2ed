pub mod anthropic;
pub mod client;
pub mod config;
pub mod openai;
pub mod prompts;
pub mod retry;
pub mod validation;

#[cfg(test)]
pub(crate) mod fake;

pub use anthropic::AnthropicClient;
pub use client::*;
pub use config::*;
pub use openai::OpenAiClient;
pub use retry::*;
pub use validation::*;
