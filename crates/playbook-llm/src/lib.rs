//! Playbook LLM - generative text service used for deep reflection and classifier tie-breaks

pub mod anthropic;
pub mod provider;

pub use anthropic::AnthropicGenerator;
pub use provider::{generate_bounded, GenerateError, GenerateResult, Generator};
