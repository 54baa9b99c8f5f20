// LLM abstraction layer

pub mod provider;
pub mod openai;
pub mod anthropic;
pub mod openrouter;

#[cfg(test)]
pub mod testing;

pub use provider::*;
pub use crate::types::*;
