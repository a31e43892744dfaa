//! Language model backend and the adapter that turns pipeline needs into prompts.

pub mod adapter;
pub mod ollama;

use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub top_p: f32,
    /// Upper bound on generated tokens.
    pub num_predict: u32,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.9,
            num_predict: 500,
        }
    }
}

/// A text-generation backend. Implementations must bound every call with a timeout.
pub trait LanguageModel: Send + Sync {
    /// True when the backend is reachable and serves the configured model.
    fn health_check(&self) -> bool;

    fn generate(&self, prompt: &str, system: &str, options: &SamplingOptions) -> Result<String>;
}
