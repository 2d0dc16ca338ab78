//! External interface: the generation (LLM) runtime.
//!
//! Out of scope for this crate to implement (`spec.md` §1 names the LLM
//! runtime as an external interface) — this module only defines the trait
//! boundary components call through, so the orchestrator can be exercised
//! against a test double without depending on any particular model
//! provider.

use async_trait::async_trait;

use crate::error::Result;

/// A single request for generated text.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// System/instruction prompt.
    pub prompt: String,
    /// Context passed alongside the prompt (e.g. retrieved chunks).
    pub context: Vec<String>,
}

/// A generated response.
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    /// Generated text.
    pub text: String,
}

/// Abstraction over whatever generation runtime is configured. Handlers
/// that need generated text (synthesis, re-ranking) depend on this trait,
/// never on a concrete provider.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a response for the given request.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse>;
}
