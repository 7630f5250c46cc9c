//! The language-model driver boundary.
//!
//! Drivers are the one piece of the system explicitly named as an external
//! collaborator: the kernel only needs the capability set below and a
//! way to select an implementation by name. `local` is the bundled,
//! deterministic driver used by tests and the seed scenarios; `ollama`
//! talks to a real, locally-hosted model over HTTP to exercise the JSON
//! healer against genuinely varied output. The remaining names are recorded
//! for dispatch completeness but are not wired to a network client here,
//! consistent with drivers being out of the core's scope.

mod local;
mod ollama;

pub use local::LocalDriver;
pub use ollama::OllamaDriver;

use async_trait::async_trait;

use crate::embedding::Embedder;
use crate::error::{KernelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverName {
    Ollama,
    OpenAi,
    Anthropic,
    Gemini,
    Local,
}

impl DriverName {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ollama" => Some(DriverName::Ollama),
            "openai" => Some(DriverName::OpenAi),
            "anthropic" => Some(DriverName::Anthropic),
            "gemini" => Some(DriverName::Gemini),
            "local" => Some(DriverName::Local),
            _ => None,
        }
    }
}

/// A single structured proposal parsed from a model reply, or an onward
/// streaming callback's token.
pub type OnToken<'a> = dyn FnMut(&str) + Send + 'a;

#[async_trait]
pub trait LlmDriver: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn generate_structured(
        &self,
        user_prompt: &str,
        schema_description: &str,
        system_prompt: &str,
        retries: u32,
    ) -> Result<serde_json::Value>;

    async fn generate_structured_streaming(
        &self,
        user_prompt: &str,
        schema_description: &str,
        system_prompt: &str,
        retries: u32,
        on_token: &mut OnToken<'_>,
    ) -> Result<serde_json::Value>;

    async fn generate_raw(&self, prompt: &str, system: &str) -> Result<String>;

    /// Token count of the most recent request, for telemetry.
    fn last_token_count(&self) -> usize;
}

/// Builds a driver by name, per's `ollama|openai|anthropic|gemini|local`
/// selection.
pub fn build(name: &str, model: &str, endpoint: Option<String>) -> Result<Box<dyn LlmDriver>> {
    match DriverName::parse(name) {
        Some(DriverName::Local) => Ok(Box::new(LocalDriver::new())),
        Some(DriverName::Ollama) => Ok(Box::new(OllamaDriver::new(
            model.to_string(),
            endpoint.unwrap_or_else(|| "http://localhost:11434".to_string()),
        ))),
        Some(other) => Err(KernelError::BadInput(format!(
            "driver '{other:?}' is registered for dispatch but has no client wired in this build"
        ))),
        None => Err(KernelError::BadInput(format!("unknown driver '{name}'"))),
    }
}

/// Bridges a driver's async `embed` into the synchronous [`Embedder`]
/// contract the Sidecar and Gatekeeper use, for callers who want
/// remote-model embeddings instead of the bundled local embedder.
pub struct DriverEmbedder<D: LlmDriver> {
    driver: std::sync::Arc<D>,
    handle: tokio::runtime::Handle,
}

impl<D: LlmDriver> DriverEmbedder<D> {
    pub fn new(driver: std::sync::Arc<D>, handle: tokio::runtime::Handle) -> Self {
        DriverEmbedder { driver, handle }
    }
}

impl<D: LlmDriver> Embedder for DriverEmbedder<D> {
    fn embed(&self, text: &str) -> Vec<f32> {
        let driver = self.driver.clone();
        let text = text.to_string();
        self.handle
            .block_on(async move { driver.embed(&text).await })
            .unwrap_or_default()
    }
}
