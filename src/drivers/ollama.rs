//! A driver for a locally-hosted Ollama instance. This is the one bundled
//! driver that talks to a real model over the network, used to exercise
//! the JSON healer (`crate::healer`) against genuinely varied small-model
//! output rather than the bundled `local` driver's scripted replies.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::{KernelError, Result};
use crate::healer;

use super::{LlmDriver, OnToken};

pub struct OllamaDriver {
    model: String,
    endpoint: String,
    client: reqwest::Client,
    last_tokens: AtomicUsize,
}

impl OllamaDriver {
    pub fn new(model: String, endpoint: String) -> Self {
        OllamaDriver {
            model,
            endpoint,
            client: reqwest::Client::new(),
            last_tokens: AtomicUsize::new(0),
        }
    }

    async fn raw_completion(&self, prompt: &str, system: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "system": system,
            "stream": false,
        });
        let resp = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| KernelError::IoFailure(e.to_string()))?;
        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| KernelError::IoFailure(e.to_string()))?;
        let text = parsed
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.last_tokens.store(
            parsed.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
            Ordering::Relaxed,
        );
        Ok(text)
    }
}

#[async_trait]
impl LlmDriver for OllamaDriver {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({ "model": self.model, "prompt": text });
        let resp = self
            .client
            .post(format!("{}/api/embeddings", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| KernelError::IoFailure(e.to_string()))?;
        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| KernelError::IoFailure(e.to_string()))?;
        let embedding = parsed
            .get("embedding")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
            .unwrap_or_default();
        Ok(embedding)
    }

    async fn generate_structured(
        &self,
        user_prompt: &str,
        schema_description: &str,
        system_prompt: &str,
        retries: u32,
    ) -> Result<serde_json::Value> {
        let mut prompt = format!("{user_prompt}\n\nRespond only with JSON matching: {schema_description}");
        for attempt in 0..=retries {
            let raw = self.raw_completion(&prompt, system_prompt).await?;
            if let Some(healed) = healer::heal(&raw) {
                return Ok(healed);
            }
            warn!(attempt, "ollama reply failed every healing stage; retrying with a corrective prompt");
            prompt = format!(
                "{user_prompt}\n\nYour previous reply could not be parsed as JSON matching: {schema_description}\nReply with JSON only, no commentary."
            );
        }
        Err(KernelError::ModelProtocolFailure(
            "all parse-repair layers exhausted".to_string(),
        ))
    }

    async fn generate_structured_streaming(
        &self,
        user_prompt: &str,
        schema_description: &str,
        system_prompt: &str,
        retries: u32,
        on_token: &mut OnToken<'_>,
    ) -> Result<serde_json::Value> {
        // Ollama's non-streaming endpoint is used for simplicity; the token
        // callback still fires once with the full reply so callers that
        // drive a progress indicator keep working.
        let result = self
            .generate_structured(user_prompt, schema_description, system_prompt, retries)
            .await?;
        on_token(&result.to_string());
        Ok(result)
    }

    async fn generate_raw(&self, prompt: &str, system: &str) -> Result<String> {
        self.raw_completion(prompt, system).await
    }

    fn last_token_count(&self) -> usize {
        self.last_tokens.load(Ordering::Relaxed)
    }
}
