//! A deterministic, network-free driver used by the bundled CLI's default
//! offline mode and by every test/seed scenario in this crate. Callers
//! script its replies with [`LocalDriver::push_reply`]; with an empty
//! script it always proposes `halt_and_ask`, which keeps a misconfigured
//! session from looping forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::embedding::{Embedder, HashEmbedder};
use crate::error::Result;

use super::{LlmDriver, OnToken};

pub struct LocalDriver {
    scripted_structured: Mutex<VecDeque<serde_json::Value>>,
    scripted_raw: Mutex<VecDeque<String>>,
    embedder: HashEmbedder,
    last_tokens: AtomicUsize,
}

impl LocalDriver {
    pub fn new() -> Self {
        LocalDriver {
            scripted_structured: Mutex::new(VecDeque::new()),
            scripted_raw: Mutex::new(VecDeque::new()),
            embedder: HashEmbedder,
            last_tokens: AtomicUsize::new(0),
        }
    }

    pub fn push_reply(&self, reply: serde_json::Value) {
        self.scripted_structured.lock().push_back(reply);
    }

    pub fn push_raw(&self, raw: impl Into<String>) {
        self.scripted_raw.lock().push_back(raw.into());
    }
}

impl Default for LocalDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn fallback_halt() -> serde_json::Value {
    serde_json::json!({
        "thought_process": "no scripted reply available; halting to avoid an unbounded loop",
        "tool_call": "halt_and_ask",
        "target": "local driver has no further scripted replies"
    })
}

#[async_trait]
impl LlmDriver for LocalDriver {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embedder.embed(text))
    }

    async fn generate_structured(
        &self,
        user_prompt: &str,
        _schema_description: &str,
        _system_prompt: &str,
        _retries: u32,
    ) -> Result<serde_json::Value> {
        self.last_tokens.store(user_prompt.len() / 4, Ordering::Relaxed);
        Ok(self
            .scripted_structured
            .lock()
            .pop_front()
            .unwrap_or_else(fallback_halt))
    }

    async fn generate_structured_streaming(
        &self,
        user_prompt: &str,
        schema_description: &str,
        system_prompt: &str,
        retries: u32,
        on_token: &mut OnToken<'_>,
    ) -> Result<serde_json::Value> {
        let reply = self
            .generate_structured(user_prompt, schema_description, system_prompt, retries)
            .await?;
        on_token(&reply.to_string());
        Ok(reply)
    }

    async fn generate_raw(&self, prompt: &str, _system: &str) -> Result<String> {
        self.last_tokens.store(prompt.len() / 4, Ordering::Relaxed);
        Ok(self
            .scripted_raw
            .lock()
            .pop_front()
            .unwrap_or_else(|| format!("GENERATED: {prompt}")))
    }

    fn last_token_count(&self) -> usize {
        self.last_tokens.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_script_falls_back_to_halt() {
        let driver = LocalDriver::new();
        let reply = driver
            .generate_structured("prompt", "schema", "system", 3)
            .await
            .unwrap();
        assert_eq!(reply["tool_call"], "halt_and_ask");
    }

    #[tokio::test]
    async fn scripted_replies_are_returned_in_order() {
        let driver = LocalDriver::new();
        driver.push_reply(serde_json::json!({"tool_call": "stage_context", "target": "a.py", "thought_process": "x"}));
        let reply = driver
            .generate_structured("prompt", "schema", "system", 3)
            .await
            .unwrap();
        assert_eq!(reply["tool_call"], "stage_context");
    }
}
