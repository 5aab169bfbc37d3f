//! Rough token estimation for routing decisions

use gpugate_core::RoutingConfig;
use serde_json::Value;

/// Character-count token estimator
#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    chars_per_token: u32,
    default_max_tokens: u32,
}

impl TokenEstimator {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            chars_per_token: config.chars_per_token.max(1),
            default_max_tokens: config.default_max_tokens,
        }
    }

    fn text(&self, text: &str) -> u32 {
        (text.chars().count() as u32) / self.chars_per_token
    }

    /// Prompt text plus the requested completion budget
    pub fn chat(&self, body: &Value) -> u32 {
        let prompt: u32 = body
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .map(|m| self.message_content(m.get("content")))
                    .sum()
            })
            .unwrap_or(0);

        let completion = body
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(self.default_max_tokens);

        prompt.saturating_add(completion)
    }

    fn message_content(&self, content: Option<&Value>) -> u32 {
        match content {
            Some(Value::String(text)) => self.text(text),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .map(|t| self.text(t))
                .sum(),
            _ => 0,
        }
    }

    /// Input text, a single string or a batch
    pub fn embeddings(&self, body: &Value) -> u32 {
        self.texts(body.get("input"))
    }

    /// Query plus every candidate document
    pub fn rerank(&self, body: &Value) -> u32 {
        let query = self.texts(body.get("query"));
        let documents = match body.get("documents") {
            Some(Value::Array(docs)) => docs
                .iter()
                .map(|d| match d {
                    Value::String(text) => self.text(text),
                    other => self.texts(other.get("text")),
                })
                .sum(),
            _ => 0,
        };
        query.saturating_add(documents)
    }

    fn texts(&self, value: Option<&Value>) -> u32 {
        match value {
            Some(Value::String(text)) => self.text(text),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|t| self.text(t))
                .sum(),
            _ => 0,
        }
    }
}
