//! CLI commands implementation

use anyhow::{Context, Result};
use gpugate_core::{CallerSource, ModelSnapshot};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header that overrides the source bound to the API key
const SOURCE_HEADER: &str = "x-request-source";

/// API client for communicating with the gateway
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("API token contains invalid characters")?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// OpenAI model list entry
#[derive(Debug, Deserialize)]
pub struct ModelEntry {
    pub id: String,
}

/// OpenAI model list
#[derive(Debug, Deserialize)]
pub struct ModelList {
    pub data: Vec<ModelEntry>,
}

/// GPU reservation entry
#[derive(Debug, Deserialize)]
pub struct Reservation {
    pub gpu: u32,
    pub model: String,
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub models: Vec<ModelSnapshot>,
    pub reservations: Vec<Reservation>,
}

/// List model names
pub async fn models(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/v1/models")).send().await?;

    if response.status().is_success() {
        let list: ModelList = response.json().await?;
        if list.data.is_empty() {
            println!("No models configured");
        } else {
            for model in list.data {
                println!("{}", model.id);
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list models: {}", error_message(&error));
    }

    Ok(())
}

/// Show model states and GPU reservations
pub async fn status(client: &ApiClient, model: Option<String>) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("gpugate v{}", status.version);
        println!();
        for line in status_table(&status.models, model.as_deref()) {
            println!("{}", line);
        }

        if model.is_none() {
            println!();
            if status.reservations.is_empty() {
                println!("No GPUs reserved");
            } else {
                println!("GPU reservations:");
                for r in status.reservations {
                    println!("  GPU {} -> {}", r.gpu, r.model);
                }
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error_message(&error));
    }

    Ok(())
}

/// Check gateway liveness
pub async fn health(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/health")).send().await?;

    if response.status().is_success() {
        println!("Gateway at {} is healthy", client.base_url);
    } else {
        eprintln!("Gateway returned {}", response.status());
    }

    Ok(())
}

/// Send one chat message
pub async fn chat(
    client: &ApiClient,
    model: String,
    prompt: String,
    source: Option<CallerSource>,
    max_tokens: Option<u32>,
) -> Result<()> {
    #[derive(Serialize)]
    struct Message {
        role: &'static str,
        content: String,
    }

    #[derive(Serialize)]
    struct ChatRequest {
        model: String,
        messages: Vec<Message>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
    }

    let req = ChatRequest {
        model,
        messages: vec![Message {
            role: "user",
            content: prompt,
        }],
        max_tokens,
    };

    let mut builder = client
        .client
        .post(client.url("/v1/chat/completions"))
        .json(&req);
    if let Some(source) = source {
        builder = builder.header(SOURCE_HEADER, source.to_string());
    }

    let response = builder.send().await?;

    if response.status().is_success() {
        let body: Value = response.json().await?;
        match reply_text(&body) {
            Some(text) => println!("{}", text),
            None => println!("{}", serde_json::to_string_pretty(&body)?),
        }
    } else {
        let status = response.status();
        let error = response.text().await?;
        eprintln!("Request failed ({}): {}", status, error_message(&error));
    }

    Ok(())
}

/// Render model snapshots as a table, optionally filtered by id or alias
fn status_table(models: &[ModelSnapshot], filter: Option<&str>) -> Vec<String> {
    let selected: Vec<&ModelSnapshot> = models
        .iter()
        .filter(|m| match filter {
            Some(name) => m.id == name || m.alias.as_deref() == Some(name),
            None => true,
        })
        .collect();

    if selected.is_empty() {
        return vec!["No matching models".to_string()];
    }

    let mut lines = vec![format!(
        "{:<24} {:<10} {:<8} {:<10} {:<12} {:<10}",
        "MODEL", "STATUS", "ACTIVE", "GPUS", "WINDOW", "IDLE"
    )];
    lines.push("-".repeat(78));
    for m in selected {
        let gpus = m
            .gpus
            .iter()
            .map(|g| g.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let idle = m
            .idle_secs
            .map(|s| format!("{:.0}s", s))
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "{:<24} {:<10} {:<8} {:<10} {:<12} {:<10}",
            m.id,
            m.status.to_string(),
            format!("{}/{}", m.active_requests, m.max_concurrent),
            if gpus.is_empty() { "-".to_string() } else { gpus },
            m.window.to_string(),
            idle
        ));
    }
    lines
}

/// First choice's message content of a chat completion
fn reply_text(body: &Value) -> Option<&str> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

/// Message from an OpenAI error envelope, or the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(id: &str, alias: Option<&str>, status: &str) -> ModelSnapshot {
        serde_json::from_value(json!({
            "id": id,
            "alias": alias,
            "status": status,
            "active_requests": 1,
            "max_concurrent": 3,
            "idle_secs": 12.4,
            "consecutive_failures": 0,
            "gpus": [0, 3],
            "window": "always",
            "worker": null,
        }))
        .unwrap()
    }

    #[test]
    fn test_status_table_filters_by_alias() {
        let models = vec![
            snapshot("llama@0", Some("llama"), "running"),
            snapshot("bge-m3", None, "stopped"),
        ];

        let all = status_table(&models, None);
        assert_eq!(all.len(), 4);

        let filtered = status_table(&models, Some("llama"));
        assert_eq!(filtered.len(), 3);
        assert!(filtered[2].starts_with("llama@0"));
        assert!(filtered[2].contains("Running"));
        assert!(filtered[2].contains("1/3"));
        assert!(filtered[2].contains("0,3"));
        assert!(filtered[2].contains("12s"));

        assert_eq!(status_table(&models, Some("nope")), vec!["No matching models"]);
    }

    #[test]
    fn test_reply_text() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": "hi"}}]
        });
        assert_eq!(reply_text(&body), Some("hi"));
        assert_eq!(reply_text(&json!({"data": []})), None);
    }

    #[test]
    fn test_error_message() {
        let body = r#"{"error":{"message":"Model 'x' not found","type":"model_not_found","code":404}}"#;
        assert_eq!(error_message(body), "Model 'x' not found");
        assert_eq!(error_message("bad gateway"), "bad gateway");
    }
}
