use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::LlmConfig;
use crate::errors::{PilotError, PilotResult};
use crate::llm::gateway::ModelGateway;
use crate::llm::types::ChatMessage;

/// Bearer token sent when no key is configured.
const PLACEHOLDER_KEY: &str = "EMPTY";

pub struct OpenAiCompatibleGateway {
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    frequency_penalty: Option<f64>,
    client: reqwest::Client,
}

impl OpenAiCompatibleGateway {
    pub fn new(cfg: &LlmConfig) -> PilotResult<Self> {
        let base = normalize_base_url(&cfg.base_url);
        if base.len() <= "https://".len() {
            return Err(PilotError::Config("llm.base_url is empty".into()));
        }
        let omit_penalty = cfg
            .omit_frequency_penalty_hosts
            .iter()
            .any(|host| !host.is_empty() && base.to_lowercase().contains(&host.to_lowercase()));

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;

        Ok(Self {
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key: bearer_token(&cfg.api_key),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            frequency_penalty: (!omit_penalty).then_some(cfg.frequency_penalty),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn build_request_body(&self, messages: &[ChatMessage]) -> PilotResult<Value> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "stream": false,
        });
        if let Some(penalty) = self.frequency_penalty {
            body["frequency_penalty"] = serde_json::to_value(penalty)?;
        }
        Ok(body)
    }
}

#[async_trait]
impl ModelGateway for OpenAiCompatibleGateway {
    fn name(&self) -> &str {
        &self.model
    }

    async fn request(&self, messages: &[ChatMessage]) -> PilotResult<String> {
        let body = self.build_request_body(messages)?;

        tracing::debug!(
            endpoint = %self.endpoint,
            model = %self.model,
            messages = messages.len(),
            "sending model request"
        );
        tracing::debug!(
            body = %serde_json::to_string(&sanitize_for_log(&body)).unwrap_or_default(),
            "request body (sanitized, base64 omitted)"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(PilotError::Transport(format!("{status}: {err_body}")));
        }

        let json: Value = response.json().await?;
        let content = extract_content(&json);
        tracing::info!(content_len = content.len(), "model response received");
        Ok(content)
    }
}

/// Prefix `https://` when no scheme is given.
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

pub fn bearer_token(key: &str) -> String {
    let key = key.trim();
    if key.is_empty() {
        PLACEHOLDER_KEY.to_string()
    } else {
        key.to_string()
    }
}

fn extract_content(json: &Value) -> String {
    json["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("")
        .to_string()
}

/// Copy of the body with every image URL replaced, for logging only.
fn sanitize_for_log(body: &Value) -> Value {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                    if let Some(url) = part.get_mut("image_url").and_then(|u| u.get_mut("url")) {
                        *url = Value::String("<omitted_base64_image>".to_string());
                    }
                }
            }
        }
    }
    log_body
}
