//! OpenAI-compatible chat completion backend.
//!
//! Works with OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio and any endpoint
//! following the chat completions API. Only the text of the first choice is
//! used.

use super::{LlmBackend, LlmParams, resolve_api_key};
use crate::config::BackendConfig;
use crate::error::{ConfigError, ProviderError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// An [`LlmBackend`] speaking the OpenAI chat completions protocol.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleBackend {
    id: String,
    client: Client,
    base_url: String,
    model: String,
    /// Unset for local endpoints that need no credential.
    api_key_env: Option<String>,
    timeout_secs: u64,
}

impl OpenAiCompatibleBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self, ConfigError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                message: format!("backend '{}': base_url must be http(s): {base_url}", config.id),
            });
        }
        Ok(Self {
            id: config.id.clone(),
            client: Client::new(),
            base_url,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key_env: config.api_key_env.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body(&self, prompt: &str, params: &LlmParams) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &params.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let mut body = json!({
            "model": params.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
            "temperature": params.temperature,
            "stream": false,
        });
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    fn parse_response(&self, json: &Value) -> Result<String, ProviderError> {
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::InvalidResponse {
                backend: self.id.clone(),
                message: "response has no choices[0].message.content".to_string(),
            })
    }

    fn map_http_error(
        &self,
        status: reqwest::StatusCode,
        retry_after: Option<u64>,
        body: &str,
    ) -> ProviderError {
        let backend = self.id.clone();
        match status.as_u16() {
            401 | 403 => {
                debug!(backend = %backend, body = %body, "Authentication failed");
                ProviderError::Authentication { backend }
            }
            429 => ProviderError::RateLimited {
                backend,
                retry_after_secs: retry_after.unwrap_or(5),
            },
            code if code >= 500 => ProviderError::TransientNetwork {
                backend,
                message: format!("Server error ({status}): {}", truncate(body, 200)),
            },
            _ => ProviderError::InvalidResponse {
                backend,
                message: format!("HTTP {status}: {}", truncate(body, 200)),
            },
        }
    }
}

/// Map a transport-level reqwest error into the provider taxonomy.
pub(crate) fn map_transport_error(backend: &str, timeout_secs: u64, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            backend: backend.to_string(),
            timeout_secs,
        }
    } else if err.is_decode() {
        ProviderError::InvalidResponse {
            backend: backend.to_string(),
            message: err.to_string(),
        }
    } else {
        ProviderError::TransientNetwork {
            backend: backend.to_string(),
            message: err.to_string(),
        }
    }
}

pub(crate) fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, prompt: &str, params: &LlmParams) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(prompt, params);

        debug!(backend = %self.id, url = %url, model = %self.model, "Sending completion request");

        let mut request = self.client.post(&url).json(&body);
        if let Some(var) = self.api_key_env.as_deref() {
            request = request.bearer_auth(resolve_api_key(&self.id, Some(var))?);
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(&self.id, self.timeout_secs, e))?;

        let status = response.status();
        let retry_after = retry_after_header(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| map_transport_error(&self.id, self.timeout_secs, e))?;

        if !status.is_success() {
            return Err(self.map_http_error(status, retry_after, &text));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse {
            backend: self.id.clone(),
            message: format!("Invalid JSON: {e}"),
        })?;
        self.parse_response(&json)
    }
}
