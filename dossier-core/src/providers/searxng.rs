//! SearXNG-style JSON search backend.
//!
//! Issues `GET {base_url}/search?q=...&format=json` and reads
//! `results[].{url,title,content}`.

use super::openai_compat::{map_transport_error, retry_after_header};
use super::{SearchBackend, SearchHit, SearchParams, resolve_api_key};
use crate::config::BackendConfig;
use crate::error::{ConfigError, ProviderError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Debug, Deserialize)]
struct SearxResult {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone)]
pub struct SearxngBackend {
    id: String,
    client: Client,
    base_url: String,
    api_key_env: Option<String>,
    timeout_secs: u64,
}

impl SearxngBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self, ConfigError> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid {
                message: format!("search backend '{}' needs a base_url", config.id),
            })?
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            id: config.id.clone(),
            client: Client::new(),
            base_url,
            api_key_env: config.api_key_env.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    fn parse_hits(&self, body: &str, max_results: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let parsed: SearxResponse =
            serde_json::from_str(body).map_err(|e| ProviderError::InvalidResponse {
                backend: self.id.clone(),
                message: format!("Invalid JSON: {e}"),
            })?;
        Ok(parsed
            .results
            .into_iter()
            .filter(|r| !r.url.trim().is_empty())
            .take(max_results)
            .map(|r| SearchHit::new(r.url, r.title, r.content))
            .collect())
    }
}

#[async_trait]
impl SearchBackend for SearxngBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn search(
        &self,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        let url = format!("{}/search", self.base_url);
        debug!(backend = %self.id, query = %query, "Sending search request");

        let mut request = self
            .client
            .get(&url)
            .query(&[("q", query), ("format", "json")]);
        if let Some(var) = self.api_key_env.as_deref() {
            request = request.bearer_auth(resolve_api_key(&self.id, Some(var))?);
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(&self.id, self.timeout_secs, e))?;

        let status = response.status();
        let retry_after = retry_after_header(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(&self.id, self.timeout_secs, e))?;

        match status.as_u16() {
            200..=299 => self.parse_hits(&body, params.max_results),
            401 | 403 => Err(ProviderError::Authentication {
                backend: self.id.clone(),
            }),
            429 => Err(ProviderError::RateLimited {
                backend: self.id.clone(),
                retry_after_secs: retry_after.unwrap_or(5),
            }),
            code if code >= 500 => Err(ProviderError::TransientNetwork {
                backend: self.id.clone(),
                message: format!("Server error ({status})"),
            }),
            _ => Err(ProviderError::InvalidResponse {
                backend: self.id.clone(),
                message: format!("HTTP {status}"),
            }),
        }
    }
}
