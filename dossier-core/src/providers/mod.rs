//! Provider abstraction: backend capability traits, the registry, health
//! tracking and the failover coordinator.
//!
//! Concrete backends:
//! - `openai_compat`: any endpoint following the OpenAI chat completions API
//! - `searxng`: SearXNG-style JSON search endpoints
//! - `translate`: adapts an LLM backend into a translation backend
//! - `mock`: scripted in-memory backends for tests and offline runs

pub mod failover;
pub mod health;
pub mod mock;
pub mod openai_compat;
pub mod registry;
pub mod searxng;
pub mod translate;

use crate::config::RetryConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

pub use failover::{FailoverCoordinator, ProviderRequest, ProviderResponse};
pub use health::{BackendHealth, HealthTable};
pub use openai_compat::OpenAiCompatibleBackend;
pub use registry::ProviderRegistry;
pub use searxng::SearxngBackend;
pub use translate::LlmTranslateBackend;

/// Logical provider slot resolved to concrete backends per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Llm,
    Search,
    Translation,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Llm => write!(f, "llm"),
            Role::Search => write!(f, "search"),
            Role::Translation => write!(f, "translation"),
        }
    }
}

/// Resolved generation parameters passed to an LLM backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for LlmParams {
    fn default() -> Self {
        Self {
            system: None,
            temperature: 0.3,
            max_tokens: None,
            model: None,
        }
    }
}

/// Resolved search parameters passed to a search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub max_results: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self { max_results: 8 }
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

impl SearchHit {
    pub fn new(url: impl Into<String>, title: impl Into<String>, snippet: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            snippet: snippet.into(),
        }
    }
}

/// A language-model backend.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Identifier matching the `id` in the provider configuration.
    fn id(&self) -> &str;

    async fn complete(&self, prompt: &str, params: &LlmParams) -> Result<String, ProviderError>;
}

/// A web or document search backend.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn id(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>, ProviderError>;
}

/// A translation endpoint.
#[async_trait]
pub trait TranslateBackend: Send + Sync {
    fn id(&self) -> &str;

    async fn translate(&self, segment: &str, target_lang: &str) -> Result<String, ProviderError>;
}

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on `RateLimited` (respects `retry_after_secs`), `Timeout` and
/// `TransientNetwork`. Other errors return immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_retryable() || attempt >= config.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Compute backoff delay, respecting rate limit retry-after hints.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &ProviderError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let ProviderError::RateLimited {
        retry_after_secs, ..
    } = err
    {
        let server_ms = retry_after_secs.saturating_mul(1000).min(config.max_backoff_ms);
        return server_ms.max(computed);
    }
    computed
}

/// Pure exponential backoff with optional jitter.
fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        // Up to 25% jitter
        let jitter = (capped as f64 * 0.25 * rand_simple()) as u64;
        capped + jitter
    } else {
        capped
    }
}

/// Cheap pseudo-random fraction for jitter.
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Read a credential from the environment variable named in a backend entry.
pub fn resolve_api_key(backend_id: &str, env_var: Option<&str>) -> Result<String, ProviderError> {
    let Some(var) = env_var else {
        return Err(ProviderError::Authentication {
            backend: backend_id.to_string(),
        });
    };
    std::env::var(var).map_err(|_| {
        tracing::debug!(backend = backend_id, env_var = var, "Credential env var not set");
        ProviderError::Authentication {
            backend: backend_id.to_string(),
        }
    })
}
