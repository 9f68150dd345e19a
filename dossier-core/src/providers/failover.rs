//! Failover coordination across the backends configured for each role.
//!
//! Every call resolves its role to one or more concrete backends using the
//! role's [`FailoverStrategy`]:
//! - `primary_only` calls the first backend and propagates its failure
//! - `fallback_on_error` walks the list in order until one succeeds
//! - `round_robin` rotates through the list per call
//!
//! Each backend attempt is retried with backoff, bounded by the backend's
//! timeout, and raced against the run's cancellation token. Health is
//! recorded once per backend attempt.

use super::health::{BackendHealth, HealthTable};
use super::registry::ProviderRegistry;
use super::{
    LlmBackend, LlmParams, Role, SearchBackend, SearchHit, SearchParams, TranslateBackend,
    with_retry,
};
use crate::config::{BackendConfig, FailoverStrategy, ProviderConfig, RoleConfig};
use crate::error::{ConfigError, ProviderError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A completion request with optional stage-level overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Overrides the backend's configured temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn params_for(&self, settings: &BackendConfig) -> LlmParams {
        LlmParams {
            system: self.system.clone(),
            temperature: self.temperature.unwrap_or(settings.temperature),
            max_tokens: self.max_tokens.or(settings.max_tokens),
            model: settings.model.clone(),
        }
    }
}

/// A search request; `max_results` overrides the backend's setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: None,
        }
    }
}

/// Role-agnostic request accepted by [`FailoverCoordinator::invoke`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderRequest {
    Complete(LlmRequest),
    Search(SearchRequest),
    Translate { segment: String, target_lang: String },
}

impl ProviderRequest {
    fn kind(&self) -> &'static str {
        match self {
            ProviderRequest::Complete(_) => "complete",
            ProviderRequest::Search(_) => "search",
            ProviderRequest::Translate { .. } => "translate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ProviderResponse {
    Text(String),
    Hits(Vec<SearchHit>),
}

struct RoleEntry<B: ?Sized> {
    settings: BackendConfig,
    slot: usize,
    backend: Arc<B>,
}

struct RoleTable<B: ?Sized> {
    role: Role,
    strategy: FailoverStrategy,
    entries: Vec<RoleEntry<B>>,
    cursor: AtomicUsize,
}

impl<B: ?Sized> RoleTable<B> {
    fn build(
        role: Role,
        config: &RoleConfig,
        health: &HealthTable,
        lookup: impl Fn(&str) -> Option<Arc<B>>,
    ) -> Result<Self, ConfigError> {
        let mut entries = Vec::with_capacity(config.backends.len());
        for settings in &config.backends {
            let backend = lookup(&settings.id).ok_or_else(|| ConfigError::UnregisteredBackend {
                role: role.to_string(),
                backend: settings.id.clone(),
            })?;
            let slot = health
                .slot_of(&settings.id)
                .ok_or_else(|| ConfigError::Invalid {
                    message: format!("no health slot for backend '{}'", settings.id),
                })?;
            entries.push(RoleEntry {
                settings: settings.clone(),
                slot,
                backend,
            });
        }
        Ok(Self {
            role,
            strategy: config.strategy,
            entries,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Entry indices to try for one call, in order.
    fn candidates(&self) -> Vec<usize> {
        match self.strategy {
            FailoverStrategy::PrimaryOnly => vec![0],
            FailoverStrategy::FallbackOnError => (0..self.entries.len()).collect(),
            FailoverStrategy::RoundRobin => {
                vec![self.cursor.fetch_add(1, Ordering::Relaxed) % self.entries.len()]
            }
        }
    }
}

/// Resolves logical roles to concrete backends with retries, timeouts,
/// failover and health tracking.
///
/// One coordinator is shared by every stage of a run and by concurrent
/// runs; all of its state is either immutable or atomic.
pub struct FailoverCoordinator {
    config: Arc<ProviderConfig>,
    llm: RoleTable<dyn LlmBackend>,
    search: RoleTable<dyn SearchBackend>,
    translation: RoleTable<dyn TranslateBackend>,
    health: Arc<HealthTable>,
}

impl std::fmt::Debug for FailoverCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverCoordinator")
            .field("llm", &self.llm.strategy)
            .field("search", &self.search.strategy)
            .field("translation", &self.translation.strategy)
            .field("health_slots", &self.health.len())
            .finish()
    }
}

impl FailoverCoordinator {
    /// Build a coordinator for `config`, resolving every backend id in
    /// `registry`.
    ///
    /// Fails if a role is empty or names a backend the registry lacks.
    pub fn new(
        config: Arc<ProviderConfig>,
        registry: &ProviderRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let ids = [&config.llm, &config.search, &config.translation]
            .into_iter()
            .flat_map(|role| role.backends.iter().map(|b| b.id.clone()));
        let health = Arc::new(HealthTable::new(ids));

        let llm = RoleTable::build(Role::Llm, &config.llm, &health, |id| registry.llm(id))?;
        let search =
            RoleTable::build(Role::Search, &config.search, &health, |id| registry.search(id))?;
        let translation = RoleTable::build(Role::Translation, &config.translation, &health, |id| {
            registry.translation(id)
        })?;

        debug!(
            llm = %llm.strategy,
            search = %search.strategy,
            translation = %translation.strategy,
            backends = health.len(),
            "Failover coordinator ready"
        );

        Ok(Self {
            config,
            llm,
            search,
            translation,
            health,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn health(&self) -> &Arc<HealthTable> {
        &self.health
    }

    pub fn health_snapshot(&self) -> Vec<BackendHealth> {
        self.health.snapshot()
    }

    pub fn strategy(&self, role: Role) -> FailoverStrategy {
        match role {
            Role::Llm => self.llm.strategy,
            Role::Search => self.search.strategy,
            Role::Translation => self.translation.strategy,
        }
    }

    /// Run a completion through the `llm` role.
    pub async fn complete(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        self.dispatch(&self.llm, cancel, |backend, settings| {
            let params = request.params_for(settings);
            async move { backend.complete(&request.prompt, &params).await }
        })
        .await
    }

    /// Run a search through the `search` role.
    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        self.dispatch(&self.search, cancel, |backend, settings| {
            let params = SearchParams {
                max_results: request.max_results.unwrap_or(settings.max_results),
            };
            async move { backend.search(&request.query, &params).await }
        })
        .await
    }

    /// Translate one segment through the `translation` role.
    pub async fn translate(
        &self,
        segment: &str,
        target_lang: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        self.dispatch(&self.translation, cancel, |backend, _settings| async move {
            backend.translate(segment, target_lang).await
        })
        .await
    }

    /// Serve a role-agnostic request through `role`.
    pub async fn invoke(
        &self,
        role: Role,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse, ProviderError> {
        match (role, request) {
            (Role::Llm, ProviderRequest::Complete(req)) => {
                self.complete(req, cancel).await.map(ProviderResponse::Text)
            }
            (Role::Search, ProviderRequest::Search(req)) => {
                self.search(req, cancel).await.map(ProviderResponse::Hits)
            }
            (
                Role::Translation,
                ProviderRequest::Translate {
                    segment,
                    target_lang,
                },
            ) => self
                .translate(segment, target_lang, cancel)
                .await
                .map(ProviderResponse::Text),
            (role, request) => Err(ProviderError::RequestMismatch {
                role: role.to_string(),
                request: request.kind().to_string(),
            }),
        }
    }

    async fn dispatch<B, T, F, Fut>(
        &self,
        table: &RoleTable<B>,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, ProviderError>
    where
        B: ?Sized + Send + Sync,
        F: Fn(Arc<B>, &BackendConfig) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if table.entries.is_empty() {
            return Err(ProviderError::RoleNotConfigured {
                role: table.role.to_string(),
            });
        }

        let mut chain = Vec::new();
        for index in table.candidates() {
            let entry = &table.entries[index];
            match self.attempt(entry, cancel, &op).await {
                Ok(value) => return Ok(value),
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(e) => {
                    if table.strategy != FailoverStrategy::FallbackOnError || !e.allows_fallback()
                    {
                        return Err(e);
                    }
                    warn!(
                        role = %table.role,
                        backend = %entry.settings.id,
                        error = %e,
                        "Backend failed, trying next"
                    );
                    chain.push(e);
                }
            }
        }

        Err(ProviderError::AllBackendsExhausted {
            role: table.role.to_string(),
            chain,
        })
    }

    /// One backend attempt: retries, per-call timeout, cancellation race,
    /// then a single health update.
    async fn attempt<B, T, F, Fut>(
        &self,
        entry: &RoleEntry<B>,
        cancel: &CancellationToken,
        op: &F,
    ) -> Result<T, ProviderError>
    where
        B: ?Sized + Send + Sync,
        F: Fn(Arc<B>, &BackendConfig) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let settings = &entry.settings;
        let limit = Duration::from_secs(settings.timeout_secs);
        let call = || {
            let fut = op(entry.backend.clone(), settings);
            let backend = settings.id.clone();
            let timeout_secs = settings.timeout_secs;
            async move {
                tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                    Err(ProviderError::Timeout {
                        backend,
                        timeout_secs,
                    })
                })
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            result = with_retry(&self.config.retry, call) => result,
        };

        match &result {
            Ok(_) => self.health.record_success(entry.slot),
            Err(e) => {
                debug!(backend = %settings.id, error = %e, "Backend attempt failed");
                self.health.record_failure(entry.slot);
            }
        }
        result
    }
}
