//! Configuration system for Dossier.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> explicit file -> environment -> overrides.
//! Configuration is loaded from `~/.config/dossier/config.toml` and/or
//! `.dossier/config.toml` in the workspace directory.
//!
//! The loaded [`DossierConfig`] is immutable for the lifetime of a run; the
//! provider section is shared as `Arc<ProviderConfig>` and the pipeline
//! section is turned into per-run [`RunOptions`].

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static LANGUAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z]{2,3}(?:[_-][A-Za-z0-9]{2,8})*$").expect("valid language tag pattern")
});

/// Whether `tag` is a language tag such as `de`, `pt-BR` or `zh_Hant`.
///
/// Language tags end up in artifact file names, so anything else is refused.
pub fn is_language_tag(tag: &str) -> bool {
    LANGUAGE_TAG.is_match(tag)
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DossierConfig {
    pub providers: ProviderConfig,
    pub pipeline: PipelineConfig,
    pub drafts: DraftConfig,
    pub publish: PublishConfig,
    pub gateway: GatewayConfig,
}

/// Failover strategy for a logical provider role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStrategy {
    /// Always call the primary; failures propagate.
    PrimaryOnly,
    /// Walk the backend list in order until one succeeds.
    #[default]
    FallbackOnError,
    /// Rotate through backends per call.
    RoundRobin,
}

impl std::fmt::Display for FailoverStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverStrategy::PrimaryOnly => write!(f, "primary_only"),
            FailoverStrategy::FallbackOnError => write!(f, "fallback_on_error"),
            FailoverStrategy::RoundRobin => write!(f, "round_robin"),
        }
    }
}

/// A single concrete backend bound to a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Identifier used for registry lookup and health tracking.
    pub id: String,
    /// Implementation kind: "openai_compat", "searxng", ...
    pub kind: String,
    /// Model name for LLM-backed kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Environment variable holding the credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Endpoint override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Per-call timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum search results requested per call.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Sampling temperature for LLM-backed kinds.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_results() -> usize {
    8
}

fn default_temperature() -> f32 {
    0.3
}

impl BackendConfig {
    /// Minimal entry with default tunables.
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            model: None,
            api_key_env: None,
            base_url: None,
            timeout_secs: default_timeout_secs(),
            max_results: default_max_results(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

/// Strategy plus ordered backends for one logical role.
///
/// The first backend is the primary; the rest are fallbacks in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleConfig {
    #[serde(default)]
    pub strategy: FailoverStrategy,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl RoleConfig {
    pub fn new(strategy: FailoverStrategy, backends: Vec<BackendConfig>) -> Self {
        Self { strategy, backends }
    }
}

/// Retry policy applied to every backend attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 disables retrying).
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 8_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries or sleeps.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 0,
            backoff_multiplier: 1.0,
            max_backoff_ms: 0,
            jitter: false,
        }
    }
}

/// Immutable provider configuration for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub llm: RoleConfig,
    pub search: RoleConfig,
    pub translation: RoleConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let mut llm = BackendConfig::new("openai", "openai_compat");
        llm.model = Some("gpt-4o-mini".to_string());
        llm.api_key_env = Some("OPENAI_API_KEY".to_string());
        llm.timeout_secs = 60;

        let mut search = BackendConfig::new("searxng", "searxng");
        search.base_url = Some("http://localhost:8888".to_string());

        let mut translation = BackendConfig::new("openai-translate", "openai_compat");
        translation.model = Some("gpt-4o-mini".to_string());
        translation.api_key_env = Some("OPENAI_API_KEY".to_string());
        translation.temperature = 0.0;

        Self {
            llm: RoleConfig::new(FailoverStrategy::FallbackOnError, vec![llm]),
            search: RoleConfig::new(FailoverStrategy::FallbackOnError, vec![search]),
            translation: RoleConfig::new(FailoverStrategy::FallbackOnError, vec![translation]),
            retry: RetryConfig::default(),
        }
    }
}

impl ProviderConfig {
    /// Check structural validity.
    ///
    /// Every role needs at least one backend and ids must be unique within a
    /// role. The same id may appear in several roles; it then shares one
    /// health slot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (role, cfg) in [
            ("llm", &self.llm),
            ("search", &self.search),
            ("translation", &self.translation),
        ] {
            if cfg.backends.is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("role '{role}' has no backends"),
                });
            }
            let mut seen = HashSet::new();
            for backend in &cfg.backends {
                if backend.id.trim().is_empty() {
                    return Err(ConfigError::Invalid {
                        message: format!("role '{role}' has a backend with an empty id"),
                    });
                }
                if !seen.insert(backend.id.as_str()) {
                    return Err(ConfigError::Invalid {
                        message: format!("role '{role}' lists backend '{}' twice", backend.id),
                    });
                }
            }
        }
        Ok(())
    }

    /// Human-readable warnings for questionable tunables.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (role, cfg) in [
            ("llm", &self.llm),
            ("search", &self.search),
            ("translation", &self.translation),
        ] {
            for backend in &cfg.backends {
                if backend.timeout_secs == 0 {
                    warnings.push(format!(
                        "{role}/{}: timeout_secs is 0; every call will time out",
                        backend.id
                    ));
                }
                if !(0.0..=2.0).contains(&backend.temperature) {
                    warnings.push(format!(
                        "{role}/{}: temperature ({}) is outside the typical range 0.0–2.0",
                        backend.id, backend.temperature
                    ));
                }
            }
            if cfg.strategy == FailoverStrategy::PrimaryOnly && cfg.backends.len() > 1 {
                warnings.push(format!(
                    "{role}: primary_only ignores {} configured fallback backend(s)",
                    cfg.backends.len() - 1
                ));
            }
        }
        warnings
    }
}

/// Pipeline defaults; each run may override them through [`RunOptions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on planned sections.
    pub max_sections: usize,
    /// Research tasks allowed in flight at once.
    pub max_concurrency: usize,
    /// Planner prompts before giving up on an empty plan.
    pub planner_attempts: u32,
    /// Below this many hits the researcher issues a second search.
    pub min_search_results: usize,
    pub review_enabled: bool,
    pub summary_enabled: bool,
    /// Language the report is written in; translation runs when the target differs.
    pub source_language: String,
    /// Segments translated concurrently.
    pub translation_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_sections: 5,
            max_concurrency: 4,
            planner_attempts: 3,
            min_search_results: 3,
            review_enabled: true,
            summary_enabled: true,
            source_language: "en".to_string(),
            translation_concurrency: 4,
        }
    }
}

/// Where draft snapshots are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftConfig {
    /// Defaults to `<data dir>/drafts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl DraftConfig {
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("dev", "dossier", "dossier")
                .map(|d| d.data_dir().join("drafts"))
                .unwrap_or_else(|| PathBuf::from(".dossier").join("drafts"))
        })
    }
}

/// Publisher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishConfig {
    pub output_dir: PathBuf,
    /// Extra formats handed to the document converter ("pdf", "docx").
    #[serde(default)]
    pub formats: Vec<String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("reports"),
            formats: Vec::new(),
        }
    }
}

/// HTTP gateway bind address and run retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Finished runs kept in memory with their event replay log. Older ones
    /// remain available from the draft store.
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

fn default_retained_runs() -> usize {
    64
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18800,
            retained_runs: default_retained_runs(),
        }
    }
}

/// Per-run options derived from [`PipelineConfig`] and [`PublishConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub max_sections: usize,
    pub max_concurrency: usize,
    pub planner_attempts: u32,
    pub min_search_results: usize,
    pub review_enabled: bool,
    pub summary_enabled: bool,
    pub source_language: String,
    pub translation_concurrency: usize,
    pub output_dir: PathBuf,
    pub formats: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default(), &PublishConfig::default())
    }
}

impl RunOptions {
    pub fn from_config(pipeline: &PipelineConfig, publish: &PublishConfig) -> Self {
        Self {
            max_sections: pipeline.max_sections,
            max_concurrency: pipeline.max_concurrency,
            planner_attempts: pipeline.planner_attempts,
            min_search_results: pipeline.min_search_results,
            review_enabled: pipeline.review_enabled,
            summary_enabled: pipeline.summary_enabled,
            source_language: pipeline.source_language.clone(),
            translation_concurrency: pipeline.translation_concurrency,
            output_dir: publish.output_dir.clone(),
            formats: publish.formats.clone(),
        }
    }

    /// Clamp values that would stall the pipeline.
    pub fn normalized(mut self) -> Self {
        self.max_sections = self.max_sections.max(1);
        self.max_concurrency = self.max_concurrency.max(1);
        self.planner_attempts = self.planner_attempts.max(1);
        self.translation_concurrency = self.translation_concurrency.max(1);
        let source = self.source_language.trim();
        self.source_language = if is_language_tag(source) {
            source.to_string()
        } else {
            "en".to_string()
        };
        self
    }

    /// Whether a run targeting `language` needs the translator.
    pub fn needs_translation(&self, language: &str) -> bool {
        let language = language.trim();
        !language.is_empty() && !language.eq_ignore_ascii_case(self.source_language.trim())
    }
}

impl DossierConfig {
    pub fn run_options(&self) -> RunOptions {
        RunOptions::from_config(&self.pipeline, &self.publish).normalized()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.providers.validate()?;
        if self.pipeline.max_sections == 0 {
            return Err(ConfigError::Invalid {
                message: "pipeline.max_sections must be at least 1".to_string(),
            });
        }
        if !is_language_tag(self.pipeline.source_language.trim()) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "pipeline.source_language: '{}' is not a language tag",
                    self.pipeline.source_language
                ),
            });
        }
        if self.pipeline.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                message: "pipeline.max_concurrency must be at least 1".to_string(),
            });
        }
        for format in &self.publish.formats {
            if !matches!(format.as_str(), "pdf" | "docx") {
                return Err(ConfigError::Invalid {
                    message: format!("publish.formats: unsupported format '{format}'"),
                });
            }
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DOSSIER_`)
/// 3. Explicit config file (`--config`)
/// 4. Workspace-local config (`.dossier/config.toml`)
/// 5. User config (`~/.config/dossier/config.toml`)
/// 6. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    explicit_file: Option<&Path>,
    overrides: Option<&DossierConfig>,
) -> Result<DossierConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(DossierConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "dossier", "dossier") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".dossier").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // DOSSIER_PIPELINE__MAX_SECTIONS, DOSSIER_GATEWAY__PORT, etc.
    figment = figment.merge(Env::prefixed("DOSSIER_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: DossierConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}
