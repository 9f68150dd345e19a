//! Named backends, keyed by the `id` used in the provider configuration.

use super::openai_compat::OpenAiCompatibleBackend;
use super::searxng::SearxngBackend;
use super::translate::LlmTranslateBackend;
use super::{LlmBackend, SearchBackend, TranslateBackend};
use crate::config::{BackendConfig, ProviderConfig};
use crate::error::ConfigError;
use std::collections::HashMap;
use std::sync::Arc;

/// Backends available to a [`FailoverCoordinator`](super::FailoverCoordinator).
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    llm: HashMap<String, Arc<dyn LlmBackend>>,
    search: HashMap<String, Arc<dyn SearchBackend>>,
    translation: HashMap<String, Arc<dyn TranslateBackend>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut llm: Vec<_> = self.llm.keys().collect();
        let mut search: Vec<_> = self.search.keys().collect();
        let mut translation: Vec<_> = self.translation.keys().collect();
        llm.sort();
        search.sort();
        translation.sort();
        f.debug_struct("ProviderRegistry")
            .field("llm", &llm)
            .field("search", &search)
            .field("translation", &translation)
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the concrete backends named in `config`.
    ///
    /// Supported kinds:
    /// - `llm`: `openai_compat`
    /// - `search`: `searxng`
    /// - `translation`: `openai_compat` (an LLM prompted to translate)
    ///
    /// Credentials are resolved per call, so a missing API key surfaces as an
    /// authentication error at run time rather than here.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let mut registry = Self::new();

        for backend in &config.llm.backends {
            match backend.kind.as_str() {
                "openai_compat" => {
                    registry.register_llm(Arc::new(OpenAiCompatibleBackend::from_config(backend)?));
                }
                other => return Err(unsupported("llm", other)),
            }
        }

        for backend in &config.search.backends {
            match backend.kind.as_str() {
                "searxng" => {
                    registry.register_search(Arc::new(SearxngBackend::from_config(backend)?));
                }
                other => return Err(unsupported("search", other)),
            }
        }

        for backend in &config.translation.backends {
            registry.register_translation(translation_backend(backend)?);
        }

        Ok(registry)
    }

    pub fn register_llm(&mut self, backend: Arc<dyn LlmBackend>) -> &mut Self {
        self.llm.insert(backend.id().to_string(), backend);
        self
    }

    pub fn register_search(&mut self, backend: Arc<dyn SearchBackend>) -> &mut Self {
        self.search.insert(backend.id().to_string(), backend);
        self
    }

    pub fn register_translation(&mut self, backend: Arc<dyn TranslateBackend>) -> &mut Self {
        self.translation.insert(backend.id().to_string(), backend);
        self
    }

    pub fn with_llm(mut self, backend: Arc<dyn LlmBackend>) -> Self {
        self.register_llm(backend);
        self
    }

    pub fn with_search(mut self, backend: Arc<dyn SearchBackend>) -> Self {
        self.register_search(backend);
        self
    }

    pub fn with_translation(mut self, backend: Arc<dyn TranslateBackend>) -> Self {
        self.register_translation(backend);
        self
    }

    pub fn llm(&self, id: &str) -> Option<Arc<dyn LlmBackend>> {
        self.llm.get(id).cloned()
    }

    pub fn search(&self, id: &str) -> Option<Arc<dyn SearchBackend>> {
        self.search.get(id).cloned()
    }

    pub fn translation(&self, id: &str) -> Option<Arc<dyn TranslateBackend>> {
        self.translation.get(id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.llm.is_empty() && self.search.is_empty() && self.translation.is_empty()
    }
}

fn translation_backend(backend: &BackendConfig) -> Result<Arc<dyn TranslateBackend>, ConfigError> {
    match backend.kind.as_str() {
        "openai_compat" => {
            let llm = Arc::new(OpenAiCompatibleBackend::from_config(backend)?);
            Ok(Arc::new(LlmTranslateBackend::new(backend.id.clone(), llm)))
        }
        other => Err(unsupported("translation", other)),
    }
}

fn unsupported(role: &str, kind: &str) -> ConfigError {
    ConfigError::UnsupportedKind {
        role: role.to_string(),
        kind: kind.to_string(),
    }
}
