//! Scripted in-memory backends for tests and offline runs.
//!
//! Each backend answers through a responder closure, optionally after a
//! per-call latency, and records how often and with what input it was
//! called.

use super::{
    FailoverCoordinator, LlmBackend, LlmParams, ProviderRegistry, SearchBackend, SearchHit,
    SearchParams, TranslateBackend,
};
use crate::config::{BackendConfig, FailoverStrategy, ProviderConfig, RetryConfig, RoleConfig};
use crate::error::{ConfigError, ProviderError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type LatencyFn = Box<dyn Fn(&str) -> Duration + Send + Sync>;
type LlmResponder = Box<dyn Fn(&str, &LlmParams) -> Result<String, ProviderError> + Send + Sync>;
type SearchResponder =
    Box<dyn Fn(&str, &SearchParams) -> Result<Vec<SearchHit>, ProviderError> + Send + Sync>;
type TranslateResponder = Box<dyn Fn(&str, &str) -> Result<String, ProviderError> + Send + Sync>;

/// Inputs seen by a scripted backend plus its latency model.
#[derive(Default)]
struct CallLog {
    calls: AtomicUsize,
    inputs: Mutex<Vec<String>>,
    latency: Option<LatencyFn>,
}

impl CallLog {
    async fn enter(&self, input: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(input.to_string());
        if let Some(latency) = &self.latency {
            let delay = latency(input);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn inputs(&self) -> Vec<String> {
        self.inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Responder that replays `responses` in order and then repeats the last one.
fn sequence<T: Clone + Send + 'static>(
    responses: Vec<Result<T, ProviderError>>,
) -> impl Fn() -> Result<T, ProviderError> + Send + Sync {
    let queue = Mutex::new(VecDeque::from(responses));
    move || {
        let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() > 1 {
            queue.pop_front().unwrap_or_else(|| Err(ProviderError::Cancelled))
        } else {
            queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(ProviderError::Cancelled))
        }
    }
}

/// A scripted [`LlmBackend`].
pub struct ScriptedLlm {
    id: String,
    responder: LlmResponder,
    log: CallLog,
}

impl ScriptedLlm {
    pub fn new(
        id: impl Into<String>,
        responder: impl Fn(&str, &LlmParams) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            responder: Box::new(responder),
            log: CallLog::default(),
        }
    }

    /// Always answers with `text`.
    pub fn always(id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(id, move |_, _| Ok(text.clone()))
    }

    /// Always fails with `error`.
    pub fn failing(id: impl Into<String>, error: ProviderError) -> Self {
        Self::new(id, move |_, _| Err(error.clone()))
    }

    /// Replays `responses` in order, repeating the last one.
    pub fn sequence(id: impl Into<String>, responses: Vec<Result<String, ProviderError>>) -> Self {
        let next = sequence(responses);
        Self::new(id, move |_, _| next())
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_latency(move |_| delay)
    }

    /// Delay each call by a duration derived from its prompt.
    pub fn with_latency(mut self, latency: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.log.latency = Some(Box::new(latency));
        self
    }

    pub fn calls(&self) -> usize {
        self.log.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.log.inputs()
    }
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, prompt: &str, params: &LlmParams) -> Result<String, ProviderError> {
        self.log.enter(prompt).await;
        (self.responder)(prompt, params)
    }
}

/// A scripted [`SearchBackend`].
pub struct ScriptedSearch {
    id: String,
    responder: SearchResponder,
    log: CallLog,
}

impl ScriptedSearch {
    pub fn new(
        id: impl Into<String>,
        responder: impl Fn(&str, &SearchParams) -> Result<Vec<SearchHit>, ProviderError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            responder: Box::new(responder),
            log: CallLog::default(),
        }
    }

    /// Returns the same hits for every query, capped at `max_results`.
    pub fn with_hits(id: impl Into<String>, hits: Vec<SearchHit>) -> Self {
        Self::new(id, move |_, params| {
            Ok(hits.iter().take(params.max_results).cloned().collect())
        })
    }

    pub fn failing(id: impl Into<String>, error: ProviderError) -> Self {
        Self::new(id, move |_, _| Err(error.clone()))
    }

    pub fn sequence(
        id: impl Into<String>,
        responses: Vec<Result<Vec<SearchHit>, ProviderError>>,
    ) -> Self {
        let next = sequence(responses);
        Self::new(id, move |_, _| next())
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_latency(move |_| delay)
    }

    /// Delay each call by a duration derived from its query.
    pub fn with_latency(mut self, latency: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.log.latency = Some(Box::new(latency));
        self
    }

    pub fn calls(&self) -> usize {
        self.log.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.log.inputs()
    }
}

#[async_trait]
impl SearchBackend for ScriptedSearch {
    fn id(&self) -> &str {
        &self.id
    }

    async fn search(
        &self,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        self.log.enter(query).await;
        (self.responder)(query, params)
    }
}

/// A scripted [`TranslateBackend`].
pub struct ScriptedTranslate {
    id: String,
    responder: TranslateResponder,
    log: CallLog,
}

impl ScriptedTranslate {
    pub fn new(
        id: impl Into<String>,
        responder: impl Fn(&str, &str) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            responder: Box::new(responder),
            log: CallLog::default(),
        }
    }

    /// Returns every segment unchanged.
    pub fn echo(id: impl Into<String>) -> Self {
        Self::new(id, |segment, _| Ok(segment.to_string()))
    }

    /// Prefixes every segment with `[lang]`, leaving placeholders intact.
    pub fn tagging(id: impl Into<String>) -> Self {
        Self::new(id, |segment, lang| Ok(format!("[{lang}] {segment}")))
    }

    pub fn failing(id: impl Into<String>, error: ProviderError) -> Self {
        Self::new(id, move |_, _| Err(error.clone()))
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_latency(move |_| delay)
    }

    pub fn with_latency(mut self, latency: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.log.latency = Some(Box::new(latency));
        self
    }

    pub fn calls(&self) -> usize {
        self.log.calls.load(Ordering::SeqCst)
    }

    pub fn segments(&self) -> Vec<String> {
        self.log.inputs()
    }
}

#[async_trait]
impl TranslateBackend for ScriptedTranslate {
    fn id(&self) -> &str {
        &self.id
    }

    async fn translate(&self, segment: &str, target_lang: &str) -> Result<String, ProviderError> {
        self.log.enter(segment).await;
        (self.responder)(segment, target_lang)
    }
}

/// A coordinator with one scripted backend per role and no retries.
pub fn scripted_coordinator(
    llm: Arc<ScriptedLlm>,
    search: Arc<ScriptedSearch>,
    translation: Arc<ScriptedTranslate>,
) -> Result<FailoverCoordinator, ConfigError> {
    let role = |id: &str| {
        RoleConfig::new(
            FailoverStrategy::FallbackOnError,
            vec![BackendConfig::new(id, "mock")],
        )
    };
    let config = ProviderConfig {
        llm: role(&llm.id),
        search: role(&search.id),
        translation: role(&translation.id),
        retry: RetryConfig::none(),
    };
    let registry = ProviderRegistry::new()
        .with_llm(llm)
        .with_search(search)
        .with_translation(translation);
    FailoverCoordinator::new(Arc::new(config), &registry)
}
