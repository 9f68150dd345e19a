//! Run manager: concurrent research runs over one shared orchestrator.
//!
//! Each run executes on its own tokio task. The manager keeps, per run, a
//! watch of the latest merged state, a watch of the outcome and the run's
//! cancellation token. Runs that only exist on disk (from an earlier process)
//! are still visible through the draft store and can be resumed.
//!
//! Only the newest finished runs stay in memory; older ones are evicted
//! together with their event replay log and are served from disk.

use crate::config::{RunOptions, is_language_tag};
use crate::drafts::{DraftRecord, DraftStore};
use crate::error::{DraftError, RunError};
use crate::events::EventBus;
use crate::orchestrator::{Orchestrator, RunContext, RunOutcome, RunTerminal};
use crate::stages::StageKind;
use crate::state::{ResearchState, Tone};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Inputs of a new run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub query: String,
    #[serde(default)]
    pub tone: Tone,
    /// Defaults to the configured source language (no translation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    #[serde(default)]
    pub guidelines: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sections: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formats: Option<Vec<String>>,
}

impl RunRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            tone: Tone::default(),
            target_language: None,
            guidelines: Vec::new(),
            max_sections: None,
            review_enabled: None,
            formats: None,
        }
    }

    pub fn with_tone(mut self, tone: Tone) -> Self {
        self.tone = tone;
        self
    }

    pub fn with_target_language(mut self, lang: impl Into<String>) -> Self {
        self.target_language = Some(lang.into());
        self
    }

    pub fn with_guidelines(mut self, guidelines: Vec<String>) -> Self {
        self.guidelines = guidelines;
        self
    }

    pub fn with_max_sections(mut self, max_sections: usize) -> Self {
        self.max_sections = Some(max_sections);
        self
    }

    pub fn with_review(mut self, enabled: bool) -> Self {
        self.review_enabled = Some(enabled);
        self
    }

    pub fn with_formats(mut self, formats: Vec<String>) -> Self {
        self.formats = Some(formats);
        self
    }

    pub fn validate(&self) -> Result<(), RunError> {
        if self.query.trim().is_empty() {
            return Err(RunError::InvalidRequest {
                message: "query must not be empty".into(),
            });
        }
        if self.max_sections == Some(0) {
            return Err(RunError::InvalidRequest {
                message: "max_sections must be at least 1".into(),
            });
        }
        if let Some(lang) = &self.target_language {
            let lang = lang.trim();
            if !lang.is_empty() && !is_language_tag(lang) {
                return Err(RunError::InvalidRequest {
                    message: format!("target_language '{lang}' is not a language tag"),
                });
            }
        }
        Ok(())
    }

    /// Apply this request's overrides to `base`.
    pub fn options(&self, base: &RunOptions) -> RunOptions {
        let mut options = base.clone();
        if let Some(max_sections) = self.max_sections {
            options.max_sections = max_sections;
        }
        if let Some(review) = self.review_enabled {
            options.review_enabled = review;
        }
        if let Some(formats) = &self.formats {
            options.formats = formats.clone();
        }
        options.normalized()
    }

    pub fn initial_state(&self, options: &RunOptions) -> ResearchState {
        let lang = self
            .target_language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(&options.source_language);
        ResearchState::new(
            self.query.trim(),
            self.tone,
            lang,
            self.guidelines.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Found on disk without a terminal draft; can be resumed.
    Interrupted,
}

impl From<RunTerminal> for RunStatus {
    fn from(terminal: RunTerminal) -> Self {
        match terminal {
            RunTerminal::Completed => RunStatus::Completed,
            RunTerminal::Failed => RunStatus::Failed,
            RunTerminal::Cancelled => RunStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// One line of [`RunManager::list_runs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub query: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

type OutcomeSlot = Option<Result<RunOutcome, String>>;

struct RunEntry {
    query: String,
    started_at: DateTime<Utc>,
    options: RunOptions,
    cancel: CancellationToken,
    state: watch::Receiver<ResearchState>,
    outcome: watch::Receiver<OutcomeSlot>,
}

impl RunEntry {
    fn status(&self) -> RunStatus {
        match &*self.outcome.borrow() {
            None => RunStatus::Running,
            Some(Ok(outcome)) => outcome.terminal.into(),
            Some(Err(_)) => RunStatus::Failed,
        }
    }
}

type RunMap = Arc<RwLock<HashMap<Uuid, RunEntry>>>;

/// Default number of finished runs kept in memory.
pub const DEFAULT_RETAINED_RUNS: usize = 64;

pub struct RunManager {
    orchestrator: Arc<Orchestrator>,
    defaults: RunOptions,
    runs: RunMap,
    retained: usize,
}

impl std::fmt::Debug for RunManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunManager")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl RunManager {
    pub fn new(orchestrator: Arc<Orchestrator>, defaults: RunOptions) -> Self {
        Self {
            orchestrator,
            defaults: defaults.normalized(),
            runs: Arc::new(RwLock::new(HashMap::new())),
            retained: DEFAULT_RETAINED_RUNS,
        }
    }

    /// Keep at most `retained` finished runs in memory.
    pub fn with_retained_runs(mut self, retained: usize) -> Self {
        self.retained = retained;
        self
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.orchestrator.events()
    }

    fn drafts(&self) -> &DraftStore {
        self.orchestrator.drafts()
    }

    /// Start a run in the background and return its id.
    pub async fn start_run(&self, request: RunRequest) -> Result<Uuid, RunError> {
        request.validate()?;
        let run_id = Uuid::new_v4();
        let options = request.options(&self.defaults);
        let initial = request.initial_state(&options);
        let query = initial.query.clone();

        let (state_tx, state_rx) = watch::channel(initial.clone());
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let ctx = RunContext::new(run_id, options.clone())
            .with_cancel(cancel.clone())
            .with_observer(state_tx);

        self.runs.write().await.insert(
            run_id,
            RunEntry {
                query: query.clone(),
                started_at: Utc::now(),
                options,
                cancel,
                state: state_rx,
                outcome: outcome_rx,
            },
        );

        let orchestrator = self.orchestrator.clone();
        let (runs, retained) = (self.runs.clone(), self.retained);
        tokio::spawn(
            async move {
                let result = orchestrator
                    .run(ctx, initial)
                    .await
                    .map_err(|e| e.to_string());
                if let Err(message) = &result {
                    warn!(run_id = %run_id, error = %message, "Run aborted");
                }
                outcome_tx.send_replace(Some(result));
                evict_finished(&runs, orchestrator.events(), run_id, retained).await;
            }
            .instrument(info_span!("run", run_id = %run_id)),
        );

        info!(run_id = %run_id, query = %query, "Run started");
        Ok(run_id)
    }

    /// Latest merged state of a run.
    pub async fn get_run_state(&self, run_id: Uuid) -> Result<ResearchState, RunError> {
        if let Some(entry) = self.runs.read().await.get(&run_id) {
            return Ok(entry.state.borrow().clone());
        }
        self.stored(run_id).map(|(_, state)| state)
    }

    fn stored(&self, run_id: Uuid) -> Result<(DraftRecord, ResearchState), RunError> {
        match self.drafts().load_latest(run_id) {
            Ok(found) => Ok(found),
            Err(DraftError::NoDrafts { .. }) => Err(RunError::NotFound { run_id }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn run_status(&self, run_id: Uuid) -> Result<RunStatus, RunError> {
        if let Some(entry) = self.runs.read().await.get(&run_id) {
            return Ok(entry.status());
        }
        self.stored_status(run_id)
    }

    fn stored_status(&self, run_id: Uuid) -> Result<RunStatus, RunError> {
        let (record, state) = self.stored(run_id)?;
        Ok(if state.has_fatal_error() {
            RunStatus::Failed
        } else if record.stage_name == StageKind::Publisher.as_str() {
            RunStatus::Completed
        } else {
            RunStatus::Interrupted
        })
    }

    /// Request cancellation. The run stops at its next suspension point.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<(), RunError> {
        let runs = self.runs.read().await;
        let entry = runs.get(&run_id).ok_or(RunError::NotFound { run_id })?;
        if entry.status() != RunStatus::Running {
            return Err(RunError::AlreadyFinished { run_id });
        }
        entry.cancel.cancel();
        info!(run_id = %run_id, "Run cancellation requested");
        Ok(())
    }

    /// Wait for a run to finish.
    pub async fn wait(&self, run_id: Uuid) -> Result<RunOutcome, RunError> {
        let mut outcome = {
            let runs = self.runs.read().await;
            runs.get(&run_id)
                .ok_or(RunError::NotFound { run_id })?
                .outcome
                .clone()
        };
        let slot = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RunError::TaskAborted {
                run_id,
                message: "run task ended without an outcome".into(),
            })?
            .clone();
        match slot {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(RunError::TaskAborted { run_id, message }),
            None => Err(RunError::TaskAborted {
                run_id,
                message: "run task ended without an outcome".into(),
            }),
        }
    }

    /// Continue a stopped run from its latest draft under the same id.
    pub async fn resume_run(&self, run_id: Uuid) -> Result<(), RunError> {
        let mut runs = self.runs.write().await;
        let options = match runs.get(&run_id) {
            Some(entry) if entry.status() == RunStatus::Running => {
                return Err(RunError::StillActive { run_id });
            }
            Some(entry) => entry.options.clone(),
            None => self.defaults.clone(),
        };
        let (_, state) = self.stored(run_id)?;

        let (state_tx, state_rx) = watch::channel(state.clone());
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let ctx = RunContext::new(run_id, options.clone())
            .with_cancel(cancel.clone())
            .with_observer(state_tx);
        runs.insert(
            run_id,
            RunEntry {
                query: state.query.clone(),
                started_at: Utc::now(),
                options,
                cancel,
                state: state_rx,
                outcome: outcome_rx,
            },
        );
        drop(runs);

        let orchestrator = self.orchestrator.clone();
        let (runs, retained) = (self.runs.clone(), self.retained);
        tokio::spawn(
            async move {
                let result = orchestrator.resume(ctx).await.map_err(|e| e.to_string());
                if let Err(message) = &result {
                    warn!(run_id = %run_id, error = %message, "Resumed run aborted");
                }
                outcome_tx.send_replace(Some(result));
                evict_finished(&runs, orchestrator.events(), run_id, retained).await;
            }
            .instrument(info_span!("run", run_id = %run_id)),
        );
        info!(run_id = %run_id, "Run resumed");
        Ok(())
    }

    /// Runs known in memory plus runs found in the draft store.
    pub async fn list_runs(&self) -> Vec<RunSummary> {
        let runs = self.runs.read().await;
        let mut out: Vec<RunSummary> = runs
            .iter()
            .map(|(id, entry)| RunSummary {
                run_id: *id,
                query: entry.query.clone(),
                status: entry.status(),
                started_at: Some(entry.started_at),
            })
            .collect();

        match self.drafts().runs() {
            Ok(stored) => {
                for run_id in stored.into_iter().filter(|id| !runs.contains_key(id)) {
                    let query = self
                        .drafts()
                        .load_latest(run_id)
                        .map(|(_, s)| s.query)
                        .unwrap_or_default();
                    if let Ok(status) = self.stored_status(run_id) {
                        out.push(RunSummary {
                            run_id,
                            query,
                            status,
                            started_at: None,
                        });
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not list stored runs"),
        }

        out.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.run_id.cmp(&b.run_id)));
        out
    }
}

/// Drop the oldest finished runs beyond `retained`, with their replay logs.
/// `current`, the run that just finished, is never dropped.
async fn evict_finished(
    runs: &RwLock<HashMap<Uuid, RunEntry>>,
    events: &EventBus,
    current: Uuid,
    retained: usize,
) {
    let mut runs = runs.write().await;
    let finished = runs
        .values()
        .filter(|entry| entry.status() != RunStatus::Running)
        .count();
    if finished <= retained {
        return;
    }
    let mut candidates: Vec<(DateTime<Utc>, Uuid)> = runs
        .iter()
        .filter(|(id, entry)| **id != current && entry.status() != RunStatus::Running)
        .map(|(id, entry)| (entry.started_at, *id))
        .collect();
    candidates.sort_unstable();
    for (_, run_id) in candidates.into_iter().take(finished - retained) {
        runs.remove(&run_id);
        events.forget(run_id);
        debug!(run_id = %run_id, "Evicted finished run from memory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        assert!(RunRequest::new("  ").validate().is_err());
        assert!(
            RunRequest::new("q")
                .with_max_sections(0)
                .validate()
                .is_err()
        );
        assert!(RunRequest::new("q").validate().is_ok());
    }

    #[test]
    fn test_target_language_must_be_a_tag() {
        for lang in ["/../../escaped", "de/../../x", "..", "de.md"] {
            let err = RunRequest::new("q")
                .with_target_language(lang)
                .validate()
                .unwrap_err();
            assert!(matches!(err, RunError::InvalidRequest { .. }), "{lang}");
        }
        for lang in ["de", " pt-BR ", ""] {
            assert!(
                RunRequest::new("q")
                    .with_target_language(lang)
                    .validate()
                    .is_ok(),
                "{lang}"
            );
        }
    }

    #[test]
    fn test_request_overrides_options() {
        let base = RunOptions::default();
        let options = RunRequest::new("q")
            .with_max_sections(2)
            .with_review(false)
            .options(&base);
        assert_eq!(options.max_sections, 2);
        assert!(!options.review_enabled);
        assert_eq!(options.max_concurrency, base.max_concurrency);
    }

    #[test]
    fn test_initial_state_defaults_language() {
        let options = RunOptions::default();
        let state = RunRequest::new(" energy ").initial_state(&options);
        assert_eq!(state.query, "energy");
        assert_eq!(state.target_language, options.source_language);
        let state = RunRequest::new("energy")
            .with_target_language("de")
            .initial_state(&options);
        assert_eq!(state.target_language, "de");
    }

    #[test]
    fn test_request_json_defaults() {
        let request: RunRequest = serde_json::from_str(r#"{"query":"energy"}"#).unwrap();
        assert_eq!(request, RunRequest::new("energy"));
    }
}
