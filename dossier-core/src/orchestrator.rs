//! Pipeline orchestrator: drives the stage graph over one research state.
//!
//! The graph is a transition function keyed by [`StageKind`]. Stages run one
//! at a time except the researcher, which is fanned out across the plan with
//! at most `max_concurrency` sections in flight. The orchestrator is the only
//! place a [`StateDelta`] is merged; after every stage it records a draft,
//! publishes progress events and pushes the merged state to any observer.

use crate::config::RunOptions;
use crate::drafts::{DraftRecord, DraftStore};
use crate::error::{DossierError, DraftError};
use crate::events::{EventBus, ProgressEvent, StageStatus};
use crate::providers::FailoverCoordinator;
use crate::stages::{Stage, StageContext, StageFailure, StageKind, StageSet};
use crate::state::{ResearchState, SectionResult, StageErrorRecord, StateDelta};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where the graph goes after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Stage(StageKind),
    End,
    Failed,
}

fn translator_or_publisher(state: &ResearchState, options: &RunOptions) -> Next {
    if options.needs_translation(&state.target_language) {
        Next::Stage(StageKind::Translator)
    } else {
        Next::Stage(StageKind::Publisher)
    }
}

/// The stage graph.
pub fn transition(from: StageKind, state: &ResearchState, options: &RunOptions) -> Next {
    match from {
        StageKind::Planner if state.plan.is_empty() => Next::Failed,
        StageKind::Planner => Next::Stage(StageKind::Researcher),
        StageKind::Researcher => Next::Stage(StageKind::Writer),
        StageKind::Writer if options.review_enabled => Next::Stage(StageKind::Reviewer),
        StageKind::Writer => translator_or_publisher(state, options),
        StageKind::Reviewer if state.review_notes.as_ref().is_some_and(|n| !n.is_empty()) => {
            Next::Stage(StageKind::Reviser)
        }
        StageKind::Reviewer | StageKind::Reviser => translator_or_publisher(state, options),
        StageKind::Translator => Next::Stage(StageKind::Publisher),
        StageKind::Publisher => Next::End,
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTerminal {
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunTerminal::Completed => "completed",
            RunTerminal::Failed => "failed",
            RunTerminal::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub terminal: RunTerminal,
    /// Same as `state.errors`.
    pub errors: Vec<StageErrorRecord>,
    pub state: ResearchState,
}

impl RunOutcome {
    fn new(run_id: Uuid, terminal: RunTerminal, state: ResearchState) -> Self {
        Self {
            run_id,
            terminal,
            errors: state.errors.clone(),
            state,
        }
    }
}

/// Per-run inputs besides the state.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub options: Arc<RunOptions>,
    pub cancel: CancellationToken,
    /// Receives the merged state after every stage.
    pub observer: Option<watch::Sender<ResearchState>>,
}

impl RunContext {
    pub fn new(run_id: Uuid, options: RunOptions) -> Self {
        Self {
            run_id,
            options: Arc::new(options.normalized()),
            cancel: CancellationToken::new(),
            observer: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: watch::Sender<ResearchState>) -> Self {
        self.observer = Some(observer);
        self
    }
}

pub struct Orchestrator {
    coordinator: Arc<FailoverCoordinator>,
    stages: StageSet,
    drafts: DraftStore,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("drafts", &self.drafts.root())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(coordinator: Arc<FailoverCoordinator>, drafts: DraftStore) -> Self {
        Self {
            coordinator,
            stages: StageSet::default(),
            drafts,
            events: Arc::new(EventBus::default()),
        }
    }

    pub fn with_stages(mut self, stages: StageSet) -> Self {
        self.stages = stages;
        self
    }

    pub fn coordinator(&self) -> &Arc<FailoverCoordinator> {
        &self.coordinator
    }

    pub fn drafts(&self) -> &DraftStore {
        &self.drafts
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run the whole graph from the planner.
    pub async fn run(
        &self,
        run: RunContext,
        initial: ResearchState,
    ) -> Result<RunOutcome, DossierError> {
        info!(
            run_id = %run.run_id,
            query = %initial.query,
            target_language = %initial.target_language,
            "Starting research run"
        );
        self.drive(&run, initial, StageKind::Planner).await
    }

    /// Continue a run from its latest draft.
    ///
    /// A run whose latest draft is terminal is returned as it is.
    pub async fn resume(&self, run: RunContext) -> Result<RunOutcome, DossierError> {
        let (record, state) = self.drafts.load_latest(run.run_id)?;
        if let Some(observer) = &run.observer {
            observer.send_replace(state.clone());
        }
        if state.has_fatal_error() {
            return Ok(RunOutcome::new(run.run_id, RunTerminal::Failed, state));
        }
        let last: StageKind = record
            .stage_name
            .parse()
            .map_err(|message| DraftError::Persistence { message })?;

        match transition(last, &state, &run.options) {
            Next::Stage(next) => {
                info!(
                    run_id = %run.run_id,
                    after = %last,
                    next = %next,
                    sequence = record.sequence_number,
                    "Resuming research run"
                );
                self.drive(&run, state, next).await
            }
            Next::End => Ok(RunOutcome::new(run.run_id, RunTerminal::Completed, state)),
            Next::Failed => Ok(RunOutcome::new(run.run_id, RunTerminal::Failed, state)),
        }
    }

    async fn drive(
        &self,
        run: &RunContext,
        mut state: ResearchState,
        start: StageKind,
    ) -> Result<RunOutcome, DossierError> {
        let ctx = StageContext::new(
            run.run_id,
            self.coordinator.clone(),
            run.options.clone(),
            run.cancel.clone(),
        );
        let mut current = start;
        self.events.emit(run.run_id, current, StageStatus::Pending);

        loop {
            if run.cancel.is_cancelled() {
                return Ok(self.cancelled(run, current, state));
            }

            self.events.emit(run.run_id, current, StageStatus::Running);
            debug!(run_id = %run.run_id, stage = %current, "Stage started");

            let result = if current == StageKind::Researcher {
                Ok(self.research(&state, &ctx).await)
            } else {
                self.stages.get(current).execute(&state, &ctx).await
            };

            if run.cancel.is_cancelled() {
                return Ok(self.cancelled(run, current, state));
            }

            match result {
                Ok(delta) => state.apply(&delta),
                Err(StageFailure::Fatal(message)) => {
                    error!(run_id = %run.run_id, stage = %current, error = %message, "Stage failed");
                    state.apply(
                        &StateDelta::new().with_error(StageErrorRecord::fatal(current, &message)),
                    );
                    self.checkpoint(run, current, &state)?;
                    self.events.publish(
                        ProgressEvent::new(run.run_id, current, StageStatus::Error)
                            .with_message(message),
                    );
                    return Ok(RunOutcome::new(run.run_id, RunTerminal::Failed, state));
                }
                Err(StageFailure::Recoverable(message)) => {
                    warn!(run_id = %run.run_id, stage = %current, error = %message, "Stage failed, continuing");
                    state.apply(
                        &StateDelta::new().with_error(StageErrorRecord::warning(current, message)),
                    );
                }
            }

            self.checkpoint(run, current, &state)?;
            self.events.emit(run.run_id, current, StageStatus::Completed);
            info!(run_id = %run.run_id, stage = %current, errors = state.errors.len(), "Stage completed");

            match transition(current, &state, &run.options) {
                Next::Stage(next) => {
                    self.events.emit(run.run_id, next, StageStatus::Pending);
                    current = next;
                }
                Next::End => {
                    info!(run_id = %run.run_id, "Research run completed");
                    return Ok(RunOutcome::new(run.run_id, RunTerminal::Completed, state));
                }
                Next::Failed => {
                    let message = format!("{current} left the run with nothing to continue from");
                    error!(run_id = %run.run_id, stage = %current, "{message}");
                    state.apply(
                        &StateDelta::new().with_error(StageErrorRecord::fatal(current, &message)),
                    );
                    self.checkpoint(run, current, &state)?;
                    self.events.publish(
                        ProgressEvent::new(run.run_id, current, StageStatus::Error)
                            .with_message(message),
                    );
                    return Ok(RunOutcome::new(run.run_id, RunTerminal::Failed, state));
                }
            }
        }
    }

    fn checkpoint(
        &self,
        run: &RunContext,
        stage: StageKind,
        state: &ResearchState,
    ) -> Result<DraftRecord, DossierError> {
        let record = self.drafts.record(run.run_id, stage.as_str(), state)?;
        if let Some(observer) = &run.observer {
            observer.send_replace(state.clone());
        }
        Ok(record)
    }

    fn cancelled(&self, run: &RunContext, stage: StageKind, state: ResearchState) -> RunOutcome {
        info!(run_id = %run.run_id, stage = %stage, "Research run cancelled");
        self.events.publish(
            ProgressEvent::new(run.run_id, stage, StageStatus::Error).with_message("cancelled"),
        );
        RunOutcome::new(run.run_id, RunTerminal::Cancelled, state)
    }

    /// Fan the researcher out over the plan and merge the results in section
    /// order. A failed section becomes an empty placeholder plus a section
    /// error; it never fails the stage.
    async fn research(&self, state: &ResearchState, ctx: &StageContext) -> StateDelta {
        let snapshot = Arc::new(state.clone());
        let semaphore = Arc::new(Semaphore::new(ctx.options.max_concurrency.max(1)));
        let stage: Arc<dyn Stage> = self.stages.get(StageKind::Researcher).clone();

        let mut handles = Vec::with_capacity(snapshot.plan.len());
        for index in 0..snapshot.plan.len() {
            let snapshot = snapshot.clone();
            let semaphore = semaphore.clone();
            let stage = stage.clone();
            let section_ctx = ctx.for_section(index);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Err(StageFailure::Recoverable("research pool closed".into()));
                };
                stage.execute(&snapshot, &section_ctx).await
            }));
        }

        let mut merged = StateDelta::new();
        for (index, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap_or_else(|e| {
                Err(StageFailure::Recoverable(format!("research task aborted: {e}")))
            });
            match result {
                Ok(delta) => {
                    let mut found = false;
                    for (i, section) in delta.section_results.into_iter().flatten() {
                        found |= i == index;
                        merged = merged.with_section(i, section);
                    }
                    if !found {
                        merged = merged.with_section(index, SectionResult::empty());
                    }
                    for err in delta.errors {
                        merged = merged.with_error(err);
                    }
                }
                Err(failure) => {
                    warn!(
                        run_id = %ctx.run_id,
                        section = index,
                        error = %failure.message(),
                        "Section failed"
                    );
                    merged = merged
                        .with_section(index, SectionResult::empty())
                        .with_error(StageErrorRecord::section(
                            StageKind::Researcher,
                            index,
                            failure.message(),
                        ));
                }
            }
        }
        merged
    }
}
