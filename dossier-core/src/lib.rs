//! # Dossier Core
//!
//! Core library for Dossier, a multi-stage research pipeline.
//! Provides the stage graph orchestrator, the provider failover layer,
//! the pipeline stages, the versioned draft store, progress events, the run
//! manager with its HTTP gateway, and configuration.

pub mod config;
pub mod drafts;
pub mod error;
pub mod events;
pub mod gateway;
pub mod orchestrator;
pub mod persistence;
pub mod providers;
pub mod runs;
pub mod stages;
pub mod state;

// Re-export commonly used types at the crate root.
pub use config::{
    BackendConfig, DossierConfig, FailoverStrategy, ProviderConfig, RetryConfig, RoleConfig,
    RunOptions, load_config,
};
pub use drafts::{DraftRecord, DraftStore};
pub use error::{ConfigError, DossierError, DraftError, ProviderError, Result, RunError};
pub use events::{EventBus, ProgressEvent, StageStatus};
pub use orchestrator::{Next, Orchestrator, RunContext, RunOutcome, RunTerminal};
pub use providers::{
    FailoverCoordinator, LlmBackend, ProviderRegistry, Role, SearchBackend, SearchHit,
    TranslateBackend,
};
pub use runs::{RunManager, RunRequest, RunStatus, RunSummary};
pub use stages::{DocumentConverter, Stage, StageContext, StageFailure, StageKind, StageSet};
pub use state::{
    Citation, PlanEntry, ResearchState, ReviewNote, SectionResult, Severity, StageErrorRecord,
    StateDelta, Tone,
};
