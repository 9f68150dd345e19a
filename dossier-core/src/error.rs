//! Error types for the Dossier core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering provider calls, configuration, the draft store, and run management.

use std::path::PathBuf;
use uuid::Uuid;

/// Top-level error type for the Dossier core library.
#[derive(Debug, thiserror::Error)]
pub enum DossierError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Draft store error: {0}")]
    Draft(#[from] DraftError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the failover coordinator and the backends behind it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Authentication failed for backend '{backend}'")]
    Authentication { backend: String },

    #[error("Backend '{backend}' rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        backend: String,
        retry_after_secs: u64,
    },

    #[error("Backend '{backend}' timed out after {timeout_secs}s")]
    Timeout { backend: String, timeout_secs: u64 },

    #[error("Transient network error from backend '{backend}': {message}")]
    TransientNetwork { backend: String, message: String },

    #[error("Invalid response from backend '{backend}': {message}")]
    InvalidResponse { backend: String, message: String },

    #[error("All backends for role '{role}' exhausted after {} attempt(s): {}", .chain.len(), summarize_chain(.chain))]
    AllBackendsExhausted {
        role: String,
        chain: Vec<ProviderError>,
    },

    #[error("No backends configured for role '{role}'")]
    RoleNotConfigured { role: String },

    #[error("Request of kind '{request}' cannot be served by role '{role}'")]
    RequestMismatch { role: String, request: String },

    #[error("Provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether the same backend may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::TransientNetwork { .. }
        )
    }

    /// Whether `fallback_on_error` may move on to the next backend.
    pub fn allows_fallback(&self) -> bool {
        !matches!(
            self,
            ProviderError::Authentication { .. } | ProviderError::Cancelled
        )
    }

    /// The backend identifier this error originated from, if any.
    pub fn backend(&self) -> Option<&str> {
        match self {
            ProviderError::Authentication { backend }
            | ProviderError::RateLimited { backend, .. }
            | ProviderError::Timeout { backend, .. }
            | ProviderError::TransientNetwork { backend, .. }
            | ProviderError::InvalidResponse { backend, .. } => Some(backend),
            _ => None,
        }
    }
}

fn summarize_chain(chain: &[ProviderError]) -> String {
    chain
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Backend '{backend}' configured for role '{role}' is not registered")]
    UnregisteredBackend { role: String, backend: String },

    #[error("Unsupported backend kind '{kind}' for role '{role}'")]
    UnsupportedKind { role: String, kind: String },
}

/// Errors from the draft store.
#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    #[error("No drafts recorded for run {run_id}")]
    NoDrafts { run_id: Uuid },

    #[error("Snapshot file missing: {path}")]
    SnapshotMissing { path: PathBuf },

    #[error("Draft persistence error: {message}")]
    Persistence { message: String },
}

impl From<std::io::Error> for DraftError {
    fn from(err: std::io::Error) -> Self {
        DraftError::Persistence {
            message: err.to_string(),
        }
    }
}

/// Errors from the run manager.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Run not found: {run_id}")]
    NotFound { run_id: Uuid },

    #[error("Run {run_id} has already finished")]
    AlreadyFinished { run_id: Uuid },

    #[error("Run {run_id} is still active")]
    StillActive { run_id: Uuid },

    #[error("Run task for {run_id} aborted: {message}")]
    TaskAborted { run_id: Uuid, message: String },

    #[error("Invalid run request: {message}")]
    InvalidRequest { message: String },

    #[error("Draft store error: {0}")]
    Draft(#[from] DraftError),
}

/// A type alias for results using the top-level `DossierError`.
pub type Result<T> = std::result::Result<T, DossierError>;
