//! Error types for ai-taskd.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Duplicate key: {entity} with id {id} already exists")]
    DuplicateKey { entity: String, id: String },

    #[error("Task {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },

    #[error("Task {id} was modified concurrently")]
    Conflict { id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether this error means the store itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub(crate) fn task_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "task".to_string(),
            id: id.into(),
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Errors that end a tool-execution session without a successful completion.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session ended after {turns} turns without complete_task")]
    BudgetExceeded { turns: u32 },

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Failure of a single backend call.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend {backend} failed: {reason}")]
    Execution { backend: String, reason: String },

    #[error("Backend {backend} timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("Backend {backend}: {source}")]
    Session {
        backend: String,
        #[source]
        source: SessionError,
    },
}

impl BackendError {
    pub fn execution(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Execution {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Terminal errors fail the task without trying the rest of the chain.
    ///
    /// A session that ran out of turns or could not commit has already touched
    /// the working tree; handing the task to another backend would start it
    /// from an unknown state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Session {
                source: SessionError::BudgetExceeded { .. } | SessionError::CommitFailed(_),
                ..
            }
        )
    }
}

/// Errors surfaced by the backend router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("No backends configured")]
    NoBackends,

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("All {attempts} backends failed; last error: {last_error}")]
    AllBackendsExhausted { attempts: usize, last_error: String },

    #[error("{0}")]
    Terminal(BackendError),
}

/// Worker lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Task store unavailable at startup: {0}")]
    StoreUnavailable(#[source] DatabaseError),

    #[error("Worker {id} cannot move from {from} to {to}")]
    InvalidState { id: String, from: String, to: String },
}
