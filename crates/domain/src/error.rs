/// Shared error type used across all ACF crates.
///
/// The variants mirror the fabric's failure taxonomy: admission and lock
/// failures are recoverable (the caller retries or queues), turn-state
/// violations are programming errors surfaced loudly, and persistence
/// failures are retried by the workflow driver.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock failed for session {0}")]
    LockFailed(String),

    #[error("mutex lost mid-turn for session {0}: fencing token no longer current")]
    MutexLost(String),

    #[error("accumulation aborted: {0}")]
    AccumulationAborted(String),

    #[error("supersede rejected: {0}")]
    SupersedeRejected(String),

    #[error("brain failure: {0}")]
    BrainFailure(String),

    #[error("tool failure: {tool_name}: {message}")]
    ToolFailure { tool_name: String, message: String },

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("invalid turn transition: {0}")]
    TurnState(String),

    #[error("turn {0} is terminal")]
    TurnTerminal(uuid::Uuid),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the workflow driver should retry the step that produced
    /// this error.  Only transient store failures qualify; state
    /// violations and lost fencing tokens must abort.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::PersistenceFailure(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
