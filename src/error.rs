use thiserror::Error;

/// Errors surfaced by agent operations.
///
/// Terminal job and kernel failures are recorded on the entity itself
/// (status plus error message); this enum covers failures of the call at
/// hand.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Gateway connection error: {0}")]
    Connection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Agent already running: {0}")]
    AlreadyRunning(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
