use interceptor_core::InterceptorError;
use thiserror::Error;

/// Errors surfaced by the agent binary
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Interceptor(#[from] InterceptorError),
    /// Logging setup errors
    #[error("Logging error: {0}")]
    Logging(String),
    /// Invalid command line or config file
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
