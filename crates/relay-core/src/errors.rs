/// Typed error hierarchy for broker operations.
///
/// Everything here is local to one operation: errors are returned or logged,
/// never escalated into a process failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayError {
    // Caller-correctable
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),
    #[error("function not found: {0}")]
    FunctionNotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Retry later
    #[error("function {0} is not active")]
    FunctionUnavailable(String),
    #[error("connection queue full: {0}")]
    QueueFull(String),

    // Operational, best-effort
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl RelayError {
    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionNotFound(_) => "connection_not_found",
            Self::FunctionNotFound(_) => "function_not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::FunctionUnavailable(_) => "function_unavailable",
            Self::QueueFull(_) => "queue_full",
            Self::Transport(_) => "transport_failure",
            Self::Persistence(_) => "persistence_failure",
        }
    }

    /// Whether the caller can fix the request and retry immediately.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionNotFound(_) | Self::FunctionNotFound(_) | Self::InvalidInput(_)
        )
    }
}
