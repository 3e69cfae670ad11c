use thiserror::Error;

/// Errors `Agent` returns to its caller. Provider and tool failures are not here:
/// they are recorded on the assistant message instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    /// A generation is already running for this session
    #[error("session {0} is busy")]
    Busy(String),
    #[error("nothing to summarize in session {0}")]
    EmptyHistory(String),
}
