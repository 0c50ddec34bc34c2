use thiserror::Error;

/// Errors surfaced synchronously to application code.
///
/// Transport and persistence failures never show up here: they are logged and
/// recovered from inside the delivery loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutpostError {
    #[error("queue `{name}` already exists")]
    DuplicateQueue { name: String },
    #[error("queue `{name}` does not exist")]
    UnknownQueue { name: String },
    #[error("outpost service is already running")]
    AlreadyStarted,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
