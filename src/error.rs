use thiserror::Error;

/// Errors surfaced by the control surface and the model/geometry builders.
///
/// Invariant violations inside the event loop are bugs, not errors; they are
/// checked with `debug_assert!` and never reach callers in release builds.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

pub type SimResult<T> = Result<T, SimError>;

impl SimError {
    pub(crate) fn arg(message: impl Into<String>) -> Self {
        SimError::InvalidArgument(message.into())
    }
}
