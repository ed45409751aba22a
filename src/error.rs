//! Unified error type.

use http::StatusCode;

use crate::scope::CancelError;

/// The error type returned by middleware, handlers, and sprocket's own
/// fallible operations.
///
/// A middleware that returns `Err` halts the chain. The pipeline turns the
/// error into a response with the status from [`Error::status`] and the
/// error text as a `text/plain` body, then still runs the after-hooks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// [`Context::any`](crate::Context::any) on a key with no stored value
    /// and no factory.
    #[error("[App] non-existent key")]
    NonExistentKey,

    /// A factory looked up its own key while building it.
    #[error("[App] key looked up from inside its own factory")]
    ReentrantKey,

    #[error("invalid route `{pattern}`: {reason}")]
    Route { pattern: String, reason: String },

    /// An error that carries its own HTTP status.
    #[error("{message}")]
    Http { status: StatusCode, message: String },

    #[error(transparent)]
    Canceled(#[from] CancelError),

    #[error("middleware panicked: {0}")]
    Panic(String),

    /// An after-hook was registered on a context that already ended.
    #[error("context already ended")]
    Ended,

    #[error("{0}")]
    Message(String),
}

impl Error {
    /// An error answered with `status` and `message` as the body.
    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Http { status, message: message.into() }
    }

    /// A plain error answered with `500 Internal Server Error`.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub(crate) fn not_found(path: &str) -> Self {
        Self::http(StatusCode::NOT_FOUND, format!("no route for {path}"))
    }

    /// The status the pipeline responds with when a middleware fails with
    /// this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Http { status, .. } => *status,
            Self::Canceled(CancelError::DeadlineExceeded) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
