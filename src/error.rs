//! Error types shared across the engine.
//!
//! Handlers report failures with [`HandlerError`]. The handler lifecycle is the
//! only place that turns those into unavailability state; it reports back with
//! [`LifecycleError`]. Everything above it (dispatch engine, embedding facade)
//! surfaces [`EngineError`].

use std::sync::Arc;
use thiserror::Error;

/// Failures a handler may raise from `init` or `service`.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler cannot serve right now. `seconds: None` means permanently.
    #[error("{message}")]
    Unavailable {
        message: String,
        seconds: Option<u64>,
    },

    /// Any other initialization failure.
    #[error("{0}")]
    Fatal(String),

    /// A request-level failure; never turns into unavailability.
    #[error("service failure: {0}")]
    Service(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    /// Retryable unavailability lasting `seconds`.
    pub fn unavailable(message: impl Into<String>, seconds: u64) -> Self {
        Self::Unavailable {
            message: message.into(),
            seconds: Some(seconds),
        }
    }

    /// Unavailability with no expiry.
    pub fn permanently_unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            seconds: None,
        }
    }
}

/// Errors raised by the class-loading collaborator.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("class `{0}` not found")]
    ClassNotFound(String),

    #[error("class `{class}` could not be instantiated: {reason}")]
    Instantiation { class: String, reason: String },

    #[error("reload failed: {0}")]
    Reload(String),
}

/// Errors raised by [`HandlerWrapper`](crate::servlet::HandlerWrapper) operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Handler class missing or uninstantiable. Not retried.
    #[error("handler class `{class}` could not be resolved: {reason}")]
    ClassResolution { class: String, reason: String },

    /// The handler is inside an unavailability window.
    /// `retry_after` is the remaining time in whole seconds; `None` when permanent.
    #[error("{message}")]
    Unavailable {
        message: String,
        retry_after: Option<u64>,
    },

    /// A non-retryable init failure. The same cause is reported on every call
    /// until the handler is destroyed or reloaded.
    #[error("handler failed permanently: {0}")]
    Fatal(Arc<HandlerError>),

    /// Service and I/O failures, passed through unchanged.
    #[error(transparent)]
    Handler(HandlerError),
}

impl LifecycleError {
    pub(crate) fn class_resolution(class: impl Into<String>, reason: impl ToString) -> Self {
        Self::ClassResolution {
            class: class.into(),
            reason: reason.to_string(),
        }
    }

    /// Seconds a client should wait before retrying, if this is a timed back-off.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Unavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Errors surfaced by the dispatch engine and the embedding facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported document root `{0}`: only file: URLs are accepted")]
    UnsupportedDocRoot(String),

    #[error("invalid document root `{0}`")]
    InvalidDocRoot(String),

    #[error("interceptor `{0}` registered after the pipeline was frozen")]
    PipelineFrozen(String),

    #[error("no context mounted at `{0}`")]
    UnknownContext(String),

    #[error("a context is already mounted at `{0}`")]
    DuplicateContext(String),

    #[error("descriptor error in `{path}`: {reason}")]
    Descriptor { path: String, reason: String },

    #[error("interceptor `{stage}` failed: {reason}")]
    Stage { stage: String, reason: String },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn stage(stage: &str, reason: impl ToString) -> Self {
        Self::Stage {
            stage: stage.to_string(),
            reason: reason.to_string(),
        }
    }
}
