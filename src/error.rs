use std::any::Any;

use thiserror::Error;

/// Error carried by futures, workflow results, and query handlers.
///
/// Cloneable so a single failure can fan out to every future chained to the
/// one that failed.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Panic(#[from] PanicError),
}

impl WorkflowError {
    pub fn message(msg: impl Into<String>) -> Self {
        WorkflowError::Message(msg.into())
    }
}

/// Failure to encode or decode a value through a [`crate::DataConverter`].
#[derive(Debug, Clone, Error)]
#[error("failed to convert value: {message}")]
pub struct ConversionError {
    pub message: String,
}

impl ConversionError {
    pub fn new(message: impl Into<String>) -> Self {
        ConversionError {
            message: message.into(),
        }
    }
}

/// A panic captured at a coroutine boundary.
///
/// `trace` is the panicking coroutine's name and yield status; a suspended
/// stackless coroutine has no OS stack to walk, so the status line of its
/// last yield point is the cleaned trace.
#[derive(Debug, Clone, Error)]
#[error("workflow panic: {message}\n{trace}")]
pub struct PanicError {
    pub message: String,
    pub trace: String,
}

impl PanicError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>, trace: String) -> Self {
        PanicError {
            message: panic_message(&payload),
            trace,
        }
    }
}

/// Best-effort extraction of the message from a caught panic payload.
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
