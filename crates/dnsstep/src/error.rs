//! Errors related to this crate.

use thiserror::Error;

use crate::engine::EngineError;

/// Error surfaced by a single processing step.
#[derive(Error, Debug)]
pub enum StepError {
    /// The scheduler reported an I/O error while waiting.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The engine rejected the notification.
    #[error(transparent)]
    Protocol(#[from] EngineError),
}

impl StepError {
    /// Returns whether the error came from the scheduler.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Formats an error chain to a string.
///
/// This function can be used to express error messages that pass outside
/// the Rust boundary.
pub fn format_to_string<E: std::error::Error>(error: E) -> String {
    let mut message = String::new();

    message.push_str(&error.to_string());

    let mut child_error = error.source();

    while let Some(error) = child_error {
        message.push_str(": ");
        message.push_str(&error.to_string());

        child_error = error.source();
    }

    message
}
