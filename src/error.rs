//! Failure taxonomy for execution sessions.

use std::time::Duration;

use thiserror::Error;

/// Every way an execution can end other than a normal process exit.
///
/// `Display` is the text the client sees after the `Error: ` prefix.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Malformed or unsupported first message. Nothing was allocated.
    #[error("{0}")]
    Handshake(String),

    /// The interpreter could not be started. No process exists.
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process outlived its budget and was killed.
    #[error("Execution timed out ({limit:?} limit)")]
    Timeout { limit: Duration },

    #[error("{0}")]
    Runtime(String),

    /// The client went away. Torn down silently.
    #[error("client disconnected")]
    Disconnected,
}

impl ExecError {
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Whether this error is reported to the client at all.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Text for the stderr error frame.
    pub fn client_message(&self) -> String {
        format!("Error: {self}")
    }
}
