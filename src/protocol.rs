//! JSON bodies exchanged with clients.

use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::relay::{Channel, SessionEvent};
use crate::review::ReviewMode;

/// Outbound socket frame: `{"type": "stdout"|"stderr", "data": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: Channel,
    pub data: String,
}

impl ServerFrame {
    pub fn error(err: &ExecError) -> Self {
        Self {
            kind: Channel::Stderr,
            data: err.client_message(),
        }
    }
}

impl From<SessionEvent> for ServerFrame {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Output(chunk) => Self {
                kind: chunk.channel,
                data: chunk.payload,
            },
            SessionEvent::Error(message) => Self {
                kind: Channel::Stderr,
                data: format!("Error: {message}"),
            },
        }
    }
}

/// `POST /api/execute` body.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(alias = "code")]
    pub source_code: String,
    pub language: String,
    #[serde(default)]
    pub inputs: String,
}

/// `POST /api/execute` response.
#[derive(Debug, Default, Serialize)]
pub struct ExecuteResponse {
    pub output: String,
    pub error: String,
}

impl ExecuteResponse {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: error.into(),
        }
    }
}

/// `POST /api/analyze` body.
#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(alias = "source_code")]
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub mode: ReviewMode,
}

#[derive(Debug, Serialize)]
pub struct WelcomeResponse {
    pub message: &'static str,
}
