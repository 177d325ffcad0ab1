//! The execution job parsed from a session handshake.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ExecError;
use crate::language::Target;

/// First message on an execution socket.
#[derive(Debug, Deserialize)]
pub struct Handshake {
    #[serde(alias = "source_code")]
    pub code: String,
    pub language: String,
}

/// One submission. Immutable once created.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub id: Uuid,
    pub source_code: String,
    pub target: Target,
    pub created_at: DateTime<Utc>,
}

impl ExecutionJob {
    pub fn new(source_code: impl Into<String>, target: Target) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_code: source_code.into(),
            target,
            created_at: Utc::now(),
        }
    }

    /// Parse and validate a raw handshake payload.
    pub fn from_handshake(payload: &str) -> Result<Self, ExecError> {
        let handshake: Handshake = serde_json::from_str(payload)
            .map_err(|e| ExecError::handshake(format!("Malformed handshake: {e}")))?;
        let target = Target::resolve(&handshake.language)?;
        Ok(Self::new(handshake.code, target))
    }
}
