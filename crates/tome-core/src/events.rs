use serde::{Deserialize, Serialize};

use crate::ids::CorrelationToken;
use crate::run::RunOutcome;

/// Live events emitted by a job run, in processing order.
/// Every event carries the caller's correlation token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Human-readable progress narration.
    Status {
        content: String,
        token: CorrelationToken,
    },

    /// Raw response text. Not written to the operator log.
    Data {
        content: String,
        token: CorrelationToken,
    },

    Error {
        content: String,
        token: CorrelationToken,
    },

    /// Always the last event of a run.
    Done {
        content: String,
        token: CorrelationToken,
        elapsed_secs: f64,
        outcome: RunOutcome,
    },
}

impl RunEvent {
    pub fn status(token: &CorrelationToken, content: impl Into<String>) -> Self {
        Self::Status {
            content: content.into(),
            token: token.clone(),
        }
    }

    pub fn data(token: &CorrelationToken, content: impl Into<String>) -> Self {
        Self::Data {
            content: content.into(),
            token: token.clone(),
        }
    }

    pub fn error(token: &CorrelationToken, content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
            token: token.clone(),
        }
    }

    /// Routing key for multiplexed transports.
    pub fn token(&self) -> &CorrelationToken {
        match self {
            Self::Status { token, .. }
            | Self::Data { token, .. }
            | Self::Error { token, .. }
            | Self::Done { token, .. } => token,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Status { content, .. }
            | Self::Data { content, .. }
            | Self::Error { content, .. }
            | Self::Done { content, .. } => content,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Data { .. } => "data",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}
