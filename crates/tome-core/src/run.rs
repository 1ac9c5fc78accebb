use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::{CorrelationToken, JobId};
use crate::messages::Turn;

/// Placed after every successful response in a transcript.
pub const TRANSCRIPT_SEPARATOR: &str =
    "\n\n====================回應分隔線====================\n\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted,
    Errored,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Errored => "errored",
        }
    }
}

impl std::str::FromStr for RunOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            "errored" => Ok(Self::Errored),
            other => Err(format!("unknown run outcome: {other}")),
        }
    }
}

/// Final, immutable record of one job run.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub token: CorrelationToken,
    pub job_id: Option<JobId>,
    pub job_dir: String,
    pub transcript: String,
    pub history: Vec<Turn>,
    pub elapsed_secs: f64,
    pub outcome: RunOutcome,
    pub successful_turns: usize,
}

/// Where the artifacts of a run ended up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRun {
    pub transcript_path: Option<PathBuf>,
    pub history_path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
#[error("persistence failed: {0}")]
pub struct PersistError(pub String);

/// Durable destination for finished runs.
pub trait RunSink: Send + Sync {
    fn persist(&self, result: &RunResult) -> Result<PersistedRun, PersistError>;
}
