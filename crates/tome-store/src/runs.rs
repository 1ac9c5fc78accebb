use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use tome_core::ids::{CorrelationToken, JobId};
use tome_core::run::{PersistedRun, RunOutcome, RunResult};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One finished run, as recorded in the run log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRow {
    pub token: CorrelationToken,
    pub job_id: Option<JobId>,
    pub job_dir: String,
    pub outcome: RunOutcome,
    pub elapsed_secs: f64,
    pub successful_turns: usize,
    pub transcript_path: Option<String>,
    pub history_path: Option<String>,
    pub finished_at: String,
}

pub struct RunRepo {
    db: Database,
}

impl RunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip_all, fields(token = %result.token, outcome = result.outcome.as_str()))]
    pub fn record(&self, result: &RunResult, persisted: &PersistedRun) -> Result<RunRow, StoreError> {
        let row = RunRow {
            token: result.token.clone(),
            job_id: result.job_id,
            job_dir: result.job_dir.clone(),
            outcome: result.outcome,
            elapsed_secs: result.elapsed_secs,
            successful_turns: result.successful_turns,
            transcript_path: persisted
                .transcript_path
                .as_ref()
                .map(|p| p.display().to_string()),
            history_path: persisted
                .history_path
                .as_ref()
                .map(|p| p.display().to_string()),
            finished_at: Utc::now().to_rfc3339(),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (token, job_id, job_dir, outcome, elapsed_secs, successful_turns,
                                   transcript_path, history_path, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    row.token.as_str(),
                    row.job_id.map(JobId::get),
                    row.job_dir,
                    row.outcome.as_str(),
                    row.elapsed_secs,
                    row.successful_turns as i64,
                    row.transcript_path,
                    row.history_path,
                    row.finished_at,
                ],
            )?;
            Ok(())
        })?;
        Ok(row)
    }

    #[instrument(skip(self), fields(token = %token))]
    pub fn get(&self, token: &CorrelationToken) -> Result<RunRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_RUN} WHERE token = ?1"))?;
            let mut rows = stmt.query([token.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_run(row),
                None => Err(StoreError::NotFound(format!("run {token}"))),
            }
        })
    }

    /// Runs of one job, newest first.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn list_for_job(&self, job_id: JobId) -> Result<Vec<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_RUN} WHERE job_id = ?1 ORDER BY finished_at DESC, rowid DESC"
            ))?;
            let mut rows = stmt.query([job_id.get()])?;
            let mut runs = Vec::new();
            while let Some(row) = rows.next()? {
                runs.push(row_to_run(row)?);
            }
            Ok(runs)
        })
    }
}

const SELECT_RUN: &str = "SELECT token, job_id, job_dir, outcome, elapsed_secs, successful_turns,
                                 transcript_path, history_path, finished_at FROM runs";

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<RunRow, StoreError> {
    let token: String = row_helpers::get(row, 0, "runs", "token")?;
    let job_id: Option<i64> = row_helpers::get(row, 1, "runs", "job_id")?;
    let outcome: String = row_helpers::get(row, 3, "runs", "outcome")?;
    let turns: i64 = row_helpers::get(row, 5, "runs", "successful_turns")?;
    Ok(RunRow {
        token: CorrelationToken::from_raw(token),
        job_id: job_id.map(JobId),
        job_dir: row_helpers::get(row, 2, "runs", "job_dir")?,
        outcome: row_helpers::parse_enum(&outcome, "runs", "outcome")?,
        elapsed_secs: row_helpers::get(row, 4, "runs", "elapsed_secs")?,
        successful_turns: usize::try_from(turns).unwrap_or_default(),
        transcript_path: row_helpers::get(row, 6, "runs", "transcript_path")?,
        history_path: row_helpers::get(row, 7, "runs", "history_path")?,
        finished_at: row_helpers::get(row, 8, "runs", "finished_at")?,
    })
}
