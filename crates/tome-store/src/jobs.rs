use std::path::Path;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use tome_core::ids::JobId;
use tome_core::job::{Job, JobItem};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub const UPLOAD_DIR: &str = "UploadFiles";
pub const PROMPT_DIR: &str = "Prompts";

/// Listing view of a stored job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub title: String,
    pub dir: String,
    pub item_count: usize,
    pub updated_at: String,
}

pub struct JobRepo {
    db: Database,
}

impl JobRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert when the job has no id yet, otherwise update in place.
    /// Returns the job's id.
    #[instrument(skip(self, job), fields(job_id = ?job.id, dir = %job.dir))]
    pub fn save(&self, job: &Job) -> Result<JobId, StoreError> {
        validate_job_dir(&job.dir)?;
        let items = serde_json::to_string(&job.items)?;
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| match job.id {
            None => {
                conn.execute(
                    "INSERT INTO jobs (title, dir, items, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    rusqlite::params![job.title, job.dir, items, now],
                )?;
                let id = JobId(conn.last_insert_rowid());
                info!(job_id = %id, items = job.items.len(), "job created");
                Ok(id)
            }
            Some(id) => {
                let changed = conn.execute(
                    "UPDATE jobs SET title = ?1, dir = ?2, items = ?3, updated_at = ?4 WHERE id = ?5",
                    rusqlite::params![job.title, job.dir, items, now, id.get()],
                )?;
                if changed == 0 {
                    return Err(StoreError::NotFound(format!("job {id}")));
                }
                Ok(id)
            }
        })
    }

    #[instrument(skip(self), fields(job_id = %id))]
    pub fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, title, dir, items FROM jobs WHERE id = ?1")?;
            let mut rows = stmt.query([id.get()])?;
            let Some(row) = rows.next()? else {
                return Err(StoreError::NotFound(format!("job {id}")));
            };
            let raw_items: String = row_helpers::get(row, 3, "jobs", "items")?;
            Ok(Job {
                id: Some(JobId(row_helpers::get(row, 0, "jobs", "id")?)),
                title: row_helpers::get(row, 1, "jobs", "title")?,
                dir: row_helpers::get(row, 2, "jobs", "dir")?,
                items: row_helpers::parse_json(&raw_items, "jobs", "items")?,
            })
        })
    }

    /// All jobs, lowest id first.
    pub fn list(&self) -> Result<Vec<JobSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, title, dir, items, updated_at FROM jobs ORDER BY id")?;
            let mut rows = stmt.query([])?;
            let mut jobs = Vec::new();
            while let Some(row) = rows.next()? {
                let raw_items: String = row_helpers::get(row, 3, "jobs", "items")?;
                let items: Vec<JobItem> = row_helpers::parse_json(&raw_items, "jobs", "items")?;
                jobs.push(JobSummary {
                    id: JobId(row_helpers::get(row, 0, "jobs", "id")?),
                    title: row_helpers::get(row, 1, "jobs", "title")?,
                    dir: row_helpers::get(row, 2, "jobs", "dir")?,
                    item_count: items.len(),
                    updated_at: row_helpers::get(row, 4, "jobs", "updated_at")?,
                });
            }
            Ok(jobs)
        })
    }

    #[instrument(skip(self), fields(job_id = %id))]
    pub fn delete(&self, id: JobId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", [id.get()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("job {id}")));
            }
            Ok(())
        })
    }
}

/// A job dir is a non-empty relative path that stays under the jobs root.
pub fn validate_job_dir(dir: &str) -> Result<(), StoreError> {
    let path = Path::new(dir);
    let escapes = path.is_absolute()
        || path.has_root()
        || dir.split(['/', '\\']).any(|c| c == "..");
    if dir.trim().is_empty() || escapes {
        return Err(StoreError::InvalidInput(format!("job dir must be relative: {dir}")));
    }
    Ok(())
}

/// Build a job from a job directory under `jobs_root`.
///
/// Every file in `UploadFiles/` becomes a file item (by name), followed by
/// every `Prompts/promptN.txt` as a text item ordered by `N`.
pub fn import_job_dir(jobs_root: &Path, dir: &str) -> Result<Job, StoreError> {
    validate_job_dir(dir)?;
    let root = jobs_root.join(dir);
    if !root.is_dir() {
        return Err(StoreError::NotFound(format!("job dir {}", root.display())));
    }

    let mut items = Vec::new();

    let mut uploads = file_names(&root.join(UPLOAD_DIR))?;
    uploads.sort();
    items.extend(
        uploads
            .into_iter()
            .map(|name| JobItem::file(format!("{UPLOAD_DIR}/{name}"))),
    );

    let pattern = Regex::new(r"^prompt(\d+)\.txt$")
        .map_err(|e| StoreError::InvalidInput(e.to_string()))?;
    let mut prompts: Vec<(u64, String)> = file_names(&root.join(PROMPT_DIR))?
        .into_iter()
        .filter_map(|name| {
            let n = pattern.captures(&name)?.get(1)?.as_str().parse().ok()?;
            Some((n, name))
        })
        .collect();
    prompts.sort();
    for (_, name) in prompts {
        let text = std::fs::read_to_string(root.join(PROMPT_DIR).join(&name))?;
        items.push(JobItem::text(text));
    }

    info!(dir, items = items.len(), "job directory imported");
    let mut job = Job::new(dir, items);
    job.title = dir.to_string();
    Ok(job)
}

/// Plain file names in `dir`; a missing directory is empty.
fn file_names(dir: &Path) -> Result<Vec<String>, StoreError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}
