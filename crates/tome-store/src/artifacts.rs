use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use tome_core::messages::{Part, Role, Turn};
use tome_core::run::{PersistError, PersistedRun, RunResult, RunSink};

use crate::error::StoreError;
use crate::jobs::validate_job_dir;

pub const RESPONSE_DIR: &str = "Response";

/// A transcript file in a job's `Response/` directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub filename: String,
    /// Local time, `%Y-%m-%d %H:%M:%S`.
    pub created_at: String,
}

/// Writes run artifacts under `<jobs root>/<job dir>/Response/` and reads
/// them back for history browsing.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    jobs_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(jobs_root: impl Into<PathBuf>) -> Self {
        Self {
            jobs_root: jobs_root.into(),
        }
    }

    pub fn jobs_root(&self) -> &Path {
        &self.jobs_root
    }

    pub fn response_dir(&self, job_dir: &str) -> PathBuf {
        self.jobs_root.join(job_dir).join(RESPONSE_DIR)
    }

    /// Transcripts of a job, newest first.
    pub fn list_transcripts(&self, job_dir: &str) -> Result<Vec<TranscriptEntry>, StoreError> {
        let dir = self.response_dir(job_dir);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut found: Vec<(SystemTime, String)> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !name.to_ascii_lowercase().ends_with(".txt") || !entry.file_type()?.is_file() {
                continue;
            }
            let meta = entry.metadata()?;
            let created = meta.created().or_else(|_| meta.modified())?;
            found.push((created, name));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        Ok(found
            .into_iter()
            .map(|(created, filename)| TranscriptEntry {
                filename,
                created_at: DateTime::<Local>::from(created)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            })
            .collect())
    }

    pub fn read_transcript(&self, job_dir: &str, filename: &str) -> Result<String, StoreError> {
        check_file_name(filename)?;
        let path = self.response_dir(job_dir).join(filename);
        std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(format!("transcript {filename}")),
            _ => StoreError::Io(e.to_string()),
        })
    }

    /// Delete the named transcripts. Files that are already gone are skipped.
    /// Returns how many were removed.
    #[instrument(skip(self, filenames), fields(count = filenames.len()))]
    pub fn delete_transcripts(&self, job_dir: &str, filenames: &[String]) -> Result<usize, StoreError> {
        for name in filenames {
            check_file_name(name)?;
        }
        let dir = self.response_dir(job_dir);
        let mut removed = 0;
        for name in filenames {
            match std::fs::remove_file(dir.join(name)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(job_dir, removed, "transcripts deleted");
        Ok(removed)
    }

    fn write_artifacts(&self, result: &RunResult) -> Result<PersistedRun, Vec<String>> {
        validate_job_dir(&result.job_dir).map_err(|e| vec![e.to_string()])?;
        let dir = self.response_dir(&result.job_dir);
        std::fs::create_dir_all(&dir).map_err(|e| vec![format!("create {}: {e}", dir.display())])?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let (stem, transcript_path, mut transcript_file) = create_unique(&dir, &stamp)
            .map_err(|e| vec![format!("create transcript in {}: {e}", dir.display())])?;
        let history_path = dir.join(format!("history_{stem}.json"));

        let mut persisted = PersistedRun::default();
        let mut failures = Vec::new();

        match transcript_file.write_all(result.transcript.as_bytes()) {
            Ok(()) => persisted.transcript_path = Some(transcript_path),
            Err(e) => failures.push(format!("write {}: {e}", transcript_path.display())),
        }

        let written = serde_json::to_string_pretty(&history_for_file(&result.history))
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(&history_path, json).map_err(|e| e.to_string()));
        match written {
            Ok(()) => persisted.history_path = Some(history_path),
            Err(e) => failures.push(format!("write {}: {e}", history_path.display())),
        }

        if failures.is_empty() {
            Ok(persisted)
        } else {
            Err(failures)
        }
    }
}

impl RunSink for ArtifactStore {
    #[instrument(skip_all, fields(token = %result.token, job_dir = %result.job_dir))]
    fn persist(&self, result: &RunResult) -> Result<PersistedRun, PersistError> {
        match self.write_artifacts(result) {
            Ok(persisted) => {
                info!(
                    transcript = ?persisted.transcript_path,
                    history = ?persisted.history_path,
                    "run artifacts written"
                );
                Ok(persisted)
            }
            Err(failures) => {
                for failure in &failures {
                    warn!(error = %failure, "artifact write failed");
                }
                Err(PersistError(failures.join("; ")))
            }
        }
    }
}

/// History in its on-disk shape. Parts of unknown kind are dropped.
fn history_for_file(history: &[Turn]) -> Vec<Turn> {
    history
        .iter()
        .map(|turn| Turn {
            role: turn.role,
            parts: turn
                .parts
                .iter()
                .filter(|part| match part {
                    Part::Unknown { kind, .. } => {
                        warn!(kind = %kind, role = turn.role.as_str(), "omitting unsupported part from history file");
                        false
                    }
                    _ => true,
                })
                .cloned()
                .collect(),
        })
        .collect()
}

/// Read a history file back into turns, keeping unrecognized parts as
/// `Part::Unknown`.
pub fn load_history(path: &Path) -> Result<Vec<Turn>, StoreError> {
    #[derive(Deserialize)]
    struct RawTurn {
        role: Role,
        #[serde(default)]
        parts: Vec<Value>,
    }

    let raw: Vec<RawTurn> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    Ok(raw
        .into_iter()
        .map(|turn| Turn {
            role: turn.role,
            parts: turn
                .parts
                .into_iter()
                .map(|value| {
                    serde_json::from_value::<Part>(value.clone()).unwrap_or_else(|_| Part::Unknown {
                        kind: value
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("untyped")
                            .to_string(),
                        raw: value,
                    })
                })
                .collect(),
        })
        .collect())
}

/// Claim `response_<stamp>.txt`, or `response_<stamp>_<n>.txt` when runs
/// finish within the same second. Returns the claimed stem.
fn create_unique(dir: &Path, stamp: &str) -> std::io::Result<(String, PathBuf, File)> {
    for n in 1u32.. {
        let stem = if n == 1 { stamp.to_string() } else { format!("{stamp}_{n}") };
        let path = dir.join(format!("response_{stem}.txt"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((stem, path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && n < 1000 => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::other("no free transcript name"))
}

fn check_file_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(StoreError::InvalidInput(format!("bad file name: {name}")));
    }
    Ok(())
}
