pub mod artifacts;
pub mod database;
pub mod error;
pub mod jobs;
pub mod row_helpers;
pub mod runs;
pub mod schema;

pub use artifacts::{load_history, ArtifactStore, TranscriptEntry};
pub use database::Database;
pub use error::StoreError;
pub use jobs::{import_job_dir, validate_job_dir, JobRepo, JobSummary};
pub use runs::{RunRepo, RunRow};
