/// SQL DDL for the tome database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    dir TEXT NOT NULL,
    items TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    token TEXT PRIMARY KEY,
    job_id INTEGER,
    job_dir TEXT NOT NULL,
    outcome TEXT NOT NULL,
    elapsed_secs REAL NOT NULL,
    successful_turns INTEGER NOT NULL,
    transcript_path TEXT,
    history_path TEXT,
    finished_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_job ON runs(job_id, finished_at);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
