mod config;

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use tome_core::events::RunEvent;
use tome_core::ids::{CorrelationToken, JobId};
use tome_core::run::RunOutcome;
use tome_engine::runner::JobRunner;
use tome_llm::{GeminiConfig, GeminiFiles, GeminiProvider};
use tome_server::{EngineOrchestrator, HandlerState, RunOrchestrator, ServerConfig};
use tome_store::{import_job_dir, ArtifactStore, Database, JobRepo, RunRepo};
use tome_telemetry::{LogQuery, SqliteLogSink, TelemetryConfig};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "tome", version, about = "Drive scripted multi-turn writing jobs against Gemini")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a stored job, printing its events as JSON lines.
    Run {
        job_id: i64,
        /// Wait for complete responses instead of streaming them.
        #[arg(long)]
        no_stream: bool,
    },
    /// Import a job directory under the jobs root.
    Import { dir: String },
    /// List stored jobs.
    Jobs,
    /// Show persisted warnings and errors of one run.
    Logs {
        token: String,
        #[arg(long)]
        level: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create {}", config.data_dir.display()))?;
    let telemetry = tome_telemetry::init_telemetry(TelemetryConfig {
        log_db_path: config.log_db_path(),
        ..TelemetryConfig::default()
    });

    let db = Database::open(&config.db_path()).context("open database")?;
    tracing::debug!(path = %config.db_path().display(), "database opened");

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(&config, db, telemetry.shared_logs()).await
        }
        Command::Run { job_id, no_stream } => {
            if no_stream {
                config.streaming = false;
            }
            run(&config, db, JobId(job_id)).await
        }
        Command::Import { dir } => {
            let mut job = import_job_dir(&config.jobs_root, &dir)?;
            job.id = Some(JobRepo::new(db).save(&job)?);
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Command::Jobs => {
            let jobs = JobRepo::new(db).list()?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(())
        }
        Command::Logs { token, level, limit } => {
            let logs = telemetry
                .logs()
                .context("log persistence is disabled")?;
            let records = logs.query(&LogQuery {
                level,
                token: Some(token),
                limit: Some(limit),
                ..LogQuery::default()
            })?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
    }
}

fn build_runner(config: &AppConfig, event_tx: broadcast::Sender<RunEvent>) -> Result<JobRunner> {
    let gemini = GeminiConfig::new(config.require_api_key()?).with_model(&config.model);
    let provider = Arc::new(GeminiProvider::new(gemini.clone())?);
    let files = Arc::new(GeminiFiles::new(gemini)?);
    let artifacts = Arc::new(ArtifactStore::new(&config.jobs_root));

    Ok(JobRunner::new(provider, files, config.engine_config(), event_tx)
        .with_sink(artifacts)
        .with_jobs_root(&config.jobs_root))
}

async fn serve(config: &AppConfig, db: Database, logs: Option<Arc<SqliteLogSink>>) -> Result<()> {
    let (event_tx, _) = broadcast::channel::<RunEvent>(1024);
    let runner = Arc::new(build_runner(config, event_tx.clone())?);
    let orchestrator = Arc::new(EngineOrchestrator::new(runner, db.clone()));

    let mut state = HandlerState::new(db, ArtifactStore::new(&config.jobs_root))
        .with_orchestrator(Arc::clone(&orchestrator) as Arc<dyn RunOrchestrator>);
    if let Some(logs) = logs {
        state = state.with_logs(logs);
    }
    let server_config = ServerConfig {
        port: config.port,
        ..Default::default()
    };
    let handle = tome_server::start(server_config, state, &event_tx)
        .await
        .context("start server")?;

    tracing::info!(
        port = handle.port,
        model = %config.model,
        jobs_root = %config.jobs_root.display(),
        "tome server ready"
    );

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    let cancelled = orchestrator.cancel_all();
    tracing::info!(cancelled, "shutting down");
    Ok(())
}

async fn run(config: &AppConfig, db: Database, job_id: JobId) -> Result<()> {
    let (event_tx, events) = broadcast::channel::<RunEvent>(1024);
    let runner = build_runner(config, event_tx)?;

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };
    let printer = tokio::spawn(print_events(events));

    let token = CorrelationToken::new();
    let report = runner
        .run_job(&JobRepo::new(db.clone()), job_id, token.clone(), &cancel)
        .await?;
    ctrl_c.abort();
    printer.await.context("event printer")?;

    RunRepo::new(db).record(&report.result, &report.persisted)?;
    if report.result.outcome == RunOutcome::Errored {
        bail!("run {token} ended with errors");
    }
    Ok(())
}

/// One JSON object per line on stdout, until `done`.
async fn print_events(mut events: broadcast::Receiver<RunEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let done = event.is_done();
                if let Ok(line) = serde_json::to_string(&event) {
                    let mut out = std::io::stdout().lock();
                    if writeln!(out, "{line}").and_then(|_| out.flush()).is_err() {
                        break;
                    }
                }
                if done {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagged, dropped events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
