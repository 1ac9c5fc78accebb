//! Run orchestrator: starts job runs in the background and tracks them by
//! correlation token so they can be cancelled.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use tome_core::ids::{CorrelationToken, JobId};
use tome_engine::error::EngineError;
use tome_engine::runner::JobRunner;
use tome_store::{Database, JobRepo, RunRepo, StoreError};

/// Trait for orchestrating job runs.
#[async_trait]
pub trait RunOrchestrator: Send + Sync {
    /// Start a run of `job_id`; returns once the run is accepted.
    async fn start(&self, job_id: JobId) -> Result<CorrelationToken, EngineError>;
    /// Request cancellation. `false` if no such run is active.
    fn cancel(&self, token: &CorrelationToken) -> bool;
    fn is_running(&self, token: &CorrelationToken) -> bool;
    fn active_count(&self) -> usize;
    fn cancel_all(&self) -> usize;
}

struct ActiveRun {
    cancel: CancellationToken,
    _started_at: Instant,
}

/// Releases a job's claim when the run task ends, even by unwinding.
struct RunClaim {
    job_id: JobId,
    token: CorrelationToken,
    active_jobs: Arc<DashMap<JobId, CorrelationToken>>,
    active_runs: Arc<DashMap<CorrelationToken, ActiveRun>>,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.active_runs.remove(&self.token);
        self.active_jobs.remove_if(&self.job_id, |_, token| *token == self.token);
    }
}

/// Production orchestrator backed by `JobRunner`.
pub struct EngineOrchestrator {
    runner: Arc<JobRunner>,
    db: Database,
    active_jobs: Arc<DashMap<JobId, CorrelationToken>>,
    active_runs: Arc<DashMap<CorrelationToken, ActiveRun>>,
}

impl EngineOrchestrator {
    pub fn new(runner: Arc<JobRunner>, db: Database) -> Self {
        Self {
            runner,
            db,
            active_jobs: Arc::new(DashMap::new()),
            active_runs: Arc::new(DashMap::new()),
        }
    }

    /// Claim `job_id` for a new run. Two runs of one job would interleave
    /// writes to its Response dir.
    fn claim(&self, job_id: JobId) -> Result<RunClaim, EngineError> {
        let token = match self.active_jobs.entry(job_id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyRunning(job_id)),
            Entry::Vacant(slot) => slot.insert(CorrelationToken::new()).value().clone(),
        };
        Ok(RunClaim {
            job_id,
            token,
            active_jobs: Arc::clone(&self.active_jobs),
            active_runs: Arc::clone(&self.active_runs),
        })
    }
}

#[async_trait]
impl RunOrchestrator for EngineOrchestrator {
    async fn start(&self, job_id: JobId) -> Result<CorrelationToken, EngineError> {
        let claim = self.claim(job_id)?;
        let job = JobRepo::new(self.db.clone()).get(job_id).map_err(|e| match e {
            StoreError::NotFound(_) => EngineError::JobNotFound(job_id),
            other => other.into(),
        })?;

        let token = claim.token.clone();
        let cancel = CancellationToken::new();
        self.active_runs.insert(
            token.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                _started_at: Instant::now(),
            },
        );

        let runner = Arc::clone(&self.runner);
        let runs = RunRepo::new(self.db.clone());

        tokio::spawn(async move {
            let run_token = claim.token.clone();
            let report = runner.run(&job, run_token.clone(), &cancel).await;
            match runs.record(&report.result, &report.persisted) {
                Ok(row) => tracing::info!(
                    token = %run_token,
                    job_id = %job_id,
                    outcome = row.outcome.as_str(),
                    "run recorded"
                ),
                Err(e) => tracing::error!(token = %run_token, error = %e, "failed to record run"),
            }
            drop(claim);
        });

        Ok(token)
    }

    fn cancel(&self, token: &CorrelationToken) -> bool {
        match self.active_runs.get(token) {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn is_running(&self, token: &CorrelationToken) -> bool {
        self.active_runs.contains_key(token)
    }

    fn active_count(&self) -> usize {
        self.active_runs.len()
    }

    fn cancel_all(&self) -> usize {
        for entry in self.active_runs.iter() {
            entry.value().cancel.cancel();
        }
        self.active_runs.len()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::broadcast;
    use tome_core::events::RunEvent;
    use tome_core::job::{Job, JobItem};
    use tome_core::run::{PersistError, PersistedRun, RunOutcome, RunResult, RunSink};
    use tome_engine::config::EngineConfig;
    use tome_engine::pacing::PacingPolicy;
    use tome_llm::mock::{MockAssetBackend, MockProvider, MockResponse};

    pub fn make_runner(
        responses: Vec<MockResponse>,
        event_tx: broadcast::Sender<RunEvent>,
    ) -> JobRunner {
        let config = EngineConfig {
            pacing: PacingPolicy::None,
            ..EngineConfig::default()
        };
        JobRunner::new(
            Arc::new(MockProvider::new(responses)),
            Arc::new(MockAssetBackend::new()),
            config,
            event_tx,
        )
    }

    async fn wait_for_done(rx: &mut broadcast::Receiver<RunEvent>) -> RunEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if event.is_done() {
                return event;
            }
        }
    }

    async fn wait_until_idle(orchestrator: &EngineOrchestrator) {
        for _ in 0..200 {
            if orchestrator.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run never finished");
    }

    #[tokio::test]
    async fn run_is_recorded_after_completion() {
        let db = Database::in_memory().unwrap();
        let job_id = JobRepo::new(db.clone())
            .save(&Job::new("novel", vec![JobItem::text("write")]))
            .unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let orchestrator =
            EngineOrchestrator::new(Arc::new(make_runner(vec![MockResponse::text("chapter")], tx)), db.clone());

        let token = orchestrator.start(job_id).await.unwrap();
        let done = wait_for_done(&mut rx).await;
        assert_eq!(done.token(), &token);
        wait_until_idle(&orchestrator).await;

        let row = RunRepo::new(db).get(&token).unwrap();
        assert_eq!(row.outcome, RunOutcome::Completed);
        assert_eq!(row.successful_turns, 1);
        assert!(!orchestrator.is_running(&token));
    }

    struct PanickingSink;

    impl RunSink for PanickingSink {
        fn persist(&self, _result: &RunResult) -> Result<PersistedRun, PersistError> {
            panic!("disk vanished");
        }
    }

    #[tokio::test]
    async fn panicking_run_releases_its_job() {
        let db = Database::in_memory().unwrap();
        let job_id = JobRepo::new(db.clone())
            .save(&Job::new("novel", vec![JobItem::text("write")]))
            .unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let runner = make_runner(
            vec![MockResponse::text("one"), MockResponse::text("two")],
            tx,
        )
        .with_sink(Arc::new(PanickingSink));
        let orchestrator = EngineOrchestrator::new(Arc::new(runner), db.clone());

        let token = orchestrator.start(job_id).await.unwrap();
        match wait_for_done(&mut rx).await {
            RunEvent::Done { outcome, .. } => assert_eq!(outcome, RunOutcome::Errored),
            other => panic!("expected done, got {other:?}"),
        }
        wait_until_idle(&orchestrator).await;
        assert_eq!(RunRepo::new(db).get(&token).unwrap().outcome, RunOutcome::Errored);

        let again = orchestrator.start(job_id).await.unwrap();
        assert_ne!(again, token);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_claim_job_once() {
        let db = Database::in_memory().unwrap();
        let job_id = JobRepo::new(db.clone())
            .save(&Job::new("novel", vec![JobItem::text("write")]))
            .unwrap();
        let (tx, _rx) = broadcast::channel(64);
        let responses = vec![MockResponse::delayed(
            Duration::from_secs(30),
            MockResponse::text("slow"),
        )];
        let orchestrator = Arc::new(EngineOrchestrator::new(
            Arc::new(make_runner(responses, tx)),
            db,
        ));

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move { orchestrator.start(job_id).await })
            })
            .collect();
        let mut started = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => started += 1,
                Err(e) => assert!(matches!(e, EngineError::AlreadyRunning(_))),
            }
        }
        assert_eq!(started, 1);
        assert_eq!(orchestrator.active_count(), 1);
        orchestrator.cancel_all();
    }

    #[tokio::test]
    async fn missing_job_is_rejected() {
        let db = Database::in_memory().unwrap();
        let (tx, _rx) = broadcast::channel(16);
        let orchestrator = EngineOrchestrator::new(Arc::new(make_runner(vec![], tx)), db);

        let err = orchestrator.start(JobId(42)).await.unwrap_err();
        assert!(matches!(err, EngineError::JobNotFound(JobId(42))));
        assert_eq!(orchestrator.active_count(), 0);
        assert!(matches!(
            orchestrator.start(JobId(42)).await,
            Err(EngineError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_aborts_active_run() {
        let db = Database::in_memory().unwrap();
        let job_id = JobRepo::new(db.clone())
            .save(&Job::new("novel", vec![JobItem::text("a"), JobItem::text("b")]))
            .unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let responses = vec![MockResponse::delayed(
            Duration::from_secs(30),
            MockResponse::text("too late"),
        )];
        let orchestrator = EngineOrchestrator::new(Arc::new(make_runner(responses, tx)), db.clone());

        let token = orchestrator.start(job_id).await.unwrap();
        assert!(orchestrator.is_running(&token));
        assert!(matches!(
            orchestrator.start(job_id).await,
            Err(EngineError::AlreadyRunning(_))
        ));

        assert!(orchestrator.cancel(&token));
        match wait_for_done(&mut rx).await {
            RunEvent::Done { outcome, .. } => assert_eq!(outcome, RunOutcome::Aborted),
            other => panic!("expected done, got {other:?}"),
        }
        wait_until_idle(&orchestrator).await;
        assert!(!orchestrator.cancel(&token));
    }
}
