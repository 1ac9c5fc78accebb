use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tome_core::asset::AssetRef;
use tome_core::events::RunEvent;
use tome_core::ids::{CorrelationToken, JobId};
use tome_core::job::{ItemKind, Job};
use tome_core::messages::Turn;
use tome_core::provider::{AssetBackend, ContentProvider};
use tome_core::run::{PersistedRun, RunOutcome, RunResult, RunSink, TRANSCRIPT_SEPARATOR};
use tome_llm::retry;
use tome_store::{JobRepo, StoreError};

use crate::assets::AssetStore;
use crate::config::EngineConfig;
use crate::error::{AssetError, EngineError, TurnError};
use crate::session::{ConversationSession, TurnFragment};

/// Lifecycle of one run: `Idle -> Running -> {Completed, Aborted, Errored}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
    Errored,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Errored)
    }

    pub fn advance(self, next: RunState) -> Result<RunState, EngineError> {
        match (self, next) {
            (Self::Idle, Self::Running) => Ok(next),
            (Self::Running, n) if n.is_terminal() => Ok(next),
            _ => Err(EngineError::InvalidTransition { from: self, to: next }),
        }
    }

    pub fn outcome(self) -> Option<RunOutcome> {
        match self {
            Self::Completed => Some(RunOutcome::Completed),
            Self::Aborted => Some(RunOutcome::Aborted),
            Self::Errored => Some(RunOutcome::Errored),
            Self::Idle | Self::Running => None,
        }
    }
}

/// What a finished run produced and where its artifacts went.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub result: RunResult,
    /// Empty when nothing was persisted.
    pub persisted: PersistedRun,
}

/// Executes jobs item by item against one conversation per run.
pub struct JobRunner {
    provider: Arc<dyn ContentProvider>,
    assets: Arc<dyn AssetBackend>,
    config: EngineConfig,
    event_tx: broadcast::Sender<RunEvent>,
    sink: Option<Arc<dyn RunSink>>,
    jobs_root: PathBuf,
}

impl JobRunner {
    pub fn new(
        provider: Arc<dyn ContentProvider>,
        assets: Arc<dyn AssetBackend>,
        config: EngineConfig,
        event_tx: broadcast::Sender<RunEvent>,
    ) -> Self {
        Self {
            provider,
            assets,
            config,
            event_tx,
            sink: None,
            jobs_root: PathBuf::from("."),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Relative file items resolve against `<jobs_root>/<job dir>`.
    pub fn with_jobs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.jobs_root = root.into();
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load a stored job and run it.
    pub async fn run_job(
        &self,
        jobs: &JobRepo,
        id: JobId,
        token: CorrelationToken,
        cancel: &CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let job = jobs.get(id).map_err(|e| match e {
            StoreError::NotFound(_) => EngineError::JobNotFound(id),
            other => other.into(),
        })?;
        Ok(self.run(&job, token, cancel).await)
    }

    pub async fn run(&self, job: &Job, token: CorrelationToken, cancel: &CancellationToken) -> RunReport {
        self.run_with_history(job, Vec::new(), token, cancel).await
    }

    /// Run `job`, continuing the conversation in `seed`.
    #[instrument(skip_all, fields(token = %token, job_id = ?job.id, dir = %job.dir))]
    pub async fn run_with_history(
        &self,
        job: &Job,
        seed: Vec<Turn>,
        token: CorrelationToken,
        cancel: &CancellationToken,
    ) -> RunReport {
        let started = Instant::now();
        let run = AssertUnwindSafe(self.execute(job, seed, token.clone(), cancel));
        match run.catch_unwind().await {
            Ok(report) => report,
            Err(panic) => self.fail_after_panic(job, token, started, panic_message(&*panic)),
        }
    }

    async fn execute(
        &self,
        job: &Job,
        seed: Vec<Turn>,
        token: CorrelationToken,
        cancel: &CancellationToken,
    ) -> RunReport {
        let started = Instant::now();
        let mut state = RunState::Idle;
        self.transition(&mut state, RunState::Running);

        let sendable = job.items.iter().filter(|i| i.send).count();
        info!(items = job.items.len(), sendable, "run started");
        self.emit(RunEvent::status(
            &token,
            format!("starting job {} ({sendable} items to send)", display_name(job)),
        ));

        let store = AssetStore::new(
            Arc::clone(&self.assets),
            self.config.retry.clone(),
            self.config.asset_poll.clone(),
        );
        let mut session = ConversationSession::new(
            Arc::clone(&self.provider),
            self.config.system_instruction.clone(),
            self.config.options.clone(),
            self.config.retry.clone(),
        )
        .with_markers(self.config.markers.clone())
        .with_history(seed);

        let last_text = job.last_sendable_text();
        let mut transcript = String::new();
        let mut attached: Vec<AssetRef> = Vec::new();
        let mut successes: u32 = 0;
        let mut prompt_no: u32 = 0;
        let mut stop: Option<RunState> = None;

        let mut idx = 0;
        'items: while idx < job.items.len() {
            if cancel.is_cancelled() {
                stop = Some(RunState::Aborted);
                break;
            }
            let item = &job.items[idx];
            if !item.send {
                idx += 1;
                continue;
            }

            match item.kind {
                ItemKind::File => {
                    // Consecutive file items are uploaded and polled together.
                    let mut batch: Vec<&str> = Vec::new();
                    while idx < job.items.len() {
                        let next = &job.items[idx];
                        if next.kind != ItemKind::File && next.send {
                            break;
                        }
                        if next.send {
                            batch.push(&next.content);
                        }
                        idx += 1;
                    }

                    for content in &batch {
                        self.emit(RunEvent::status(&token, format!("uploading {content}")));
                    }
                    let paths: Vec<PathBuf> = batch.iter().map(|c| self.item_path(job, c)).collect();
                    let results = store.resolve_all(&paths, cancel).await;

                    for (content, result) in batch.iter().zip(results) {
                        match result {
                            Ok(asset) => {
                                self.emit(RunEvent::status(
                                    &token,
                                    format!("{} is ready ({})", asset.logical_name, asset.remote_id),
                                ));
                                if !attached.iter().any(|a| a.logical_name == asset.logical_name) {
                                    attached.push(asset);
                                }
                            }
                            Err(AssetError::Cancelled) => stop = Some(RunState::Aborted),
                            Err(e) => {
                                warn!(item = %content, error = %e, "file item failed");
                                self.emit(RunEvent::error(&token, format!("file {content}: {e}")));
                            }
                        }
                    }
                    if stop.is_some() {
                        break 'items;
                    }
                }

                ItemKind::Text => {
                    prompt_no += 1;
                    self.emit(RunEvent::status(
                        &token,
                        format!("sending prompt {prompt_no} with {} attached files", attached.len()),
                    ));

                    match self.send_text(&mut session, &item.content, &attached, &token, cancel).await {
                        Ok(response) => {
                            successes += 1;
                            transcript.push_str(&response);
                            transcript.push_str(TRANSCRIPT_SEPARATOR);
                            attached.clear();
                            info!(prompt = prompt_no, chars = response.chars().count(), "prompt answered");
                            self.emit(RunEvent::status(
                                &token,
                                format!("prompt {prompt_no} answered ({} chars)", response.chars().count()),
                            ));

                            let is_last = last_text == Some(idx);
                            if let Some(pause) = self.config.pacing.pause_after(successes, is_last) {
                                self.emit(RunEvent::status(
                                    &token,
                                    format!("pausing {}s to respect rate limits", pause.as_secs()),
                                ));
                                if !retry::wait(pause, cancel).await {
                                    stop = Some(RunState::Aborted);
                                    break 'items;
                                }
                            }
                        }
                        Err(TurnError::Cancelled) => {
                            stop = Some(RunState::Aborted);
                            break 'items;
                        }
                        Err(e) if e.is_hard_block() => {
                            error!(prompt = prompt_no, error = %e, "hard block, stopping run");
                            self.emit(RunEvent::error(
                                &token,
                                format!("prompt {prompt_no} stopped the run: {e}"),
                            ));
                            stop = Some(RunState::Errored);
                            break 'items;
                        }
                        Err(e) => {
                            warn!(prompt = prompt_no, error = %e, "prompt failed");
                            self.emit(RunEvent::error(&token, format!("prompt {prompt_no} failed: {e}")));
                        }
                    }
                    idx += 1;
                }
            }
        }

        let end = match stop {
            Some(terminal) => terminal,
            None if successes > 0 => RunState::Completed,
            None => {
                self.emit(RunEvent::error(&token, "no prompt produced a response"));
                RunState::Errored
            }
        };
        if end == RunState::Aborted {
            warn!(successes, "run cancelled");
            self.emit(RunEvent::status(&token, "run cancelled"));
        }
        self.transition(&mut state, end);
        let outcome = state.outcome().unwrap_or(RunOutcome::Errored);

        let result = RunResult {
            token: token.clone(),
            job_id: job.id,
            job_dir: job.dir.clone(),
            transcript,
            history: session.history().to_vec(),
            elapsed_secs: started.elapsed().as_secs_f64(),
            outcome,
            successful_turns: successes as usize,
        };

        let persisted = if successes > 0 {
            self.persist(&result)
        } else {
            PersistedRun::default()
        };

        info!(
            outcome = outcome.as_str(),
            successes,
            elapsed_secs = result.elapsed_secs,
            "run finished"
        );
        self.emit(RunEvent::Done {
            content: format!("{} in {:.1}s", outcome.as_str(), result.elapsed_secs),
            token,
            elapsed_secs: result.elapsed_secs,
            outcome,
        });

        RunReport { result, persisted }
    }

    /// Ends a run whose task panicked: nothing it produced is trusted.
    fn fail_after_panic(
        &self,
        job: &Job,
        token: CorrelationToken,
        started: Instant,
        message: String,
    ) -> RunReport {
        error!(panic = %message, "run panicked");
        self.emit(RunEvent::error(&token, format!("internal error: {message}")));

        let outcome = RunOutcome::Errored;
        let elapsed_secs = started.elapsed().as_secs_f64();
        self.emit(RunEvent::Done {
            content: format!("{} in {elapsed_secs:.1}s", outcome.as_str()),
            token: token.clone(),
            elapsed_secs,
            outcome,
        });

        RunReport {
            result: RunResult {
                token,
                job_id: job.id,
                job_dir: job.dir.clone(),
                transcript: String::new(),
                history: Vec::new(),
                elapsed_secs,
                outcome,
                successful_turns: 0,
            },
            persisted: PersistedRun::default(),
        }
    }

    async fn send_text(
        &self,
        session: &mut ConversationSession,
        text: &str,
        assets: &[AssetRef],
        token: &CorrelationToken,
        cancel: &CancellationToken,
    ) -> Result<String, TurnError> {
        if !self.config.streaming {
            let response = session.send_turn(text, assets, cancel).await?;
            debug!(chars = response.chars().count(), "data event");
            self.emit(RunEvent::data(token, response.clone()));
            return Ok(response);
        }

        let stream = session.send_turn_streaming(text, assets, cancel);
        futures::pin_mut!(stream);
        let mut response = String::new();
        while let Some(fragment) = stream.next().await {
            match fragment? {
                TurnFragment::Text(delta) => {
                    debug!(chars = delta.chars().count(), "data event");
                    response.push_str(&delta);
                    self.emit(RunEvent::data(token, delta));
                }
                TurnFragment::Restarted { attempt } => {
                    response.clear();
                    self.emit(RunEvent::status(
                        token,
                        format!("stream interrupted, regenerating the response (attempt {attempt})"),
                    ));
                }
            }
        }
        Ok(response)
    }

    fn persist(&self, result: &RunResult) -> PersistedRun {
        let Some(sink) = &self.sink else {
            return PersistedRun::default();
        };
        match sink.persist(result) {
            Ok(persisted) => {
                if let Some(path) = &persisted.transcript_path {
                    self.emit(RunEvent::status(
                        &result.token,
                        format!("transcript saved to {}", path.display()),
                    ));
                }
                persisted
            }
            Err(e) => {
                error!(error = %e, "persisting run failed");
                self.emit(RunEvent::error(&result.token, e.to_string()));
                PersistedRun::default()
            }
        }
    }

    fn item_path(&self, job: &Job, content: &str) -> PathBuf {
        let path = Path::new(content);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.jobs_root.join(&job.dir).join(path)
        }
    }

    fn transition(&self, state: &mut RunState, next: RunState) {
        match state.advance(next) {
            Ok(s) => *state = s,
            Err(e) => error!(error = %e, "ignoring run state change"),
        }
    }

    fn emit(&self, event: RunEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("no event receivers, event dropped");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "run task panicked".to_string()
    }
}

fn display_name(job: &Job) -> &str {
    if job.title.is_empty() {
        &job.dir
    } else {
        &job.title
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tome_core::asset::AssetState;
    use tome_core::errors::ProviderError;
    use tome_core::job::JobItem;
    use tome_core::messages::{Part, Role};
    use tome_core::run::PersistError;
    use tome_llm::mock::{MockAssetBackend, MockProvider, MockResponse};
    use tome_llm::retry::{Backoff, RetryPolicy};
    use tome_store::Database;

    use crate::pacing::PacingPolicy;

    #[derive(Default)]
    struct RecordingSink {
        runs: Mutex<Vec<RunResult>>,
    }

    impl RunSink for RecordingSink {
        fn persist(&self, result: &RunResult) -> Result<PersistedRun, PersistError> {
            self.runs.lock().push(result.clone());
            Ok(PersistedRun {
                transcript_path: Some(PathBuf::from("/tmp/response.txt")),
                history_path: None,
            })
        }
    }

    struct PanickingSink;

    impl RunSink for PanickingSink {
        fn persist(&self, _result: &RunResult) -> Result<PersistedRun, PersistError> {
            panic!("disk vanished");
        }
    }

    struct Harness {
        runner: JobRunner,
        provider: Arc<MockProvider>,
        assets: Arc<MockAssetBackend>,
        sink: Arc<RecordingSink>,
        events: broadcast::Receiver<RunEvent>,
    }

    fn config(streaming: bool) -> EngineConfig {
        EngineConfig {
            system_instruction: "persona".into(),
            retry: RetryPolicy::new(3, Backoff::Fixed(Duration::from_secs(1))),
            pacing: PacingPolicy::None,
            streaming,
            ..EngineConfig::default()
        }
    }

    fn harness(responses: Vec<MockResponse>, assets: MockAssetBackend, config: EngineConfig) -> Harness {
        let provider = Arc::new(MockProvider::new(responses));
        let assets = Arc::new(assets);
        let sink = Arc::new(RecordingSink::default());
        let (tx, events) = broadcast::channel(1024);
        let runner = JobRunner::new(provider.clone(), assets.clone(), config, tx)
            .with_sink(sink.clone())
            .with_jobs_root("/jobs");
        Harness {
            runner,
            provider,
            assets,
            sink,
            events,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn run(h: &Harness, items: Vec<JobItem>) -> RunReport {
        let job = Job::new("story", items);
        h.runner
            .run(&job, CorrelationToken::from_raw("run_test"), &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn two_prompts_build_transcript_and_history() {
        let mut h = harness(
            vec![MockResponse::text("A"), MockResponse::text("B")],
            MockAssetBackend::new(),
            config(false),
        );
        let report = run(&h, vec![JobItem::text("a"), JobItem::text("b")]).await;
        let result = &report.result;

        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(
            result.transcript,
            format!("A{TRANSCRIPT_SEPARATOR}B{TRANSCRIPT_SEPARATOR}")
        );
        let roles: Vec<_> = result.history.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(result.successful_turns, 2);
        assert_eq!(h.sink.runs.lock().len(), 1);
        assert!(report.persisted.transcript_path.is_some());

        let events = drain(&mut h.events);
        assert!(events.iter().all(|e| e.token().as_str() == "run_test"));
        let data: Vec<_> = events
            .iter()
            .filter(|e| e.event_type() == "data")
            .map(|e| e.content())
            .collect();
        assert_eq!(data, vec!["A", "B"]);
        assert!(events.last().unwrap().is_done());
        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
    }

    #[tokio::test]
    async fn panic_inside_run_ends_in_errored_done() {
        let (tx, mut events) = broadcast::channel(64);
        let runner = JobRunner::new(
            Arc::new(MockProvider::new(vec![MockResponse::text("A")])),
            Arc::new(MockAssetBackend::new()),
            config(false),
            tx,
        )
        .with_sink(Arc::new(PanickingSink));

        let job = Job::new("story", vec![JobItem::text("a")]);
        let report = runner
            .run(&job, CorrelationToken::from_raw("run_panic"), &CancellationToken::new())
            .await;

        assert_eq!(report.result.outcome, RunOutcome::Errored);
        assert_eq!(report.persisted, PersistedRun::default());

        let events = drain(&mut events);
        assert!(events
            .iter()
            .any(|e| e.event_type() == "error" && e.content().contains("disk vanished")));
        match events.last().unwrap() {
            RunEvent::Done { outcome, .. } => assert_eq!(*outcome, RunOutcome::Errored),
            other => panic!("expected done, got {other:?}"),
        }
        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
    }

    #[tokio::test]
    async fn quota_marker_on_first_prompt_errors_without_persisting() {
        let mut h = harness(
            vec![MockResponse::text("You exceeded your current quota"), MockResponse::text("unused")],
            MockAssetBackend::new(),
            config(false),
        );
        let report = run(&h, vec![JobItem::text("a"), JobItem::text("b")]).await;

        assert_eq!(report.result.outcome, RunOutcome::Errored);
        assert!(report.result.history.is_empty());
        assert!(h.sink.runs.lock().is_empty());
        assert_eq!(h.provider.call_count(), 1);

        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| e.event_type() == "error"));
        match events.last().unwrap() {
            RunEvent::Done { outcome, .. } => assert_eq!(*outcome, RunOutcome::Errored),
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hard_block_after_success_keeps_transcript() {
        let h = harness(
            vec![
                MockResponse::text("chapter one"),
                MockResponse::Error(ProviderError::ContentBlocked("PROHIBITED_CONTENT".into())),
                MockResponse::text("never sent"),
            ],
            MockAssetBackend::new(),
            config(false),
        );
        let report = run(
            &h,
            vec![JobItem::text("a"), JobItem::text("b"), JobItem::text("c")],
        )
        .await;

        assert_eq!(report.result.outcome, RunOutcome::Errored);
        assert_eq!(h.provider.call_count(), 2);
        let persisted = h.sink.runs.lock();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].transcript, format!("chapter one{TRANSCRIPT_SEPARATOR}"));
    }

    #[tokio::test]
    async fn file_asset_is_attached_to_next_prompt() {
        let h = harness(
            vec![MockResponse::text("read it"), MockResponse::text("and more")],
            MockAssetBackend::new().with_existing(MockAssetBackend::active("f1.txt", "files/f1")),
            config(false),
        );
        run(
            &h,
            vec![JobItem::file("UploadFiles/f1.txt"), JobItem::text("hello"), JobItem::text("again")],
        )
        .await;

        let requests = h.provider.requests();
        let hello = requests[0].pending_turn().unwrap();
        assert!(hello
            .parts
            .iter()
            .any(|p| matches!(p, Part::FileRef { uri, .. } if uri == "https://mock.test/files/f1")));
        let again = requests[1].pending_turn().unwrap();
        assert_eq!(again.file_refs().count(), 0);
        assert_eq!(h.assets.upload_count(), 0);
    }

    #[tokio::test]
    async fn failed_file_does_not_stop_the_prompt() {
        tokio::time::pause();
        let mut h = harness(
            vec![MockResponse::text("answered anyway")],
            MockAssetBackend::new().with_script("f1.txt", &[AssetState::Failed]),
            config(false),
        );
        let report = run(&h, vec![JobItem::file("f1.txt"), JobItem::text("hello")]).await;

        assert_eq!(report.result.outcome, RunOutcome::Completed);
        let sent = h.provider.requests()[0].pending_turn().unwrap().clone();
        assert_eq!(sent.file_refs().count(), 0);
        assert_eq!(sent.text(), "hello");

        let events = drain(&mut h.events);
        let errors: Vec<_> = events.iter().filter(|e| e.event_type() == "error").collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].content().contains("f1.txt"));
    }

    #[tokio::test]
    async fn skipped_items_have_no_side_effects() {
        let mut h = harness(
            vec![MockResponse::text("only")],
            MockAssetBackend::new(),
            config(false),
        );
        let report = run(
            &h,
            vec![
                JobItem::file("ignored.png").skipped(),
                JobItem::text("skip me").skipped(),
                JobItem::text("send me"),
            ],
        )
        .await;

        assert_eq!(report.result.history.len(), 2);
        assert_eq!(h.provider.call_count(), 1);
        assert_eq!(h.assets.upload_count(), 0);
        let events = drain(&mut h.events);
        assert!(!events.iter().any(|e| e.content().contains("ignored.png")));
    }

    #[tokio::test]
    async fn per_item_failure_continues_the_run() {
        tokio::time::pause();
        let h = harness(
            vec![
                MockResponse::Error(ProviderError::ServiceUnavailable),
                MockResponse::Error(ProviderError::ServiceUnavailable),
                MockResponse::Error(ProviderError::ServiceUnavailable),
                MockResponse::text("second works"),
            ],
            MockAssetBackend::new(),
            config(false),
        );
        let report = run(
            &h,
            vec![JobItem::text("a"), JobItem::text(""), JobItem::text("b")],
        )
        .await;

        assert_eq!(report.result.outcome, RunOutcome::Completed);
        assert_eq!(report.result.successful_turns, 1);
        assert_eq!(report.result.history.len(), 2);
        assert_eq!(h.provider.call_count(), 4);
    }

    #[tokio::test]
    async fn nothing_succeeds_is_errored() {
        let h = harness(
            vec![MockResponse::Error(ProviderError::Authentication("bad key".into()))],
            MockAssetBackend::new(),
            config(false),
        );
        let report = run(&h, vec![JobItem::text("a")]).await;
        assert_eq!(report.result.outcome, RunOutcome::Errored);
        assert!(h.sink.runs.lock().is_empty());
    }

    #[tokio::test]
    async fn pacing_pauses_between_but_not_after_last() {
        tokio::time::pause();
        let mut cfg = config(false);
        cfg.pacing = PacingPolicy::EveryNth {
            n: 2,
            pause: Duration::from_secs(60),
        };

        let h = harness(
            vec![MockResponse::text("1"), MockResponse::text("2")],
            MockAssetBackend::new(),
            cfg.clone(),
        );
        let report = run(&h, vec![JobItem::text("a"), JobItem::text("b")]).await;
        assert!(report.result.elapsed_secs < 60.0);

        let h = harness(
            vec![MockResponse::text("1"), MockResponse::text("2"), MockResponse::text("3")],
            MockAssetBackend::new(),
            cfg,
        );
        let report = run(
            &h,
            vec![JobItem::text("a"), JobItem::text("b"), JobItem::text("c")],
        )
        .await;
        assert!(report.result.elapsed_secs >= 60.0);
    }

    #[tokio::test]
    async fn cancel_during_pause_aborts_and_flushes() {
        tokio::time::pause();
        let mut cfg = config(false);
        cfg.pacing = PacingPolicy::Fixed(Duration::from_secs(60));
        let h = harness(
            vec![MockResponse::text("first"), MockResponse::text("second")],
            MockAssetBackend::new(),
            cfg,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let job = Job::new("story", vec![JobItem::text("a"), JobItem::text("b")]);
        let report = h.runner.run(&job, CorrelationToken::new(), &cancel).await;

        assert_eq!(report.result.outcome, RunOutcome::Aborted);
        assert_eq!(h.provider.call_count(), 1);
        assert_eq!(h.sink.runs.lock()[0].transcript, format!("first{TRANSCRIPT_SEPARATOR}"));
    }

    #[tokio::test]
    async fn cancelled_before_start_aborts_without_calls() {
        let h = harness(vec![], MockAssetBackend::new(), config(true));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let job = Job::new("story", vec![JobItem::text("a")]);
        let report = h.runner.run(&job, CorrelationToken::new(), &cancel).await;
        assert_eq!(report.result.outcome, RunOutcome::Aborted);
        assert_eq!(h.provider.call_count(), 0);
        assert!(h.sink.runs.lock().is_empty());
    }

    #[tokio::test]
    async fn streaming_emits_fragments_and_restart_status() {
        tokio::time::pause();
        let mut h = harness(
            vec![
                MockResponse::FailMidStream(
                    vec!["Hel".into()],
                    ProviderError::StreamInterrupted("reset".into()),
                ),
                MockResponse::chunks(&["Hel", "lo"]),
            ],
            MockAssetBackend::new(),
            config(true),
        );
        let report = run(&h, vec![JobItem::text("hi")]).await;

        assert_eq!(report.result.transcript, format!("Hello{TRANSCRIPT_SEPARATOR}"));
        assert_eq!(report.result.history.len(), 2);
        assert_eq!(report.result.history[1].text(), "Hello");

        let events = drain(&mut h.events);
        let data: Vec<_> = events
            .iter()
            .filter(|e| e.event_type() == "data")
            .map(|e| e.content())
            .collect();
        assert_eq!(data, vec!["Hel", "Hel", "lo"]);
        assert!(events
            .iter()
            .any(|e| e.event_type() == "status" && e.content().contains("attempt 2")));
    }

    #[tokio::test]
    async fn run_job_loads_from_store() {
        let db = Database::in_memory().unwrap();
        let jobs = JobRepo::new(db);
        let id = jobs.save(&Job::new("story", vec![JobItem::text("a")])).unwrap();

        let h = harness(vec![MockResponse::text("A")], MockAssetBackend::new(), config(false));
        let report = h
            .runner
            .run_job(&jobs, id, CorrelationToken::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.result.job_id, Some(id));

        let missing = h
            .runner
            .run_job(&jobs, JobId(999), CorrelationToken::new(), &CancellationToken::new())
            .await;
        assert!(matches!(missing, Err(EngineError::JobNotFound(JobId(999)))));
    }

    #[test]
    fn state_machine_rejects_leaving_terminal_states() {
        assert!(RunState::Idle.advance(RunState::Running).is_ok());
        assert!(RunState::Running.advance(RunState::Completed).is_ok());
        assert!(RunState::Idle.advance(RunState::Completed).is_err());
        assert!(RunState::Completed.advance(RunState::Running).is_err());
        assert!(RunState::Aborted.advance(RunState::Errored).is_err());
    }
}
