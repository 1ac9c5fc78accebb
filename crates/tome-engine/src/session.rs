use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use tome_core::asset::AssetRef;
use tome_core::context::{GenerationContext, GenerationOptions};
use tome_core::errors::ProviderError;
use tome_core::messages::Turn;
use tome_core::provider::ContentProvider;
use tome_core::stream::StreamEvent;
use tome_llm::retry::{self, RetryDecision, RetryPolicy};

use crate::error::TurnError;
use crate::markers::{HardBlock, HardBlockMarkers};

/// One item of a streamed turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnFragment {
    Text(String),
    /// The previous attempt failed and the response is being generated again
    /// from scratch. Text received before this fragment is superseded.
    Restarted { attempt: u32 },
}

/// Ordered, append-only conversation with one provider.
///
/// A turn's user and assistant messages are appended together once the
/// response is complete, so a failed turn leaves history untouched.
pub struct ConversationSession {
    provider: Arc<dyn ContentProvider>,
    system_instruction: String,
    options: GenerationOptions,
    retry: RetryPolicy,
    markers: HardBlockMarkers,
    history: Vec<Turn>,
}

impl ConversationSession {
    pub fn new(
        provider: Arc<dyn ContentProvider>,
        system_instruction: impl Into<String>,
        options: GenerationOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            system_instruction: system_instruction.into(),
            options,
            retry,
            markers: HardBlockMarkers::default(),
            history: Vec::new(),
        }
    }

    /// Start from an earlier conversation.
    pub fn with_history(mut self, seed: Vec<Turn>) -> Self {
        self.history = seed;
        self
    }

    pub fn with_markers(mut self, markers: HardBlockMarkers) -> Self {
        self.markers = markers;
        self
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    /// Send one turn and wait for the complete response.
    #[instrument(skip_all, fields(turn = self.history.len() / 2 + 1, assets = assets.len()))]
    pub async fn send_turn(
        &mut self,
        text: &str,
        assets: &[AssetRef],
        cancel: &CancellationToken,
    ) -> Result<String, TurnError> {
        let (user, context) = self.prepare(text, assets)?;

        let provider = &self.provider;
        let ctx = &context;
        let generation = self
            .retry
            .execute(cancel, move |_| provider.generate(ctx))
            .await?;

        self.check_markers(&generation.text)?;
        debug!(chars = generation.text.chars().count(), "turn complete");
        self.commit(user, generation.text.clone());
        Ok(generation.text)
    }

    /// Send one turn and yield the response as it arrives.
    ///
    /// A retryable failure mid-stream restarts the whole turn: the stream
    /// yields `Restarted` and then the new attempt's text from the beginning.
    /// History gains the final attempt's full text as one assistant turn once
    /// the stream completes; if the stream is dropped early nothing is
    /// appended.
    pub fn send_turn_streaming<'a>(
        &'a mut self,
        text: &'a str,
        assets: &'a [AssetRef],
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = Result<TurnFragment, TurnError>> + Send + 'a {
        async_stream::stream! {
            let (user, context) = match self.prepare(text, assets) {
                Ok(prepared) => prepared,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut state = self.retry.start();
            let mut attempt = 1u32;

            let response = 'attempts: loop {
                if cancel.is_cancelled() {
                    yield Err(TurnError::Cancelled);
                    return;
                }

                let mut accumulated = String::new();
                let opened = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    opened = self.provider.stream(&context) => Some(opened),
                };
                let Some(opened) = opened else {
                    yield Err(TurnError::Cancelled);
                    return;
                };
                let failure = match opened {
                    Err(e) => e,
                    Ok(mut events) => loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            event = events.next() => Some(event),
                        };
                        match next {
                            None => {
                                yield Err(TurnError::Cancelled);
                                return;
                            }
                            Some(Some(StreamEvent::Start)) => {}
                            Some(Some(StreamEvent::TextDelta { delta })) => {
                                accumulated.push_str(&delta);
                                yield Ok(TurnFragment::Text(delta));
                            }
                            Some(Some(StreamEvent::Done { .. })) => break 'attempts accumulated,
                            Some(Some(StreamEvent::Error { error })) => break error,
                            Some(None) => {
                                break ProviderError::StreamInterrupted(
                                    "stream ended without completion".into(),
                                );
                            }
                        }
                    },
                };

                match self.retry.on_failure(&mut state, failure) {
                    RetryDecision::GiveUp(e) => {
                        yield Err(e.into());
                        return;
                    }
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            attempt = state.attempt,
                            max_attempts = self.retry.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = state.last_error.as_ref().map(|e| e.error_kind()).unwrap_or("unknown"),
                            partial_chars = accumulated.chars().count(),
                            "restarting streamed turn"
                        );
                        if !retry::wait(delay, cancel).await {
                            yield Err(TurnError::Cancelled);
                            return;
                        }
                        attempt += 1;
                        yield Ok(TurnFragment::Restarted { attempt });
                    }
                }
            };

            if let Err(e) = self.check_markers(&response) {
                yield Err(e);
                return;
            }
            debug!(chars = response.chars().count(), attempts = attempt, "streamed turn complete");
            self.commit(user, response);
        }
    }

    fn prepare(&self, text: &str, assets: &[AssetRef]) -> Result<(Turn, GenerationContext), TurnError> {
        if text.trim().is_empty() && assets.is_empty() {
            return Err(TurnError::EmptyInput);
        }
        if let Some(inactive) = assets.iter().find(|a| !a.is_active()) {
            return Err(TurnError::InactiveAsset(inactive.logical_name.clone()));
        }

        let user = Turn::user(text, assets);
        let mut turns = Vec::with_capacity(self.history.len() + 1);
        turns.extend_from_slice(&self.history);
        turns.push(user.clone());

        Ok((
            user,
            GenerationContext {
                system_instruction: self.system_instruction.clone(),
                turns,
                options: self.options.clone(),
            },
        ))
    }

    fn check_markers(&self, response: &str) -> Result<(), TurnError> {
        match self.markers.detect(response) {
            None => Ok(()),
            Some(HardBlock::ContentPolicy(marker)) => Err(TurnError::ContentBlocked(marker)),
            Some(HardBlock::Quota(marker)) => Err(TurnError::QuotaExhausted(marker)),
        }
    }

    fn commit(&mut self, user: Turn, response: String) {
        self.history.push(user);
        self.history.push(Turn::assistant(response));
    }
}
