use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use tome_core::errors::ProviderError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Delay schedule between attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base * 2^n` plus up to one second of jitter, capped at `ceiling`.
    Exponential {
        base: Duration,
        ceiling: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// 10s, 20s, 40s, 60s, ... with jitter.
    pub fn exponential() -> Self {
        Self::Exponential {
            base: Duration::from_secs(10),
            ceiling: Duration::from_secs(60),
            jitter: true,
        }
    }

    pub fn fixed() -> Self {
        Self::Fixed(Duration::from_secs(10))
    }

    /// Raw delay before retry `n` (0 for the first retry).
    fn raw_delay(&self, n: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential {
                base,
                ceiling,
                jitter,
            } => {
                let exp = base.as_secs_f64() * 2.0_f64.powi(n.min(30) as i32);
                let jitter = if *jitter { rand::random::<f64>() } else { 0.0 };
                Duration::from_secs_f64((exp + jitter).min(ceiling.as_secs_f64()))
            }
        }
    }

    fn ceiling(&self) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { ceiling, .. } => *ceiling,
        }
    }
}

/// Bounded retry around a single provider call.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::exponential(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("{0}")]
    Fatal(ProviderError),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ProviderError },
    #[error("cancelled while retrying")]
    Cancelled,
}

impl RetryError {
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Fatal(e) | Self::Exhausted { last: e, .. } => Some(e),
            Self::Cancelled => None,
        }
    }
}

/// Per-call bookkeeping. Lives for one provider call only.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Failed attempts so far.
    pub attempt: u32,
    pub last_error: Option<ProviderError>,
    last_delay: Duration,
}

pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(RetryError),
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn start(&self) -> RetryState {
        RetryState::default()
    }

    /// Record a failed attempt and decide whether to try again.
    ///
    /// Computed delays never shrink from one retry to the next. A
    /// provider-suggested delay wins over the schedule.
    pub fn on_failure(&self, state: &mut RetryState, error: ProviderError) -> RetryDecision {
        state.attempt += 1;

        if !error.is_retryable() {
            return RetryDecision::GiveUp(RetryError::Fatal(error));
        }
        if state.attempt >= self.max_attempts {
            return RetryDecision::GiveUp(RetryError::Exhausted {
                attempts: state.attempt,
                last: error,
            });
        }

        let delay = match error.suggested_delay() {
            Some(suggested) => suggested,
            None => self
                .backoff
                .raw_delay(state.attempt - 1)
                .max(state.last_delay)
                .min(self.backoff.ceiling()),
        };
        state.last_delay = delay;
        state.last_error = Some(error);
        RetryDecision::RetryAfter(delay)
    }

    /// Run `operation` until it succeeds, fails fatally, exhausts the attempt
    /// budget, or `cancel` fires. The closure receives the 1-based attempt
    /// number.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut state = self.start();
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                r = operation(state.attempt + 1) => r,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match self.on_failure(&mut state, error) {
                RetryDecision::GiveUp(e) => return Err(e),
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        attempt = state.attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = state.last_error.as_ref().map(|e| e.error_kind()).unwrap_or("unknown"),
                        "retrying after error"
                    );
                    if !wait(delay, cancel).await {
                        return Err(RetryError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns false on cancellation.
pub async fn wait(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
