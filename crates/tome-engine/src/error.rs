use tome_core::errors::ProviderError;
use tome_core::ids::JobId;
use tome_llm::RetryError;
use tome_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {0} already has an active run")]
    AlreadyRunning(JobId),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::runner::RunState,
        to: crate::runner::RunState,
    },

    #[error("{0}")]
    Internal(String),
}

/// Why a file item could not be turned into an active asset. Fatal for that
/// item only.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AssetError {
    #[error("cannot derive an asset name from {0}")]
    InvalidPath(String),

    #[error("asset {0} failed remote processing")]
    Failed(String),

    #[error("asset {name} still pending after {waited_secs}s")]
    TimedOut { name: String, waited_secs: u64 },

    #[error("asset request failed: {0}")]
    Provider(ProviderError),

    #[error("asset request failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ProviderError },

    #[error("cancelled")]
    Cancelled,
}

impl From<RetryError> for AssetError {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Fatal(ProviderError::Cancelled) | RetryError::Cancelled => Self::Cancelled,
            RetryError::Fatal(e) => Self::Provider(e),
            RetryError::Exhausted { attempts, last } => Self::Exhausted { attempts, last },
        }
    }
}

/// Failure of one conversation turn. Nothing is appended to history when a
/// turn fails.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TurnError {
    #[error("empty input: a turn needs prompt text or at least one asset")]
    EmptyInput,

    #[error("asset {0} is not active")]
    InactiveAsset(String),

    #[error("content blocked by provider: {0}")]
    ContentBlocked(String),

    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ProviderError },

    #[error("provider error: {0}")]
    Provider(ProviderError),

    #[error("cancelled")]
    Cancelled,
}

impl TurnError {
    /// Content-policy and quota failures end the whole run.
    pub fn is_hard_block(&self) -> bool {
        matches!(self, Self::ContentBlocked(_) | Self::QuotaExhausted(_))
    }
}

impl From<ProviderError> for TurnError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::ContentBlocked(reason) => Self::ContentBlocked(reason),
            ProviderError::QuotaExhausted(message) => Self::QuotaExhausted(message),
            ProviderError::Cancelled => Self::Cancelled,
            other => Self::Provider(other),
        }
    }
}

impl From<RetryError> for TurnError {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Fatal(e) => e.into(),
            RetryError::Exhausted { attempts, last } => Self::Exhausted { attempts, last },
            RetryError::Cancelled => Self::Cancelled,
        }
    }
}
