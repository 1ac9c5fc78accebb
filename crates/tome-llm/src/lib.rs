pub mod gemini;
pub mod retry;
pub mod sse;

pub mod mock;

pub use gemini::{GeminiConfig, GeminiFiles, GeminiProvider};
pub use retry::{Backoff, RetryDecision, RetryError, RetryPolicy, RetryState};
