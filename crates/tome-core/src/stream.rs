use crate::errors::ProviderError;

/// Events emitted while a provider streams a response.
///
/// Start → TextDelta* → Done, with Error possible at any point.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,
    TextDelta { delta: String },
    Done { finish_reason: Option<String> },
    Error { error: ProviderError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
