use std::time::Duration;

/// Typed error hierarchy for calls against the remote content provider.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    // Fatal: never retried
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("content blocked: {0}")]
    ContentBlocked(String),
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Operational
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::ServiceUnavailable
                | Self::DeadlineExceeded
                | Self::Network(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging and event payloads.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::ContentBlocked(_) => "content_blocked",
            Self::QuotaExhausted(_) => "quota_exhausted",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Network(_) => "network",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Authentication(body),
            404 => Self::NotFound(body),
            400 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            503 => Self::ServiceUnavailable,
            504 => Self::DeadlineExceeded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(ProviderError::ServiceUnavailable.is_retryable());
        assert!(ProviderError::DeadlineExceeded.is_retryable());
        assert!(ProviderError::Network("tcp reset".into()).is_retryable());
        assert!(ProviderError::StreamInterrupted("eof".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(ProviderError::Authentication("bad key".into()).is_fatal());
        assert!(ProviderError::InvalidRequest("bad".into()).is_fatal());
        assert!(ProviderError::ContentBlocked("SAFETY".into()).is_fatal());
        assert!(ProviderError::QuotaExhausted("PerDay".into()).is_fatal());
        assert!(ProviderError::MalformedResponse("no candidates".into()).is_fatal());
        assert!(ProviderError::Cancelled.is_fatal());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(37)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(37)));

        let se = ProviderError::ServerError { status: 500, body: "err".into() };
        assert_eq!(se.suggested_delay(), None);
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            ProviderError::from_status(401, "unauthorized".into()),
            ProviderError::Authentication(_)
        ));
        assert!(matches!(
            ProviderError::from_status(404, "gone".into()),
            ProviderError::NotFound(_)
        ));
        assert!(matches!(
            ProviderError::from_status(429, "slow down".into()),
            ProviderError::RateLimited { retry_after: None }
        ));
        assert!(matches!(
            ProviderError::from_status(503, String::new()),
            ProviderError::ServiceUnavailable
        ));
        assert!(matches!(
            ProviderError::from_status(504, String::new()),
            ProviderError::DeadlineExceeded
        ));
        assert!(ProviderError::from_status(500, "internal".into()).is_retryable());
        assert!(ProviderError::from_status(502, "bad gateway".into()).is_retryable());
        assert!(ProviderError::from_status(418, "teapot".into()).is_fatal());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ProviderError::Cancelled.error_kind(), "cancelled");
        assert_eq!(ProviderError::DeadlineExceeded.error_kind(), "deadline_exceeded");
        assert_eq!(
            ProviderError::RateLimited { retry_after: None }.error_kind(),
            "rate_limited"
        );
    }
}
