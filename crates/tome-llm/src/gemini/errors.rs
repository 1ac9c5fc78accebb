use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use tome_core::errors::ProviderError;

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<Value>,
}

/// Map a non-success Gemini response onto the provider error taxonomy.
///
/// Body shape: `{"error":{"code":429,"message":"..","status":"RESOURCE_EXHAUSTED",
/// "details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"37s"}]}}`.
pub fn parse_api_error(status: u16, body: &str) -> ProviderError {
    let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) else {
        return ProviderError::from_status(status, body.to_string());
    };
    let detail = parsed.error;
    let message = detail.message.unwrap_or_else(|| body.to_string());

    match detail.status.as_deref() {
        Some("RESOURCE_EXHAUSTED") if daily_quota(&detail.details) => {
            ProviderError::QuotaExhausted(message)
        }
        Some("RESOURCE_EXHAUSTED") => ProviderError::RateLimited {
            retry_after: retry_delay(&detail.details),
        },
        Some("UNAVAILABLE") => ProviderError::ServiceUnavailable,
        Some("DEADLINE_EXCEEDED") => ProviderError::DeadlineExceeded,
        Some("INTERNAL") => ProviderError::ServerError {
            status,
            body: message,
        },
        Some("UNAUTHENTICATED" | "PERMISSION_DENIED") => ProviderError::Authentication(message),
        Some("NOT_FOUND") => ProviderError::NotFound(message),
        Some("INVALID_ARGUMENT" | "FAILED_PRECONDITION") => ProviderError::InvalidRequest(message),
        _ => match ProviderError::from_status(status, message) {
            ProviderError::RateLimited { .. } => ProviderError::RateLimited {
                retry_after: retry_delay(&detail.details),
            },
            other => other,
        },
    }
}

/// A per-day quota violation will not clear within any retry window.
fn daily_quota(details: &[Value]) -> bool {
    details
        .iter()
        .filter_map(|d| d.get("violations").and_then(Value::as_array))
        .flatten()
        .filter_map(|v| v.get("quotaId").and_then(Value::as_str))
        .any(|id| id.contains("PerDay"))
}

/// `RetryInfo.retryDelay` from the error details, e.g. `"37s"` or `"1.5s"`.
fn retry_delay(details: &[Value]) -> Option<Duration> {
    details
        .iter()
        .filter_map(|d| d.get("retryDelay").and_then(Value::as_str))
        .find_map(parse_duration)
}

fn parse_duration(s: &str) -> Option<Duration> {
    let secs: f64 = s.strip_suffix('s')?.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}
