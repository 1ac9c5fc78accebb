pub mod converter;
pub mod errors;
pub mod files;
pub mod provider;
pub mod types;

use std::time::Duration;

use reqwest::Client;
use secrecy::SecretString;

use tome_core::errors::ProviderError;

pub use files::GeminiFiles;
pub use provider::GeminiProvider;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings shared by the generation and Files API clients.
#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub api_key: SecretString,
    pub model: String,
    /// Scheme and host only; API paths are appended.
    pub base_url: String,
}

impl GeminiConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

fn build_client() -> Result<Client, ProviderError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::Network(format!("failed to build HTTP client: {e}")))
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::DeadlineExceeded
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Turn a non-success response into a classified error.
async fn error_from_response(resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    errors::parse_api_error(status, &body)
}
