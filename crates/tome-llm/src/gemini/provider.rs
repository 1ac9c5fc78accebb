use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use tracing::{debug, instrument};

use tome_core::context::GenerationContext;
use tome_core::errors::ProviderError;
use tome_core::provider::{ContentProvider, EventStream, Generation};
use tome_core::stream::StreamEvent;

use super::converter;
use super::errors::parse_api_error;
use super::types::{GenerateContentRequest, GenerateContentResponse};
use super::{build_client, error_from_response, transport_error, GeminiConfig};
use crate::sse::{ChunkParser, SseStream};

pub struct GeminiProvider {
    client: Client,
    config: GeminiConfig,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client()?,
            config,
        })
    }

    fn endpoint(&self, action: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{}",
            self.config.base_url, self.config.model, action
        )
    }

    async fn post(
        &self,
        url: &str,
        body: &GenerateContentRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", self.config.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(resp)
    }
}

#[async_trait]
impl ContentProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, context), fields(model = %self.config.model, turns = context.turns.len()))]
    async fn generate(&self, context: &GenerationContext) -> Result<Generation, ProviderError> {
        let body = converter::build_request(context);
        let resp = self.post(&self.endpoint("generateContent"), &body).await?;
        let bytes = resp.bytes().await.map_err(transport_error)?;

        let parsed: GenerateContentResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        if let Some(reason) = parsed.block_reason() {
            return Err(ProviderError::ContentBlocked(reason));
        }
        if parsed.candidates.is_empty() {
            return Err(ProviderError::MalformedResponse("response has no candidates".into()));
        }

        let generation = Generation {
            text: parsed.text(),
            finish_reason: parsed.finish_reason().map(str::to_owned),
        };
        debug!(chars = generation.text.chars().count(), "generation complete");
        Ok(generation)
    }

    #[instrument(skip(self, context), fields(model = %self.config.model, turns = context.turns.len()))]
    async fn stream(&self, context: &GenerationContext) -> Result<EventStream, ProviderError> {
        let body = converter::build_request(context);
        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let resp = self.post(&url, &body).await?;

        Ok(Box::pin(SseStream::new(
            resp.bytes_stream(),
            GeminiChunkParser::default(),
        )))
    }
}

/// Parses `streamGenerateContent` SSE payloads. Each payload is a partial
/// `GenerateContentResponse`; the one carrying `finishReason` ends the turn.
#[derive(Default)]
pub struct GeminiChunkParser {
    started: bool,
    finished: bool,
}

impl ChunkParser for GeminiChunkParser {
    fn parse_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }

        let value: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                self.finished = true;
                events.push(StreamEvent::Error {
                    error: ProviderError::MalformedResponse(format!("bad SSE payload: {e}")),
                });
                return events;
            }
        };

        // Errors raised after the 200 header arrive in-band.
        if value.get("error").is_some() {
            self.finished = true;
            let status = value["error"]["code"].as_u64().unwrap_or(500) as u16;
            events.push(StreamEvent::Error {
                error: parse_api_error(status, data),
            });
            return events;
        }

        let chunk: GenerateContentResponse = match serde_json::from_value(value) {
            Ok(c) => c,
            Err(e) => {
                self.finished = true;
                events.push(StreamEvent::Error {
                    error: ProviderError::MalformedResponse(e.to_string()),
                });
                return events;
            }
        };

        if let Some(reason) = chunk.block_reason() {
            self.finished = true;
            events.push(StreamEvent::Error {
                error: ProviderError::ContentBlocked(reason),
            });
            return events;
        }

        let text = chunk.text();
        if !text.is_empty() {
            events.push(StreamEvent::TextDelta { delta: text });
        }
        if let Some(reason) = chunk.finish_reason() {
            self.finished = true;
            events.push(StreamEvent::Done {
                finish_reason: Some(reason.to_string()),
            });
        }
        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let reason = if self.started {
            "stream ended without finishReason"
        } else {
            "stream closed before any data"
        };
        vec![StreamEvent::Error {
            error: ProviderError::StreamInterrupted(reason.into()),
        }]
    }
}
