use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use tome_core::asset::{AssetRef, AssetState};
use tome_core::context::GenerationContext;
use tome_core::errors::ProviderError;
use tome_core::provider::{AssetBackend, ContentProvider, EventStream, Generation};
use tome_core::stream::StreamEvent;

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    /// Respond with these chunks; buffered calls get their concatenation.
    Chunks(Vec<String>),
    /// Fail the call itself.
    Error(ProviderError),
    /// Stream the chunks, then fail mid-stream. Buffered calls just fail.
    FailMidStream(Vec<String>, ProviderError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Chunks(vec![text.to_string()])
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        Self::Chunks(chunks.iter().map(|c| c.to_string()).collect())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records every context it was called with.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<GenerationContext>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Contexts received so far, in call order.
    pub fn requests(&self) -> Vec<GenerationContext> {
        self.requests.lock().clone()
    }

    async fn next_response(&self, context: &GenerationContext) -> Result<MockResponse, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(context.clone());

        let mut response = self.responses.lock().pop_front().ok_or_else(|| {
            ProviderError::InvalidRequest(format!("MockProvider: no response configured for call {idx}"))
        })?;
        while let MockResponse::Delay(duration, inner) = response {
            tokio::time::sleep(duration).await;
            response = *inner;
        }
        Ok(response)
    }
}

#[async_trait]
impl ContentProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn generate(&self, context: &GenerationContext) -> Result<Generation, ProviderError> {
        match self.next_response(context).await? {
            MockResponse::Chunks(chunks) => Ok(Generation {
                text: chunks.concat(),
                finish_reason: Some("STOP".into()),
            }),
            MockResponse::Error(e) | MockResponse::FailMidStream(_, e) => Err(e),
            MockResponse::Delay(..) => unreachable!("delays are unwrapped in next_response"),
        }
    }

    async fn stream(&self, context: &GenerationContext) -> Result<EventStream, ProviderError> {
        let (chunks, tail) = match self.next_response(context).await? {
            MockResponse::Chunks(chunks) => (
                chunks,
                StreamEvent::Done {
                    finish_reason: Some("STOP".into()),
                },
            ),
            MockResponse::FailMidStream(chunks, error) => (chunks, StreamEvent::Error { error }),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(..) => unreachable!("delays are unwrapped in next_response"),
        };

        let mut events = vec![StreamEvent::Start];
        events.extend(chunks.into_iter().map(|delta| StreamEvent::TextDelta { delta }));
        events.push(tail);
        Ok(Box::pin(stream::iter(events)))
    }
}

/// In-memory asset index with scripted readiness transitions.
///
/// Every `get` pops the next scripted state for that asset's logical name;
/// once the script is empty the asset reports `Active`.
#[derive(Default)]
pub struct MockAssetBackend {
    index: Mutex<Vec<AssetRef>>,
    scripts: Mutex<HashMap<String, VecDeque<AssetState>>>,
    failing_uploads: Mutex<HashMap<String, ProviderError>>,
    upload_count: AtomicUsize,
    get_count: AtomicUsize,
}

impl MockAssetBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the remote index with an existing asset.
    pub fn with_existing(self, asset: AssetRef) -> Self {
        self.index.lock().push(asset);
        self
    }

    /// States reported by successive polls of `logical_name`.
    pub fn with_script(self, logical_name: &str, states: &[AssetState]) -> Self {
        self.scripts
            .lock()
            .insert(logical_name.to_string(), states.iter().copied().collect());
        self
    }

    pub fn with_failing_upload(self, logical_name: &str, error: ProviderError) -> Self {
        self.failing_uploads
            .lock()
            .insert(logical_name.to_string(), error);
        self
    }

    pub fn upload_count(&self) -> usize {
        self.upload_count.load(Ordering::Relaxed)
    }

    pub fn get_count(&self) -> usize {
        self.get_count.load(Ordering::Relaxed)
    }

    pub fn active(logical_name: &str, remote_id: &str) -> AssetRef {
        AssetRef {
            logical_name: logical_name.to_string(),
            remote_id: remote_id.to_string(),
            mime_type: "text/plain".to_string(),
            uri: format!("https://mock.test/{remote_id}"),
            state: AssetState::Active,
        }
    }
}

#[async_trait]
impl AssetBackend for MockAssetBackend {
    async fn list(&self) -> Result<Vec<AssetRef>, ProviderError> {
        Ok(self.index.lock().clone())
    }

    async fn upload(
        &self,
        _path: &Path,
        logical_name: &str,
        mime_type: &str,
    ) -> Result<AssetRef, ProviderError> {
        if let Some(error) = self.failing_uploads.lock().get(logical_name) {
            return Err(error.clone());
        }
        let n = self.upload_count.fetch_add(1, Ordering::Relaxed) + 1;
        let remote_id = format!("files/{logical_name}-{n}");
        let asset = AssetRef {
            logical_name: logical_name.to_string(),
            uri: format!("https://mock.test/{remote_id}"),
            remote_id,
            mime_type: mime_type.to_string(),
            state: AssetState::Pending,
        };
        self.index.lock().push(asset.clone());
        Ok(asset)
    }

    async fn get(&self, remote_id: &str) -> Result<AssetRef, ProviderError> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        let mut index = self.index.lock();
        let asset = index
            .iter_mut()
            .find(|a| a.remote_id == remote_id)
            .ok_or_else(|| ProviderError::NotFound(remote_id.to_string()))?;

        let next = self
            .scripts
            .lock()
            .get_mut(&asset.logical_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(AssetState::Active);
        asset.state = next;
        Ok(asset.clone())
    }
}
