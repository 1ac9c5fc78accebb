use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::asset::AssetRef;
use crate::context::GenerationContext;
use crate::errors::ProviderError;
use crate::stream::StreamEvent;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A complete, buffered response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub finish_reason: Option<String>,
}

/// A remote content-generation endpoint. Content-policy refusals surface as
/// `ProviderError::ContentBlocked`.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn generate(&self, context: &GenerationContext) -> Result<Generation, ProviderError>;

    async fn stream(&self, context: &GenerationContext) -> Result<EventStream, ProviderError>;
}

/// Remote asset index and upload endpoint.
#[async_trait]
pub trait AssetBackend: Send + Sync {
    /// Every asset currently known to the remote index.
    async fn list(&self) -> Result<Vec<AssetRef>, ProviderError>;

    /// Submit a new upload tagged with `logical_name`. The returned reference
    /// is usually still `Pending`.
    async fn upload(
        &self,
        path: &Path,
        logical_name: &str,
        mime_type: &str,
    ) -> Result<AssetRef, ProviderError>;

    /// Current state of one asset.
    async fn get(&self, remote_id: &str) -> Result<AssetRef, ProviderError>;
}
