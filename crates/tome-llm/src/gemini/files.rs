use std::path::Path;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::{debug, info, instrument};

use tome_core::asset::{AssetRef, AssetState};
use tome_core::errors::ProviderError;
use tome_core::provider::AssetBackend;

use super::types::{GeminiFile, ListFilesResponse, UploadFileResponse};
use super::{build_client, error_from_response, transport_error, GeminiConfig};

const PAGE_SIZE: u32 = 100;

/// Gemini Files API client: the remote asset index.
pub struct GeminiFiles {
    client: Client,
    config: GeminiConfig,
}

impl GeminiFiles {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client()?,
            config,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let resp = self
            .client
            .get(url)
            .header("x-goog-api-key", self.config.api_key.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let bytes = resp.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&bytes).map_err(|e| ProviderError::MalformedResponse(e.to_string()))
    }
}

/// Anything other than ACTIVE or FAILED is still processing.
fn map_state(state: Option<&str>) -> AssetState {
    match state {
        Some("ACTIVE") => AssetState::Active,
        Some("FAILED") => AssetState::Failed,
        _ => AssetState::Pending,
    }
}

fn to_asset_ref(file: GeminiFile, fallback_name: Option<&str>) -> AssetRef {
    let logical_name = file
        .display_name
        .clone()
        .or_else(|| fallback_name.map(str::to_owned))
        .unwrap_or_else(|| file.name.clone());
    AssetRef {
        logical_name,
        mime_type: file
            .mime_type
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        uri: file.uri.unwrap_or_default(),
        state: map_state(file.state.as_deref()),
        remote_id: file.name,
    }
}

#[async_trait]
impl AssetBackend for GeminiFiles {
    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<AssetRef>, ProviderError> {
        let url = format!("{}/v1beta/files", self.config.base_url);
        let mut assets = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("pageSize", PAGE_SIZE.to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let page: ListFilesResponse = self.get_json(&url, &query).await?;
            assets.extend(page.files.into_iter().map(|f| to_asset_ref(f, None)));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(count = assets.len(), "listed remote assets");
        Ok(assets)
    }

    #[instrument(skip(self, path), fields(path = %path.display()))]
    async fn upload(
        &self,
        path: &Path,
        logical_name: &str,
        mime_type: &str,
    ) -> Result<AssetRef, ProviderError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ProviderError::InvalidRequest(format!("read {}: {e}", path.display())))?;
        let key = self.config.api_key.expose_secret();

        // Resumable protocol: open a session, then send the bytes in one go.
        let start = self
            .client
            .post(format!("{}/upload/v1beta/files", self.config.base_url))
            .header("x-goog-api-key", key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", data.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": logical_name } }))
            .send()
            .await
            .map_err(transport_error)?;
        if !start.status().is_success() {
            return Err(error_from_response(start).await);
        }

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                ProviderError::MalformedResponse("upload session has no x-goog-upload-url".into())
            })?;

        let size = data.len();
        let finish = self
            .client
            .post(&upload_url)
            .header("x-goog-api-key", key)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(data)
            .send()
            .await
            .map_err(transport_error)?;
        if !finish.status().is_success() {
            return Err(error_from_response(finish).await);
        }

        let bytes = finish.bytes().await.map_err(transport_error)?;
        let uploaded: UploadFileResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        let asset = to_asset_ref(uploaded.file, Some(logical_name));

        info!(
            logical_name,
            remote_id = %asset.remote_id,
            bytes = size,
            "asset uploaded"
        );
        Ok(asset)
    }

    #[instrument(skip(self))]
    async fn get(&self, remote_id: &str) -> Result<AssetRef, ProviderError> {
        let url = format!("{}/v1beta/{}", self.config.base_url, remote_id);
        let file: GeminiFile = self.get_json(&url, &[]).await?;
        Ok(to_asset_ref(file, None))
    }
}
