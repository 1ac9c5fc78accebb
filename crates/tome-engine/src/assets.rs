use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tome_core::asset::{logical_name_for, mime_type_for, AssetRef, AssetState};
use tome_core::provider::AssetBackend;
use tome_llm::retry::{self, RetryPolicy};

use crate::error::AssetError;

/// Readiness polling for freshly uploaded assets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetPollConfig {
    pub interval: Duration,
    /// Total time an upload may stay pending before the item is given up.
    pub max_wait: Duration,
}

impl Default for AssetPollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(600),
        }
    }
}

/// Resolves local files into active remote assets.
///
/// Each logical name (the file's basename) is resolved at most once per
/// store: later requests for the same name reuse the first active asset.
/// The remote index is consulted before uploading, so an asset that is
/// already active remotely is never uploaded again.
pub struct AssetStore {
    backend: Arc<dyn AssetBackend>,
    retry: RetryPolicy,
    poll: AssetPollConfig,
    resolved: Mutex<HashMap<String, AssetRef>>,
}

impl AssetStore {
    pub fn new(backend: Arc<dyn AssetBackend>, retry: RetryPolicy, poll: AssetPollConfig) -> Self {
        Self {
            backend,
            retry,
            poll,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, path: &Path, cancel: &CancellationToken) -> Result<AssetRef, AssetError> {
        self.resolve_all(&[path], cancel)
            .await
            .pop()
            .unwrap_or(Err(AssetError::Cancelled))
    }

    /// Resolve several files, polling every pending upload together.
    /// Results come back in input order.
    #[instrument(skip_all, fields(count = paths.len()))]
    pub async fn resolve_all<P: AsRef<Path>>(
        &self,
        paths: &[P],
        cancel: &CancellationToken,
    ) -> Vec<Result<AssetRef, AssetError>> {
        let mut results: Vec<Option<Result<AssetRef, AssetError>>> = paths.iter().map(|_| None).collect();
        let mut remote: Option<Vec<AssetRef>> = None;
        // Uploads still settling, with every input index waiting on each.
        let mut uploads: Vec<(Vec<usize>, AssetRef)> = Vec::new();

        for (i, path) in paths.iter().enumerate() {
            let path = path.as_ref();
            let Some(name) = logical_name_for(path) else {
                results[i] = Some(Err(AssetError::InvalidPath(path.display().to_string())));
                continue;
            };

            let cached = self.resolved.lock().get(&name).cloned();
            if let Some(hit) = cached {
                debug!(logical_name = %name, "asset already resolved in this run");
                results[i] = Some(Ok(hit));
                continue;
            }
            if let Some((waiters, _)) = uploads.iter_mut().find(|(_, a)| a.logical_name == name) {
                waiters.push(i);
                continue;
            }

            if remote.is_none() {
                remote = Some(self.remote_index(cancel).await);
            }
            let existing = remote
                .iter()
                .flatten()
                .find(|a| a.logical_name == name && a.is_active())
                .cloned();
            if let Some(hit) = existing {
                info!(logical_name = %name, remote_id = %hit.remote_id, "reusing active remote asset");
                self.remember(&hit);
                results[i] = Some(Ok(hit));
                continue;
            }

            match self.upload(path, &name, cancel).await {
                Ok(asset) => uploads.push((vec![i], asset)),
                Err(e) => results[i] = Some(Err(e)),
            }
        }

        let pending: Vec<AssetRef> = uploads.iter().map(|(_, a)| a.clone()).collect();
        let settled = self.await_ready(pending, cancel).await;
        for ((waiters, _), outcome) in uploads.into_iter().zip(settled) {
            if let Ok(asset) = &outcome {
                self.remember(asset);
            }
            for i in waiters {
                results[i] = Some(outcome.clone());
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(AssetError::Cancelled)))
            .collect()
    }

    fn remember(&self, asset: &AssetRef) {
        self.resolved
            .lock()
            .entry(asset.logical_name.clone())
            .or_insert_with(|| asset.clone());
    }

    /// Remote index snapshot. A failed listing degrades to uploading.
    async fn remote_index(&self, cancel: &CancellationToken) -> Vec<AssetRef> {
        let backend = &self.backend;
        match self.retry.execute(cancel, move |_| backend.list()).await {
            Ok(assets) => assets,
            Err(e) => {
                warn!(error = %e, "remote asset listing failed, uploading without dedup");
                Vec::new()
            }
        }
    }

    async fn upload(&self, path: &Path, name: &str, cancel: &CancellationToken) -> Result<AssetRef, AssetError> {
        let backend = &self.backend;
        let mime_type = mime_type_for(path);
        let asset = self
            .retry
            .execute(cancel, move |_| backend.upload(path, name, mime_type))
            .await?;
        info!(logical_name = name, remote_id = %asset.remote_id, "asset uploaded");
        Ok(asset)
    }

    /// Poll until every asset is ACTIVE or FAILED, the wait budget runs out,
    /// or `cancel` fires. Outcomes are in input order.
    async fn await_ready(
        &self,
        assets: Vec<AssetRef>,
        cancel: &CancellationToken,
    ) -> Vec<Result<AssetRef, AssetError>> {
        let mut outcomes: Vec<Option<Result<AssetRef, AssetError>>> = assets.iter().map(|_| None).collect();
        let mut pending: Vec<(usize, AssetRef)> = assets.into_iter().enumerate().collect();
        let started = Instant::now();

        loop {
            pending.retain(|(i, asset)| match asset.state {
                AssetState::Active => {
                    outcomes[*i] = Some(Ok(asset.clone()));
                    false
                }
                AssetState::Failed => {
                    warn!(logical_name = %asset.logical_name, "asset processing failed");
                    outcomes[*i] = Some(Err(AssetError::Failed(asset.logical_name.clone())));
                    false
                }
                AssetState::Pending => true,
            });
            if pending.is_empty() {
                break;
            }

            if started.elapsed() >= self.poll.max_wait {
                for (i, asset) in pending.drain(..) {
                    warn!(logical_name = %asset.logical_name, "asset readiness timed out");
                    outcomes[i] = Some(Err(AssetError::TimedOut {
                        name: asset.logical_name,
                        waited_secs: self.poll.max_wait.as_secs(),
                    }));
                }
                break;
            }

            debug!(pending = pending.len(), "waiting for assets to become active");
            if !retry::wait(self.poll.interval, cancel).await {
                for (i, _) in pending.drain(..) {
                    outcomes[i] = Some(Err(AssetError::Cancelled));
                }
                break;
            }

            let mut next = Vec::with_capacity(pending.len());
            for (i, asset) in pending {
                let backend = &self.backend;
                let remote_id = asset.remote_id.as_str();
                match self.retry.execute(cancel, move |_| backend.get(remote_id)).await {
                    Ok(fresh) => next.push((i, fresh)),
                    Err(e) => outcomes[i] = Some(Err(e.into())),
                }
            }
            pending = next;
        }

        outcomes
            .into_iter()
            .map(|o| o.unwrap_or(Err(AssetError::Cancelled)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tome_core::errors::ProviderError;
    use tome_llm::mock::MockAssetBackend;
    use tome_llm::retry::Backoff;

    fn store(backend: Arc<MockAssetBackend>) -> AssetStore {
        AssetStore::new(
            backend,
            RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(10))),
            AssetPollConfig::default(),
        )
    }

    #[tokio::test]
    async fn second_resolve_reuses_first_upload() {
        tokio::time::pause();
        let backend = Arc::new(MockAssetBackend::new().with_script("outline.txt", &[AssetState::Pending]));
        let store = store(Arc::clone(&backend));
        let cancel = CancellationToken::new();

        let first = store.resolve(Path::new("job/UploadFiles/outline.txt"), &cancel).await.unwrap();
        let second = store.resolve(Path::new("other/outline.txt"), &cancel).await.unwrap();

        assert!(first.is_active());
        assert_eq!(first.remote_id, second.remote_id);
        assert_eq!(backend.upload_count(), 1);
    }

    #[tokio::test]
    async fn active_remote_asset_is_not_reuploaded() {
        let backend = Arc::new(
            MockAssetBackend::new().with_existing(MockAssetBackend::active("cover.png", "files/cover")),
        );
        let store = store(Arc::clone(&backend));

        let asset = store
            .resolve(Path::new("UploadFiles/cover.png"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(asset.remote_id, "files/cover");
        assert_eq!(backend.upload_count(), 0);
        assert_eq!(backend.get_count(), 0);
    }

    #[tokio::test]
    async fn failed_processing_is_fatal_for_the_item() {
        tokio::time::pause();
        let backend = Arc::new(
            MockAssetBackend::new().with_script("bad.pdf", &[AssetState::Pending, AssetState::Failed]),
        );
        let err = store(backend)
            .resolve(Path::new("bad.pdf"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AssetError::Failed(ref name) if name == "bad.pdf"));
    }

    #[tokio::test]
    async fn pending_forever_times_out() {
        tokio::time::pause();
        let backend = Arc::new(MockAssetBackend::new().with_script("slow.txt", &[AssetState::Pending; 500]));
        let started = Instant::now();
        let err = store(backend)
            .resolve(Path::new("slow.txt"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AssetError::TimedOut { waited_secs: 600, .. }));
        assert!(started.elapsed() >= Duration::from_secs(600));
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        tokio::time::pause();
        let backend = Arc::new(MockAssetBackend::new().with_script("slow.txt", &[AssetState::Pending; 500]));
        let store = store(backend);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let err = store.resolve(Path::new("slow.txt"), &cancel).await.unwrap_err();
        assert!(matches!(err, AssetError::Cancelled));
    }

    #[tokio::test]
    async fn batch_keeps_order_and_isolates_failures() {
        tokio::time::pause();
        let backend = Arc::new(
            MockAssetBackend::new()
                .with_script("a.txt", &[AssetState::Pending, AssetState::Pending])
                .with_script("b.txt", &[AssetState::Failed])
                .with_failing_upload("c.txt", ProviderError::InvalidRequest("too large".into())),
        );
        let store = store(Arc::clone(&backend));
        let paths = vec![
            PathBuf::from("a.txt"),
            PathBuf::from("b.txt"),
            PathBuf::from("c.txt"),
            PathBuf::from("dir/a.txt"),
        ];

        let results = store.resolve_all(&paths, &CancellationToken::new()).await;
        assert_eq!(results.len(), 4);
        assert!(results[0].as_ref().unwrap().is_active());
        assert!(matches!(results[1], Err(AssetError::Failed(_))));
        assert!(matches!(results[2], Err(AssetError::Provider(ProviderError::InvalidRequest(_)))));
        assert_eq!(
            results[3].as_ref().unwrap().remote_id,
            results[0].as_ref().unwrap().remote_id
        );
        assert_eq!(backend.upload_count(), 2);
    }
}
