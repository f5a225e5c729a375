use std::{collections::HashMap, path::PathBuf, sync::Arc};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::events::{self, EventBus};
use crate::error::ChatError;

use super::{
    catalog::{ModelCatalog, ModelStatus},
    download::{DownloadHandle, Downloader},
};

/// Bookkeeping for one running download. The worker owns the matching
/// progress sender and drops it once its final status has been emitted.
struct InFlight {
    target: PathBuf,
    cancel: CancellationToken,
    progress: watch::Receiver<f32>,
}

/// Background downloads, at most one per model id and per local file.
#[derive(Clone)]
pub struct ModelDownloadService {
    catalog: Arc<ModelCatalog>,
    downloader: Downloader,
    bus: EventBus,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
}

impl ModelDownloadService {
    pub fn new(catalog: Arc<ModelCatalog>, downloader: Downloader, bus: EventBus) -> Self {
        Self {
            catalog,
            downloader,
            bus,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts downloading `id` unless a download for it is already running,
    /// in which case `false` is returned and nothing changes.
    pub fn queue(&self, id: &str) -> crate::Result<bool> {
        let descriptor = self
            .catalog
            .descriptor(id)
            .ok_or_else(|| ChatError::NotFound(format!("model {id}")))?;

        let target = self.downloader.target_path(&descriptor);
        let (handle, progress) = {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(id) {
                tracing::debug!("Download for {id} already in flight");
                return Ok(false);
            }
            if let Some((other, _)) = in_flight.iter().find(|(_, job)| job.target == target) {
                tracing::warn!("{id} shares {} with running download {other}", target.display());
                return Ok(false);
            }
            let handle = self.downloader.acquire(&descriptor);
            let (progress_tx, progress_rx) = watch::channel(0.0);
            in_flight.insert(
                id.to_string(),
                InFlight {
                    target,
                    cancel: handle.cancellation_token(),
                    progress: progress_rx,
                },
            );
            (handle, progress_tx)
        };

        events::emit_model_status(&self.bus, id, ModelStatus::Downloading { progress: 0.0 });
        tokio::spawn(worker(self.clone(), id.to_string(), handle, progress));
        Ok(true)
    }

    pub fn cancel(&self, id: &str) -> bool {
        match self.in_flight.lock().get(id) {
            Some(job) => {
                tracing::info!("Cancelling download for {id}");
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels the download for `id`, if any, and waits until its worker has
    /// settled the file and emitted its final status. A transfer already
    /// past its last chunk may still install the file.
    pub async fn cancel_and_wait(&self, id: &str) -> bool {
        let mut progress = match self.in_flight.lock().get(id) {
            Some(job) => {
                tracing::info!("Cancelling download for {id}");
                job.cancel.cancel();
                job.progress.clone()
            }
            None => return false,
        };
        while progress.changed().await.is_ok() {}
        true
    }

    #[must_use]
    pub fn is_downloading(&self, id: &str) -> bool {
        self.in_flight.lock().contains_key(id)
    }

    #[must_use]
    pub fn status(&self, id: &str) -> ModelStatus {
        if let Some(job) = self.in_flight.lock().get(id) {
            return ModelStatus::Downloading {
                progress: *job.progress.borrow(),
            };
        }
        match self.catalog.descriptor(id) {
            Some(descriptor) if self.catalog.is_downloaded(&descriptor) => ModelStatus::Installed,
            _ => ModelStatus::NotInstalled,
        }
    }
}

async fn worker(
    service: ModelDownloadService,
    id: String,
    mut handle: DownloadHandle,
    progress: watch::Sender<f32>,
) {
    while let Some(snapshot) = handle.next().await {
        on_progress(&service, &id, &progress, snapshot.ratio);
    }
    let result = handle.finish().await;
    service.in_flight.lock().remove(&id);

    match result {
        Ok(path) => on_download_success(&service, &id, &path),
        Err(ChatError::Cancelled) => {
            tracing::info!("Download for {id} cancelled");
            events::emit_model_status(&service.bus, &id, ModelStatus::NotInstalled);
        }
        Err(error) => on_download_failure(&service, &id, error),
    }
    // Closing the channel releases anyone in `cancel_and_wait`.
    drop(progress);
}

fn on_progress(service: &ModelDownloadService, id: &str, latest: &watch::Sender<f32>, ratio: f64) {
    let progress = ratio.clamp(0.0, 1.0) as f32;
    latest.send_replace(progress);
    events::emit_model_status(&service.bus, id, ModelStatus::Downloading { progress });
}

fn on_download_success(service: &ModelDownloadService, id: &str, path: &std::path::Path) {
    tracing::info!("Model {id} installed at {}", path.display());
    events::emit_model_status(&service.bus, id, ModelStatus::Installed);
}

fn on_download_failure(service: &ModelDownloadService, id: &str, error: ChatError) {
    tracing::error!("Download for {id} failed: {error}");
    events::emit_model_status(&service.bus, id, ModelStatus::Error(error.to_string()));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::events::AppEvent;
    use crate::models::{ArtifactDescriptor, CustomModelStore, DownloadOptions};
    use crate::testing::{FakeArtifact, FakeSource};

    const URL: &str = "https://huggingface.co/acme/tiny-GGUF/resolve/main/tiny.gguf";

    struct Fixture {
        _dir: tempfile::TempDir,
        source: Arc<FakeSource>,
        service: ModelDownloadService,
        bus: EventBus,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let models_dir = dir.path().join("models");
        let source = Arc::new(FakeSource::new());
        let builtin = vec![ArtifactDescriptor {
            id: "tiny".into(),
            name: "Tiny".into(),
            url: URL.into(),
            filename: "tiny.gguf".into(),
            size_label: "4 KB".into(),
            sha256: None,
            custom: false,
            author: None,
            last_updated: None,
        }];
        let catalog = Arc::new(ModelCatalog::with_builtin(
            models_dir.clone(),
            1024,
            builtin,
            Arc::new(CustomModelStore::empty(dir.path().join("custom_models.json"))),
            source.clone(),
        ));
        let downloader = Downloader::new(
            source.clone(),
            models_dir,
            DownloadOptions {
                min_artifact_bytes: 1024,
                progress_interval: Duration::from_millis(500),
            },
        );
        let bus = EventBus::new();
        Fixture {
            _dir: dir,
            source,
            service: ModelDownloadService::new(catalog, downloader, bus.clone()),
            bus,
        }
    }

    async fn final_status(rx: &mut tokio::sync::broadcast::Receiver<AppEvent>) -> ModelStatus {
        loop {
            match rx.recv().await.unwrap() {
                AppEvent::ModelStatus(payload) => match payload.status {
                    ModelStatus::Downloading { .. } => continue,
                    status => return status,
                },
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn queued_download_installs_model() {
        let f = fixture();
        f.source.serve(URL, FakeArtifact::ok(vec![1u8; 4096]));
        let mut rx = f.bus.subscribe();

        assert!(f.service.queue("tiny").unwrap());
        assert_eq!(final_status(&mut rx).await, ModelStatus::Installed);
        assert!(!f.service.is_downloading("tiny"));
        assert_eq!(f.service.status("tiny"), ModelStatus::Installed);
    }

    #[tokio::test(start_paused = true)]
    async fn second_queue_while_in_flight_is_ignored() {
        let f = fixture();
        f.source.serve(
            URL,
            FakeArtifact::ok(vec![1u8; 4096]).chunked(1024, Duration::from_millis(100)),
        );
        let mut rx = f.bus.subscribe();

        assert!(f.service.queue("tiny").unwrap());
        assert!(!f.service.queue("tiny").unwrap());
        assert_eq!(final_status(&mut rx).await, ModelStatus::Installed);
        assert_eq!(f.source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn failure_is_reported_as_error_status() {
        let f = fixture();
        f.source.serve(URL, FakeArtifact::status(404));
        let mut rx = f.bus.subscribe();

        f.service.queue("tiny").unwrap();
        match final_status(&mut rx).await {
            ModelStatus::Error(message) => assert!(message.contains("404")),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(f.service.status("tiny"), ModelStatus::NotInstalled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_returns_to_not_installed() {
        let f = fixture();
        f.source.serve(
            URL,
            FakeArtifact::ok(vec![1u8; 8192]).chunked(1024, Duration::from_secs(1)),
        );
        let mut rx = f.bus.subscribe();

        f.service.queue("tiny").unwrap();
        assert!(f.service.cancel("tiny"));
        assert_eq!(final_status(&mut rx).await, ModelStatus::NotInstalled);
        assert!(!f.service.is_downloading("tiny"));
        assert!(!f.service.cancel("tiny"));
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_latest_progress() {
        let f = fixture();
        f.source.serve(
            URL,
            FakeArtifact::ok(vec![1u8; 4096]).chunked(1024, Duration::from_millis(300)),
        );
        let mut rx = f.bus.subscribe();

        f.service.queue("tiny").unwrap();
        let reported = loop {
            if let AppEvent::ModelStatus(payload) = rx.recv().await.unwrap() {
                if let ModelStatus::Downloading { progress } = payload.status {
                    if progress > 0.0 {
                        break progress;
                    }
                }
            }
        };
        assert_eq!(
            f.service.status("tiny"),
            ModelStatus::Downloading { progress: reported }
        );
        assert_eq!(final_status(&mut rx).await, ModelStatus::Installed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_wait_returns_after_final_status() {
        let f = fixture();
        f.source.serve(
            URL,
            FakeArtifact::ok(vec![1u8; 8192]).chunked(1024, Duration::from_secs(1)),
        );
        let mut rx = f.bus.subscribe();

        f.service.queue("tiny").unwrap();
        assert!(f.service.cancel_and_wait("tiny").await);
        assert!(!f.service.is_downloading("tiny"));

        let mut statuses = Vec::new();
        while let Ok(AppEvent::ModelStatus(payload)) = rx.try_recv() {
            statuses.push(payload.status);
        }
        assert_eq!(statuses.last(), Some(&ModelStatus::NotInstalled));
        assert!(!f.service.cancel_and_wait("tiny").await);
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let f = fixture();
        assert!(matches!(f.service.queue("nope"), Err(ChatError::NotFound(_))));
    }
}
