use std::{
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::{
    catalog::{ArtifactDescriptor, DEFAULT_MIN_ARTIFACT_BYTES},
    metadata::checksum_matches,
    source::RemoteSource,
};
use crate::error::ChatError;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub bytes_written: u64,
    pub total_bytes: Option<u64>,
    pub ratio: f64,
    pub bytes_per_sec: Option<f64>,
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    pub min_artifact_bytes: u64,
    pub progress_interval: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            min_artifact_bytes: DEFAULT_MIN_ARTIFACT_BYTES,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct Downloader {
    source: Arc<dyn RemoteSource>,
    models_dir: PathBuf,
    options: DownloadOptions,
}

impl Downloader {
    pub fn new(source: Arc<dyn RemoteSource>, models_dir: PathBuf, options: DownloadOptions) -> Self {
        Self {
            source,
            models_dir,
            options,
        }
    }

    #[must_use]
    pub fn target_path(&self, descriptor: &ArtifactDescriptor) -> PathBuf {
        descriptor.path(&self.models_dir)
    }

    #[must_use]
    pub fn staging_path(&self, descriptor: &ArtifactDescriptor) -> PathBuf {
        self.models_dir
            .join(format!("{}.part", descriptor.local_file_name()))
    }

    /// Starts fetching `descriptor` in the background. Must be called from
    /// within a tokio runtime.
    pub fn acquire(&self, descriptor: &ArtifactDescriptor) -> DownloadHandle {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let job = DownloadJob {
            source: self.source.clone(),
            url: descriptor.url.clone(),
            target: self.target_path(descriptor),
            staging: self.staging_path(descriptor),
            expected_sha256: descriptor.sha256.clone(),
            options: self.options,
            progress: progress_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(job.run());
        DownloadHandle {
            progress: progress_rx,
            cancel,
            task,
        }
    }

    /// Convenience wrapper that discards progress.
    pub async fn acquire_path(&self, descriptor: &ArtifactDescriptor) -> crate::Result<PathBuf> {
        let mut handle = self.acquire(descriptor);
        while handle.next().await.is_some() {}
        handle.finish().await
    }
}

/// A running download. Yields progress snapshots as a finite stream which
/// ends once the transfer stops; [`DownloadHandle::finish`] gives the result.
pub struct DownloadHandle {
    progress: mpsc::UnboundedReceiver<DownloadProgress>,
    cancel: CancellationToken,
    task: JoinHandle<crate::Result<PathBuf>>,
}

impl DownloadHandle {
    /// Stops the transfer; the partial file is removed and `finish` returns
    /// [`ChatError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn finish(self) -> crate::Result<PathBuf> {
        match self.task.await {
            Ok(result) => result,
            Err(join) if join.is_cancelled() => Err(ChatError::Cancelled),
            Err(join) => Err(ChatError::transfer(format!("download task failed: {join}"))),
        }
    }
}

impl Stream for DownloadHandle {
    type Item = DownloadProgress;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().progress.poll_recv(cx)
    }
}

struct DownloadJob {
    source: Arc<dyn RemoteSource>,
    url: String,
    target: PathBuf,
    staging: PathBuf,
    expected_sha256: Option<String>,
    options: DownloadOptions,
    progress: mpsc::UnboundedSender<DownloadProgress>,
    cancel: CancellationToken,
}

impl DownloadJob {
    async fn run(self) -> crate::Result<PathBuf> {
        if self.existing_is_valid().await? {
            tracing::info!("Model already present at {}", self.target.display());
            return Ok(self.target);
        }

        if let Some(parent) = self.staging.parent() {
            fs::create_dir_all(parent).await?;
        }

        tracing::info!("Downloading {} to {}", self.url, self.target.display());
        match self.transfer().await {
            Ok(()) => {
                tracing::info!("Download complete: {}", self.target.display());
                Ok(self.target)
            }
            Err(error) => {
                remove_quietly(&self.staging).await;
                tracing::error!("Download of {} failed: {error}", self.url);
                Err(error)
            }
        }
    }

    /// Idempotent fast path. Clears files that fail the size or checksum
    /// check so a failed redownload cannot leave them behind.
    async fn existing_is_valid(&self) -> crate::Result<bool> {
        let Ok(meta) = fs::metadata(&self.target).await else {
            return Ok(false);
        };
        if meta.is_file() && meta.len() > self.options.min_artifact_bytes {
            let Some(expected) = &self.expected_sha256 else {
                return Ok(true);
            };
            if checksum_matches(&self.target, expected).await? {
                return Ok(true);
            }
            tracing::warn!(
                "Checksum mismatch for existing {}, redownloading",
                self.target.display()
            );
        } else {
            tracing::warn!(
                "Existing {} is only {} bytes, redownloading",
                self.target.display(),
                meta.len()
            );
        }
        if meta.is_file() {
            fs::remove_file(&self.target).await?;
        }
        Ok(false)
    }

    async fn transfer(&self) -> crate::Result<()> {
        let response = self.source.fetch(&self.url).await?;
        if !response.is_success() {
            return Err(ChatError::download_status(response.status));
        }
        let total = response.content_length.filter(|total| *total > 0);

        let mut body = response.body;
        let mut file = File::create(&self.staging).await?;
        let mut throttle = ProgressThrottle::new(self.options.progress_interval);
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ChatError::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if let Some(snapshot) = throttle.observe(written, total) {
                tracing::debug!(
                    bytes = snapshot.bytes_written,
                    ratio = snapshot.ratio,
                    "download progress"
                );
                let _ = self.progress.send(snapshot);
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if written <= self.options.min_artifact_bytes {
            return Err(ChatError::Integrity(format!(
                "downloaded file is only {written} bytes; expected more than {}",
                self.options.min_artifact_bytes
            )));
        }

        if let Some(expected) = &self.expected_sha256 {
            if !checksum_matches(&self.staging, expected).await? {
                return Err(ChatError::Integrity(format!(
                    "checksum mismatch for {}",
                    self.target.display()
                )));
            }
        }

        fs::rename(&self.staging, &self.target).await?;
        let _ = self.progress.send(throttle.finish(written, total));
        Ok(())
    }
}

/// Rate-limits progress emissions and derives throughput between them.
#[derive(Debug)]
struct ProgressThrottle {
    interval: Duration,
    last_emit: Instant,
    last_bytes: u64,
}

impl ProgressThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: Instant::now(),
            last_bytes: 0,
        }
    }

    fn observe(&mut self, written: u64, total: Option<u64>) -> Option<DownloadProgress> {
        let now = Instant::now();
        if now.duration_since(self.last_emit) < self.interval {
            return None;
        }
        Some(self.snapshot(now, written, total, progress_ratio(written, total)))
    }

    /// Final snapshot, sent only once the artifact has passed verification.
    fn finish(&mut self, written: u64, total: Option<u64>) -> DownloadProgress {
        self.snapshot(Instant::now(), written, total, progress_ratio(written, total))
    }

    fn snapshot(
        &mut self,
        now: Instant,
        written: u64,
        total: Option<u64>,
        ratio: f64,
    ) -> DownloadProgress {
        let secs = now.duration_since(self.last_emit).as_secs_f64();
        let delta = written.saturating_sub(self.last_bytes);
        let bytes_per_sec = (secs > 0.0)
            .then(|| delta as f64 / secs)
            .filter(|rate| rate.is_finite());
        let eta = match (total, bytes_per_sec) {
            (Some(total), Some(rate)) if rate > 0.0 => {
                Duration::try_from_secs_f64(total.saturating_sub(written) as f64 / rate).ok()
            }
            _ => None,
        };

        self.last_emit = now;
        self.last_bytes = written;
        DownloadProgress {
            bytes_written: written,
            total_bytes: total,
            ratio,
            bytes_per_sec,
            eta,
        }
    }
}

fn progress_ratio(written: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => (written as f64 / total as f64).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!("Failed to remove partial download {}: {error}", path.display()),
    }
}
