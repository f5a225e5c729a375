//! In-memory stand-ins for the remote host and the inference engine.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use crate::error::ChatError;
use crate::llm::{
    Completion, CompletionOptions, EngineLoader, InferenceEngine, LoadOptions, ModelMetadata,
    PromptMessage,
};
use crate::models::{FetchResponse, ProbeResponse, RemoteSource};

#[derive(Debug, Clone)]
pub struct FakeArtifact {
    pub status: u16,
    pub body: Vec<u8>,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub report_length: bool,
    pub last_modified: Option<String>,
}

impl FakeArtifact {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            chunk_size: 1024,
            chunk_delay: Duration::ZERO,
            report_length: true,
            last_modified: Some("Tue, 02 Jan 2024 10:00:00 GMT".into()),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: b"<html>error page</html>".to_vec(),
            ..Self::ok(Vec::new())
        }
    }

    pub fn chunked(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = delay;
        self
    }

    pub fn without_length(mut self) -> Self {
        self.report_length = false;
        self
    }
}

#[derive(Default)]
pub struct FakeSource {
    artifacts: Mutex<HashMap<String, FakeArtifact>>,
    fetches: AtomicUsize,
    probes: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, artifact: FakeArtifact) {
        self.artifacts.lock().insert(url.to_string(), artifact);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn lookup(&self, url: &str) -> FakeArtifact {
        self.artifacts
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| FakeArtifact::status(404))
    }
}

#[async_trait]
impl RemoteSource for FakeSource {
    async fn probe(&self, url: &str) -> crate::Result<ProbeResponse> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let artifact = self.lookup(url);
        Ok(ProbeResponse {
            status: artifact.status,
            content_length: artifact.report_length.then_some(artifact.body.len() as u64),
            last_modified: artifact.last_modified,
        })
    }

    async fn fetch(&self, url: &str) -> crate::Result<FetchResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let artifact = self.lookup(url);
        let delay = artifact.chunk_delay;
        let chunks: Vec<Vec<u8>> = artifact
            .body
            .chunks(artifact.chunk_size)
            .map(<[u8]>::to_vec)
            .collect();
        let body = stream::iter(chunks)
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(Bytes::from(chunk))
            })
            .boxed();
        Ok(FetchResponse {
            status: artifact.status,
            content_length: artifact.report_length.then_some(artifact.body.len() as u64),
            body,
        })
    }
}

#[derive(Debug, Clone)]
enum FakeReply {
    Text(String),
    Fail(String),
}

pub struct FakeEngine {
    reply: Mutex<FakeReply>,
    delay: Duration,
    metadata_delay: Duration,
    completions: AtomicUsize,
    tokenizations: AtomicUsize,
    released: AtomicBool,
    last_request: Mutex<Option<(Vec<PromptMessage>, CompletionOptions)>>,
}

impl FakeEngine {
    fn with_reply(reply: FakeReply) -> Self {
        Self {
            reply: Mutex::new(reply),
            delay: Duration::ZERO,
            metadata_delay: Duration::ZERO,
            completions: AtomicUsize::new(0),
            tokenizations: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            last_request: Mutex::new(None),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::with_reply(FakeReply::Text(text.to_string()))
    }

    pub fn failing(message: &str) -> Self {
        Self::with_reply(FakeReply::Fail(message.to_string()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_metadata_delay(mut self, delay: Duration) -> Self {
        self.metadata_delay = delay;
        self
    }

    pub fn set_reply(&self, text: &str) {
        *self.reply.lock() = FakeReply::Text(text.to_string());
    }

    pub fn completion_count(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn tokenize_count(&self) -> usize {
        self.tokenizations.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<(Vec<PromptMessage>, CompletionOptions)> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl InferenceEngine for FakeEngine {
    async fn tokenize(&self, text: &str) -> crate::Result<Vec<i32>> {
        self.tokenizations.fetch_add(1, Ordering::SeqCst);
        Ok((0..text.split_whitespace().count() as i32).collect())
    }

    async fn completion(
        &self,
        messages: &[PromptMessage],
        options: &CompletionOptions,
    ) -> crate::Result<Completion> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some((messages.to_vec(), options.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = self.reply.lock().clone();
        match reply {
            FakeReply::Text(content) => Ok(Completion { content }),
            FakeReply::Fail(message) => Err(ChatError::Generation(message)),
        }
    }

    async fn metadata(&self) -> crate::Result<ModelMetadata> {
        if !self.metadata_delay.is_zero() {
            tokio::time::sleep(self.metadata_delay).await;
        }
        Ok(ModelMetadata {
            description: Some("fake 1B Q4_K_M".into()),
            parameter_count: Some(1_000_000_000),
            context_length: Some(2048),
        })
    }

    async fn release(&self) -> crate::Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out the queued engines in order, or fails every load.
pub struct FakeLoader {
    engines: Mutex<Vec<Arc<FakeEngine>>>,
    failure: Option<String>,
    loads: AtomicUsize,
}

impl FakeLoader {
    pub fn sequence(mut engines: Vec<Arc<FakeEngine>>) -> Self {
        engines.reverse();
        Self {
            engines: Mutex::new(engines),
            failure: None,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            engines: Mutex::new(Vec::new()),
            failure: Some(message.to_string()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLoader for FakeLoader {
    async fn load(
        &self,
        path: &Path,
        _options: &LoadOptions,
    ) -> crate::Result<Arc<dyn InferenceEngine>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(ChatError::EngineLoad(message.clone()));
        }
        let engine: Arc<dyn InferenceEngine> = self
            .engines
            .lock()
            .pop()
            .ok_or_else(|| ChatError::EngineLoad(format!("no engine queued for {}", path.display())))?;
        Ok(engine)
    }
}
