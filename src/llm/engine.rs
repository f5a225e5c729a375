use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::Mutex;

use crate::chat::Role;
use crate::error::ChatError;
use crate::models::format_size;

/// One entry of the history handed to the engine: role and text only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOptions {
    pub n_predict: i32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub stop: Vec<String>,
}

/// Sampling parameters configured by the user; stop markers are added per turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationOptions {
    pub n_predict: i32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            n_predict: 500,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
        }
    }
}

impl GenerationOptions {
    #[must_use]
    pub fn with_stop(&self, stop: &[&str]) -> CompletionOptions {
        CompletionOptions {
            n_predict: self.n_predict,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            stop: stop.iter().map(|marker| (*marker).to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelMetadata {
    pub description: Option<String>,
    pub parameter_count: Option<u64>,
    pub context_length: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadOptions {
    pub context_length: u32,
    pub gpu_layers: u32,
    pub use_mlock: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            context_length: 2048,
            gpu_layers: 0,
            use_mlock: false,
        }
    }
}

/// A loaded model. Implementations own the native resources until `release`.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn tokenize(&self, text: &str) -> crate::Result<Vec<i32>>;

    async fn completion(
        &self,
        messages: &[PromptMessage],
        options: &CompletionOptions,
    ) -> crate::Result<Completion>;

    async fn metadata(&self) -> crate::Result<ModelMetadata>;

    async fn release(&self) -> crate::Result<()>;
}

#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load(
        &self,
        path: &Path,
        options: &LoadOptions,
    ) -> crate::Result<Arc<dyn InferenceEngine>>;
}

struct LoadedModel {
    path: PathBuf,
    engine: Arc<dyn InferenceEngine>,
}

/// Holds at most one engine. Loads are serialized and always release the
/// previous model before the next one is brought up.
pub struct EngineSlot {
    loader: Arc<dyn EngineLoader>,
    options: LoadOptions,
    metadata_timeout: Duration,
    loading: Mutex<()>,
    active: RwLock<Option<LoadedModel>>,
}

impl EngineSlot {
    pub fn new(loader: Arc<dyn EngineLoader>, options: LoadOptions, metadata_timeout: Duration) -> Self {
        Self {
            loader,
            options,
            metadata_timeout,
            loading: Mutex::new(()),
            active: RwLock::new(None),
        }
    }

    pub async fn load(&self, path: &Path) -> crate::Result<ModelMetadata> {
        let _serial = self.loading.lock().await;

        self.release_active().await;

        tracing::info!("Loading model {}", path.display());
        let engine = self
            .loader
            .load(path, &self.options)
            .await
            .map_err(|err| with_memory_hint(err, path))?;

        let metadata = match tokio::time::timeout(self.metadata_timeout, engine.metadata()).await {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(err)) => {
                release_quietly(engine.as_ref()).await;
                return Err(ChatError::EngineLoad(err.to_string()));
            }
            Err(_) => {
                tracing::error!(
                    "Model metadata for {} not available after {:?}",
                    path.display(),
                    self.metadata_timeout
                );
                release_quietly(engine.as_ref()).await;
                return Err(ChatError::EngineTimeout(self.metadata_timeout));
            }
        };

        *self.active.write() = Some(LoadedModel {
            path: path.to_path_buf(),
            engine,
        });
        tracing::info!("Model {} ready", path.display());
        Ok(metadata)
    }

    pub async fn unload(&self) {
        let _serial = self.loading.lock().await;
        self.release_active().await;
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<dyn InferenceEngine>> {
        self.active.read().as_ref().map(|loaded| loaded.engine.clone())
    }

    #[must_use]
    pub fn loaded_path(&self) -> Option<PathBuf> {
        self.active.read().as_ref().map(|loaded| loaded.path.clone())
    }

    async fn release_active(&self) {
        let previous = self.active.write().take();
        if let Some(previous) = previous {
            tracing::info!("Releasing model {}", previous.path.display());
            release_quietly(previous.engine.as_ref()).await;
        }
    }
}

async fn release_quietly(engine: &dyn InferenceEngine) {
    if let Err(error) = engine.release().await {
        tracing::warn!("Failed to release model: {error}");
    }
}

fn with_memory_hint(error: ChatError, path: &Path) -> ChatError {
    let message = match error {
        ChatError::EngineTimeout(_) => return error,
        ChatError::EngineLoad(message) => message,
        other => other.to_string(),
    };

    let model_bytes = std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();

    if model_bytes > 0 && available > 0 && available < model_bytes {
        ChatError::EngineLoad(format!(
            "{message} (model needs about {} but only {} of memory is free; try a smaller model)",
            format_size(model_bytes),
            format_size(available)
        ))
    } else {
        ChatError::EngineLoad(message)
    }
}
