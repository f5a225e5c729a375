use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};

use super::engine::{
    Completion, CompletionOptions, EngineLoader, InferenceEngine, LoadOptions, ModelMetadata,
    PromptMessage,
};
use crate::error::ChatError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const ENV_CMD: &str = "CHAT_ENGINE_CMD";
pub const ENV_ARGS: &str = "CHAT_ENGINE_ARGS";
pub const ENV_TIMEOUT: &str = "CHAT_ENGINE_TIMEOUT_SECS";

/// How to start the external engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandConfig {
    pub fn new(path: PathBuf, args: Vec<String>) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ChatError::EngineLoad(format!(
                "engine command points to missing binary: {}",
                path.display()
            )));
        }
        Ok(Self {
            path,
            args,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// `None` when `CHAT_ENGINE_CMD` is unset.
    pub fn from_env() -> Option<crate::Result<Self>> {
        let cmd = std::env::var(ENV_CMD).ok()?;
        let args = std::env::var(ENV_ARGS)
            .map(|value| value.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        let timeout = std::env::var(ENV_TIMEOUT)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Some(Self::new(PathBuf::from(cmd), args).map(|config| config.with_timeout(timeout)))
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request<'a> {
    Tokenize {
        model: &'a Path,
        text: &'a str,
    },
    Completion {
        model: &'a Path,
        load: &'a LoadOptions,
        messages: &'a [PromptMessage],
        options: &'a CompletionOptions,
    },
    Metadata {
        model: &'a Path,
    },
}

#[derive(Debug, Deserialize)]
struct TokenizeReply {
    tokens: Vec<i32>,
}

/// Runs one process per request: a JSON request on stdin, a JSON reply on
/// stdout. Nothing is held between requests.
pub struct CommandEngine {
    config: CommandConfig,
    model: PathBuf,
    load: LoadOptions,
}

impl CommandEngine {
    async fn run<T: DeserializeOwned>(&self, request: &Request<'_>) -> crate::Result<T> {
        let payload = serde_json::to_vec(request)?;

        let mut child = Command::new(&self.config.path)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ChatError::Generation(format!(
                    "failed to spawn engine command {}: {err}",
                    self.config.path.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(|err| {
                ChatError::Generation(format!("failed to write request to engine stdin: {err}"))
            })?;
        }

        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ChatError::Generation(format!(
                    "engine command exceeded {:?} timeout",
                    self.config.timeout
                ))
            })?
            .map_err(|err| ChatError::Generation(format!("failed waiting for engine command: {err}")))?;

        if !output.status.success() {
            return Err(ChatError::Generation(format!(
                "engine command exited with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|err| {
            ChatError::Generation(format!("engine command returned malformed json: {err}"))
        })
    }
}

#[async_trait]
impl InferenceEngine for CommandEngine {
    async fn tokenize(&self, text: &str) -> crate::Result<Vec<i32>> {
        let reply: TokenizeReply = self
            .run(&Request::Tokenize {
                model: &self.model,
                text,
            })
            .await?;
        Ok(reply.tokens)
    }

    async fn completion(
        &self,
        messages: &[PromptMessage],
        options: &CompletionOptions,
    ) -> crate::Result<Completion> {
        self.run(&Request::Completion {
            model: &self.model,
            load: &self.load,
            messages,
            options,
        })
        .await
    }

    async fn metadata(&self) -> crate::Result<ModelMetadata> {
        self.run(&Request::Metadata { model: &self.model }).await
    }

    async fn release(&self) -> crate::Result<()> {
        Ok(())
    }
}

pub struct CommandEngineLoader {
    config: CommandConfig,
}

impl CommandEngineLoader {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineLoader for CommandEngineLoader {
    async fn load(
        &self,
        path: &Path,
        options: &LoadOptions,
    ) -> crate::Result<Arc<dyn InferenceEngine>> {
        if !path.is_file() {
            return Err(ChatError::EngineLoad(format!(
                "model file missing at {}",
                path.display()
            )));
        }
        Ok(Arc::new(CommandEngine {
            config: self.config.clone(),
            model: path.to_path_buf(),
            load: options.clone(),
        }))
    }
}

/// Loader used when no backend is configured; every load fails.
pub struct UnavailableLoader;

#[async_trait]
impl EngineLoader for UnavailableLoader {
    async fn load(
        &self,
        _path: &Path,
        _options: &LoadOptions,
    ) -> crate::Result<Arc<dyn InferenceEngine>> {
        Err(ChatError::EngineLoad(format!(
            "no inference backend configured; set {ENV_CMD} or build with the `llama` feature"
        )))
    }
}
