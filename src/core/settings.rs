use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::llm::{GenerationOptions, LoadOptions};
use crate::models::DEFAULT_MIN_ARTIFACT_BYTES;

const CONFIG_FILE: &str = "config.json";
const MODELS_DIR: &str = "models";
const SESSIONS_FILE: &str = "sessions.json";
const CUSTOM_MODELS_FILE: &str = "custom_models.json";

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant running entirely on this device. Answer clearly and concisely.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub models_dir: Option<PathBuf>,
    pub min_artifact_bytes: u64,
    pub metadata_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub token_cache_capacity: usize,
    pub system_prompt: String,
    pub generation: GenerationOptions,
    pub load: LoadOptions,
    pub engine_command: Option<PathBuf>,
    pub engine_args: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            models_dir: None,
            min_artifact_bytes: DEFAULT_MIN_ARTIFACT_BYTES,
            metadata_timeout_secs: 10,
            progress_interval_ms: 500,
            token_cache_capacity: crate::chat::DEFAULT_TOKEN_CACHE_CAPACITY,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            generation: GenerationOptions::default(),
            load: LoadOptions::default(),
            engine_command: None,
            engine_args: Vec::new(),
        }
    }
}

impl AppSettings {
    #[must_use]
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// On-disk layout under one data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub models_dir: PathBuf,
    pub sessions_file: PathBuf,
    pub custom_models_file: PathBuf,
}

impl AppPaths {
    pub fn from_project_dirs() -> Result<Self> {
        let project_dirs = ProjectDirs::from("com", "OnDeviceChat", "OnDeviceChat")
            .context("missing project directories")?;
        let mut paths = Self::with_root(project_dirs.data_dir());
        paths.config_file = project_dirs.config_dir().join(CONFIG_FILE);
        Ok(paths)
    }

    pub fn with_root(root: &Path) -> Self {
        Self {
            config_file: root.join(CONFIG_FILE),
            models_dir: root.join(MODELS_DIR),
            sessions_file: root.join(SESSIONS_FILE),
            custom_models_file: root.join(CUSTOM_MODELS_FILE),
        }
    }

    /// Applies the user's `models_dir` override, if any.
    #[must_use]
    pub fn with_settings(mut self, settings: &AppSettings) -> Self {
        if let Some(dir) = &settings.models_dir {
            self.models_dir = dir.clone();
        }
        self
    }
}

pub fn load_settings(path: &Path) -> Result<AppSettings> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    let parsed: AppSettings =
        serde_json::from_slice(&bytes).context("config json could not be parsed")?;
    Ok(parsed)
}

pub fn persist_settings(path: &Path, settings: &AppSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    let serialized =
        serde_json::to_vec_pretty(settings).context("serialize settings to json failed")?;
    fs::write(path, serialized).with_context(|| format!("write settings to {path:?}"))?;
    Ok(())
}

/// Missing or unreadable config falls back to defaults.
pub fn load_or_default(path: &Path) -> AppSettings {
    match load_settings(path) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::warn!("Ignoring unreadable settings: {error:?}");
            AppSettings::default()
        }
    }
}
