use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::source::RemoteSource;
use crate::error::ChatError;

pub const ALLOWED_EXTENSIONS: &[&str] = &["gguf", "bin", "safetensors", "pt", "pth", "ggml"];
pub const DEFAULT_MIN_ARTIFACT_BYTES: u64 = 10 * 1024 * 1024;
const UNKNOWN_SIZE: &str = "Unknown size";
const CUSTOM_ID_PREFIX: &str = "custom/";

static HUB_FILE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^https://(?:www\.)?huggingface\.co/([^/?#]+)/([^/?#]+)/(?:resolve|blob)/([^/?#]+)/([^?#]+)(?:[?#].*)?$",
    )
    .expect("hub url pattern is valid")
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub id: String,
    pub name: String,
    pub url: String,
    pub filename: String,
    pub size_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub custom: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl ArtifactDescriptor {
    /// File name under the models directory. Custom entries are prefixed
    /// with their author, repo and subdirectories so equal file names from
    /// different repos never share a file.
    #[must_use]
    pub fn local_file_name(&self) -> String {
        match self.id.strip_prefix(CUSTOM_ID_PREFIX) {
            Some(rest) if self.custom => rest.replace('/', "--"),
            _ => self.filename.clone(),
        }
    }

    #[must_use]
    pub fn path(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(self.local_file_name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ModelStatus {
    NotInstalled,
    Downloading { progress: f32 },
    Installed,
    Error(String),
}

/// A descriptor with its download flag recomputed from the models directory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub descriptor: ArtifactDescriptor,
    pub downloaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub entry_removed: bool,
    pub file_removed: bool,
    /// Set when a step failed without blocking the rest of the removal.
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModelUrl {
    pub author: String,
    pub repo: String,
    pub revision: String,
    pub path: String,
    pub filename: String,
}

impl ParsedModelUrl {
    #[must_use]
    pub fn download_url(&self) -> String {
        format!(
            "https://huggingface.co/{}/{}/resolve/{}/{}",
            self.author, self.repo, self.revision, self.path
        )
    }
}

/// User-added descriptors, persisted as JSON next to the models directory.
#[derive(Debug)]
pub struct CustomModelStore {
    path: PathBuf,
    models: RwLock<Vec<ArtifactDescriptor>>,
}

impl CustomModelStore {
    pub fn empty(path: PathBuf) -> Self {
        Self {
            path,
            models: RwLock::new(Vec::new()),
        }
    }

    /// Reads the persisted list; unreadable data leaves the store empty.
    pub fn load(path: PathBuf) -> Self {
        let store = Self::empty(path);
        match read_custom_models(&store.path) {
            Ok(models) => *store.models.write() = models,
            Err(error) => tracing::warn!("Ignoring unreadable custom model list: {error}"),
        }
        store
    }

    pub fn list(&self) -> Vec<ArtifactDescriptor> {
        self.models.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<ArtifactDescriptor> {
        self.models.read().iter().find(|model| model.id == id).cloned()
    }

    pub fn upsert(&self, descriptor: ArtifactDescriptor) -> crate::Result<()> {
        let mut models = self.models.write();
        if let Some(existing) = models.iter_mut().find(|model| model.id == descriptor.id) {
            *existing = descriptor;
        } else {
            models.push(descriptor);
        }
        self.save(&models)
    }

    /// Drops the entry in memory first, so a failed write still removes it
    /// for the rest of the process.
    pub fn remove(&self, id: &str) -> crate::Result<Option<ArtifactDescriptor>> {
        let mut models = self.models.write();
        let Some(index) = models.iter().position(|model| model.id == id) else {
            return Ok(None);
        };
        let removed = models.remove(index);
        self.save(&models)?;
        Ok(Some(removed))
    }

    fn save(&self, models: &[ArtifactDescriptor]) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| ChatError::Storage(format!("create {}: {err}", parent.display())))?;
        }
        let serialized = serde_json::to_vec_pretty(models)?;
        fs::write(&self.path, serialized)
            .map_err(|err| ChatError::Storage(format!("write {}: {err}", self.path.display())))
    }
}

fn read_custom_models(path: &Path) -> crate::Result<Vec<ArtifactDescriptor>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path)
        .map_err(|err| ChatError::Storage(format!("read {}: {err}", path.display())))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub struct ModelCatalog {
    models_dir: PathBuf,
    min_artifact_bytes: u64,
    builtin: Vec<ArtifactDescriptor>,
    custom: Arc<CustomModelStore>,
    source: Arc<dyn RemoteSource>,
}

impl ModelCatalog {
    pub fn new(
        models_dir: PathBuf,
        min_artifact_bytes: u64,
        custom: Arc<CustomModelStore>,
        source: Arc<dyn RemoteSource>,
    ) -> Self {
        Self::with_builtin(models_dir, min_artifact_bytes, default_models(), custom, source)
    }

    pub fn with_builtin(
        models_dir: PathBuf,
        min_artifact_bytes: u64,
        builtin: Vec<ArtifactDescriptor>,
        custom: Arc<CustomModelStore>,
        source: Arc<dyn RemoteSource>,
    ) -> Self {
        Self {
            models_dir,
            min_artifact_bytes,
            builtin,
            custom,
            source,
        }
    }

    pub fn ensure_directory(&self) -> crate::Result<()> {
        fs::create_dir_all(&self.models_dir)?;
        Ok(())
    }

    #[must_use]
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    #[must_use]
    pub fn min_artifact_bytes(&self) -> u64 {
        self.min_artifact_bytes
    }

    /// Built-ins first, then custom models; the download flag is always
    /// recomputed from disk.
    pub fn list(&self) -> Vec<CatalogEntry> {
        self.descriptors()
            .into_iter()
            .map(|descriptor| CatalogEntry {
                downloaded: self.is_downloaded(&descriptor),
                descriptor,
            })
            .collect()
    }

    pub fn descriptor(&self, id: &str) -> Option<ArtifactDescriptor> {
        self.builtin
            .iter()
            .find(|model| model.id == id)
            .cloned()
            .or_else(|| self.custom.get(id))
    }

    #[must_use]
    pub fn local_path(&self, descriptor: &ArtifactDescriptor) -> PathBuf {
        descriptor.path(&self.models_dir)
    }

    #[must_use]
    pub fn is_downloaded(&self, descriptor: &ArtifactDescriptor) -> bool {
        fs::metadata(self.local_path(descriptor))
            .map(|meta| meta.is_file() && meta.len() > self.min_artifact_bytes)
            .unwrap_or(false)
    }

    /// Checks the URL shape and extension, then probes the host for size and
    /// provenance. The returned descriptor is not added to the catalog.
    pub async fn validate(&self, url: &str) -> crate::Result<ArtifactDescriptor> {
        let parsed = parse_model_url(url)?;

        let probe = self.source.probe(&parsed.download_url()).await?;
        if !probe.is_success() {
            return Err(ChatError::Validation(format!(
                "model file is not reachable (status {})",
                probe.status
            )));
        }

        let name = Path::new(&parsed.filename)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&parsed.filename)
            .to_string();

        Ok(ArtifactDescriptor {
            id: format!("{CUSTOM_ID_PREFIX}{}/{}/{}", parsed.author, parsed.repo, parsed.path),
            name,
            url: parsed.download_url(),
            filename: parsed.filename.clone(),
            size_label: probe
                .content_length
                .map(format_size)
                .unwrap_or_else(|| UNKNOWN_SIZE.to_string()),
            sha256: None,
            custom: true,
            author: Some(parsed.author),
            last_updated: probe.last_modified,
        })
    }

    pub fn add(&self, mut descriptor: ArtifactDescriptor) -> crate::Result<()> {
        if self.builtin.iter().any(|model| model.id == descriptor.id) {
            return Err(ChatError::Validation(format!(
                "{} is a built-in model and cannot be replaced",
                descriptor.id
            )));
        }
        descriptor.custom = true;
        let file_name = descriptor.local_file_name();
        if let Some(clash) = self
            .descriptors()
            .into_iter()
            .find(|model| model.id != descriptor.id && model.local_file_name() == file_name)
        {
            return Err(ChatError::Validation(format!(
                "{} would share its local file {file_name} with {}",
                descriptor.id, clash.id
            )));
        }
        tracing::info!("Adding custom model {}", descriptor.id);
        self.custom.upsert(descriptor)
    }

    /// Deletes the local file (if any) and, for custom models, the catalog
    /// entry. A failed file deletion is reported as a warning only.
    pub fn remove(&self, id: &str) -> crate::Result<RemoveOutcome> {
        let descriptor = self
            .descriptor(id)
            .ok_or_else(|| ChatError::NotFound(format!("model {id}")))?;

        let mut warnings = Vec::new();
        let mut file_removed = false;
        let path = self.local_path(&descriptor);
        if path.exists() {
            match fs::remove_file(&path) {
                Ok(()) => file_removed = true,
                Err(error) => {
                    tracing::warn!("Failed to delete {}: {error}", path.display());
                    warnings.push(format!("could not delete {}: {error}", path.display()));
                }
            }
        }

        let entry_removed = if descriptor.custom {
            match self.custom.remove(id) {
                Ok(removed) => removed.is_some(),
                Err(error) => {
                    tracing::warn!("Failed to persist custom model removal: {error}");
                    warnings.push(error.to_string());
                    true
                }
            }
        } else {
            false
        };

        Ok(RemoveOutcome {
            entry_removed,
            file_removed,
            warning: (!warnings.is_empty()).then(|| warnings.join("; ")),
        })
    }

    fn descriptors(&self) -> Vec<ArtifactDescriptor> {
        let mut all = self.builtin.clone();
        all.extend(self.custom.list());
        all
    }
}

pub fn parse_model_url(url: &str) -> crate::Result<ParsedModelUrl> {
    let captures = HUB_FILE_URL.captures(url.trim()).ok_or_else(|| {
        ChatError::Validation(
            "expected a file link like https://huggingface.co/<author>/<repo>/resolve/<revision>/<file>"
                .into(),
        )
    })?;

    let path = captures[4].trim_end_matches('/').to_string();
    let filename = path.rsplit('/').next().unwrap_or(&path).to_string();
    let extension = Path::new(&filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => {}
        _ => {
            let allowed: Vec<String> = ALLOWED_EXTENSIONS.iter().map(|ext| format!(".{ext}")).collect();
            return Err(ChatError::Validation(format!(
                "unsupported file type for {filename}; allowed extensions: {}",
                allowed.join(", ")
            )));
        }
    }

    Ok(ParsedModelUrl {
        author: captures[1].to_string(),
        repo: captures[2].to_string(),
        revision: captures[3].to_string(),
        path,
        filename,
    })
}

#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn builtin(id: &str, name: &str, url: &str, size_label: &str, author: &str) -> ArtifactDescriptor {
    let filename = url.rsplit('/').next().unwrap_or(url).to_string();
    ArtifactDescriptor {
        id: id.into(),
        name: name.into(),
        url: url.into(),
        filename,
        size_label: size_label.into(),
        sha256: None,
        custom: false,
        author: Some(author.into()),
        last_updated: None,
    }
}

pub fn default_models() -> Vec<ArtifactDescriptor> {
    vec![
        builtin(
            "llama-3.2-1b-instruct-q4_k_m",
            "Llama 3.2 1B Instruct",
            "https://huggingface.co/bartowski/Llama-3.2-1B-Instruct-GGUF/resolve/main/Llama-3.2-1B-Instruct-Q4_K_M.gguf",
            "808 MB",
            "bartowski",
        ),
        builtin(
            "qwen2.5-1.5b-instruct-q4_k_m",
            "Qwen 2.5 1.5B Instruct",
            "https://huggingface.co/Qwen/Qwen2.5-1.5B-Instruct-GGUF/resolve/main/qwen2.5-1.5b-instruct-q4_k_m.gguf",
            "1.1 GB",
            "Qwen",
        ),
        builtin(
            "gemma-2-2b-it-q4_k_m",
            "Gemma 2 2B Instruct",
            "https://huggingface.co/bartowski/gemma-2-2b-it-GGUF/resolve/main/gemma-2-2b-it-Q4_K_M.gguf",
            "1.7 GB",
            "bartowski",
        ),
        builtin(
            "phi-3.5-mini-instruct-q4_k_m",
            "Phi 3.5 Mini Instruct",
            "https://huggingface.co/bartowski/Phi-3.5-mini-instruct-GGUF/resolve/main/Phi-3.5-mini-instruct-Q4_K_M.gguf",
            "2.4 GB",
            "bartowski",
        ),
        builtin(
            "tinyllama-1.1b-chat-q4_k_m",
            "TinyLlama 1.1B Chat",
            "https://huggingface.co/TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF/resolve/main/TinyLlama-1.1B-Chat-v1.0-Q4_K_M.gguf",
            "669 MB",
            "TheBloke",
        ),
    ]
}
