mod catalog;
mod download;
mod metadata;
mod service;
mod source;

pub use catalog::{
    default_models, format_size, parse_model_url, ArtifactDescriptor, CatalogEntry,
    CustomModelStore, ModelCatalog, ModelStatus, ParsedModelUrl, RemoveOutcome,
    ALLOWED_EXTENSIONS, DEFAULT_MIN_ARTIFACT_BYTES,
};
pub use download::{
    DownloadHandle, DownloadOptions, DownloadProgress, Downloader, DEFAULT_PROGRESS_INTERVAL,
};
pub use metadata::{checksum_matches, compute_sha256, sha256_file};
pub use service::ModelDownloadService;
pub use source::{FetchResponse, HttpSource, ProbeResponse, RemoteSource};
