use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;

use crate::chat::{
    ChatSession, SessionStore, SessionSummary, SharedSessionStore, TurnOrchestrator, TurnOutcome,
};
use crate::error::ChatError;
use crate::llm::{
    CommandConfig, CommandEngineLoader, EngineLoader, EngineSlot, ModelMetadata,
};
use crate::models::{
    ArtifactDescriptor, CatalogEntry, CustomModelStore, DownloadOptions, Downloader, HttpSource,
    ModelCatalog, ModelDownloadService, ModelStatus, RemoteSource, RemoveOutcome,
};

use super::events::{self, AppEvent, EventBus};
use super::settings::{self, AppPaths, AppSettings};

/// Process-wide owner of every store and service. Built empty; call
/// [`AppContext::initialize`] before use and [`AppContext::on_background`]
/// when the host loses focus.
pub struct AppContext {
    settings: AppSettings,
    paths: AppPaths,
    bus: EventBus,
    catalog: Arc<ModelCatalog>,
    downloads: ModelDownloadService,
    store: SharedSessionStore,
    engine: Arc<EngineSlot>,
    orchestrator: TurnOrchestrator,
}

impl AppContext {
    pub fn new(
        settings: AppSettings,
        paths: AppPaths,
        source: Arc<dyn RemoteSource>,
        loader: Arc<dyn EngineLoader>,
    ) -> Self {
        let paths = paths.with_settings(&settings);
        let bus = EventBus::new();

        let custom = Arc::new(CustomModelStore::load(paths.custom_models_file.clone()));
        let catalog = Arc::new(ModelCatalog::new(
            paths.models_dir.clone(),
            settings.min_artifact_bytes,
            custom,
            source.clone(),
        ));
        let downloader = Downloader::new(
            source,
            paths.models_dir.clone(),
            DownloadOptions {
                min_artifact_bytes: settings.min_artifact_bytes,
                progress_interval: settings.progress_interval(),
            },
        );
        let downloads = ModelDownloadService::new(catalog.clone(), downloader, bus.clone());

        let store =
            SessionStore::new(paths.sessions_file.clone(), settings.system_prompt.clone()).into_shared();
        let engine = Arc::new(EngineSlot::new(
            loader,
            settings.load.clone(),
            settings.metadata_timeout(),
        ));
        let orchestrator = TurnOrchestrator::new(
            store.clone(),
            engine.clone(),
            settings.generation.clone(),
            settings.token_cache_capacity,
        );

        Self {
            settings,
            paths,
            bus,
            catalog,
            downloads,
            store,
            engine,
            orchestrator,
        }
    }

    /// Resolves platform directories and settings, talks HTTP to the model
    /// host and picks an engine backend from the environment.
    pub fn from_environment() -> Result<Self> {
        let paths = AppPaths::from_project_dirs()?;
        let settings = settings::load_or_default(&paths.config_file);
        let source = Arc::new(HttpSource::new()?);
        let loader = default_loader(&settings)?;
        Ok(Self::new(settings, paths, source, loader))
    }

    /// Restores sessions and prepares the models directory. A missing config
    /// file is written out with the current settings so it can be edited.
    /// Returns the active session.
    pub fn initialize(&self) -> ChatSession {
        if !self.paths.config_file.exists() {
            if let Err(error) =
                settings::persist_settings(&self.paths.config_file, &self.settings)
            {
                tracing::warn!("Could not write default settings: {error:?}");
            }
        }
        if let Err(error) = self.catalog.ensure_directory() {
            tracing::warn!("Could not create models directory: {error}");
            events::emit_warning(&self.bus, format!("Could not create models directory: {error}"));
        }
        let active = self.store.lock().load_all().clone();
        self.publish_sessions();
        active
    }

    pub fn on_background(&self) {
        if let Err(error) = self.store.lock().save() {
            tracing::warn!("Failed to flush chat history: {error}");
            events::emit_warning(&self.bus, format!("Failed to save chat history: {error}"));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.bus.subscribe()
    }

    #[must_use]
    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    #[must_use]
    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn list_models(&self) -> Vec<CatalogEntry> {
        self.catalog.list()
    }

    pub fn model_status(&self, id: &str) -> ModelStatus {
        self.downloads.status(id)
    }

    pub async fn validate_model_url(&self, url: &str) -> crate::Result<ArtifactDescriptor> {
        self.catalog.validate(url).await
    }

    /// Validates `url` and adds it to the catalog.
    pub async fn add_model(&self, url: &str) -> crate::Result<ArtifactDescriptor> {
        let descriptor = self.catalog.validate(url).await?;
        self.catalog.add(descriptor.clone())?;
        Ok(descriptor)
    }

    pub fn download_model(&self, id: &str) -> crate::Result<bool> {
        self.downloads.queue(id)
    }

    pub fn cancel_download(&self, id: &str) -> bool {
        self.downloads.cancel(id)
    }

    /// Stops any download of `id` and waits for it to settle before the file
    /// is deleted, so a late install cannot outlive the removal.
    pub async fn remove_model(&self, id: &str) -> crate::Result<RemoveOutcome> {
        self.downloads.cancel_and_wait(id).await;
        let descriptor = self
            .catalog
            .descriptor(id)
            .ok_or_else(|| ChatError::NotFound(format!("model {id}")))?;
        if self.engine.loaded_path().as_deref() == Some(self.catalog.local_path(&descriptor).as_path())
        {
            self.engine.unload().await;
        }

        let outcome = self.catalog.remove(id)?;
        if let Some(warning) = &outcome.warning {
            events::emit_warning(&self.bus, warning.clone());
        }
        events::emit_model_status(&self.bus, id, ModelStatus::NotInstalled);
        Ok(outcome)
    }

    /// Loads a downloaded model into the engine slot, replacing any model
    /// already loaded.
    pub async fn load_model(&self, id: &str) -> crate::Result<ModelMetadata> {
        let descriptor = self
            .catalog
            .descriptor(id)
            .ok_or_else(|| ChatError::NotFound(format!("model {id}")))?;
        if !self.catalog.is_downloaded(&descriptor) {
            return Err(ChatError::EngineLoad(format!(
                "{} has not been downloaded yet",
                descriptor.name
            )));
        }
        self.engine.load(&self.catalog.local_path(&descriptor)).await
    }

    pub async fn unload_model(&self) {
        self.engine.unload().await;
    }

    #[must_use]
    pub fn model_loaded(&self) -> bool {
        self.engine.current().is_some()
    }

    pub fn active_session(&self) -> Option<ChatSession> {
        self.store.lock().active().cloned()
    }

    pub fn session(&self, id: &str) -> Option<ChatSession> {
        self.store.lock().session(id).cloned()
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.store.lock().summaries()
    }

    pub fn new_session(&self) -> ChatSession {
        let session = self.store.lock().create_session();
        self.publish_sessions();
        session
    }

    pub fn switch_session(&self, id: &str) -> Option<ChatSession> {
        let session = {
            let mut store = self.store.lock();
            if !store.switch_to(id) {
                return None;
            }
            store.active().cloned()
        };
        self.publish_sessions();
        session
    }

    pub fn delete_session(&self, id: &str) -> bool {
        let deleted = self.store.lock().delete(id);
        if deleted {
            self.publish_sessions();
        }
        deleted
    }

    /// Runs a turn against the active session.
    pub async fn send_message(&self, text: &str) -> crate::Result<TurnOutcome> {
        let active = self
            .store
            .lock()
            .active_id()
            .map(str::to_string)
            .ok_or_else(|| ChatError::NotFound("active session".into()))?;
        self.submit(&active, text).await
    }

    pub async fn submit(&self, session_id: &str, text: &str) -> crate::Result<TurnOutcome> {
        let outcome = self.orchestrator.submit(session_id, text).await?;
        if outcome.session().is_some() {
            self.publish_sessions();
        }
        Ok(outcome)
    }

    fn publish_sessions(&self) {
        let summaries = self.store.lock().summaries();
        events::emit_sessions_changed(&self.bus, summaries);
    }
}

/// `CHAT_ENGINE_CMD` wins, then the configured command, then the in-process
/// backend when compiled in.
pub fn default_loader(settings: &AppSettings) -> crate::Result<Arc<dyn EngineLoader>> {
    if let Some(config) = CommandConfig::from_env() {
        return Ok(Arc::new(CommandEngineLoader::new(config?)));
    }
    if let Some(command) = &settings.engine_command {
        let config = CommandConfig::new(command.clone(), settings.engine_args.clone())?;
        return Ok(Arc::new(CommandEngineLoader::new(config)));
    }
    Ok(fallback_loader())
}

#[cfg(feature = "llama")]
fn fallback_loader() -> Arc<dyn EngineLoader> {
    Arc::new(crate::llm::LlamaLoader)
}

#[cfg(not(feature = "llama"))]
fn fallback_loader() -> Arc<dyn EngineLoader> {
    tracing::warn!("No inference backend configured");
    Arc::new(crate::llm::UnavailableLoader)
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use super::*;
    use crate::chat::Role;
    use crate::testing::{FakeArtifact, FakeEngine, FakeLoader, FakeSource};

    fn context(root: &Path, source: Arc<FakeSource>, loader: Arc<FakeLoader>) -> AppContext {
        let settings = AppSettings {
            min_artifact_bytes: 1024,
            ..AppSettings::default()
        };
        AppContext::new(settings, AppPaths::with_root(root), source, loader)
    }

    #[tokio::test]
    async fn initialize_creates_first_session_and_models_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            Arc::new(FakeSource::new()),
            Arc::new(FakeLoader::sequence(Vec::new())),
        );
        let mut rx = ctx.subscribe();

        let active = ctx.initialize();
        assert_eq!(active.messages[0].role, Role::System);
        assert!(dir.path().join("models").is_dir());
        let written = settings::load_settings(&dir.path().join("config.json")).unwrap();
        assert_eq!(&written, ctx.settings());
        assert!(matches!(rx.recv().await.unwrap(), AppEvent::SessionsChanged(rows) if rows.len() == 1));
    }

    #[tokio::test]
    async fn load_requires_downloaded_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::replying("hi"));
        let loader = Arc::new(FakeLoader::sequence(vec![engine]));
        let ctx = context(dir.path(), Arc::new(FakeSource::new()), loader.clone());
        ctx.initialize();
        let id = ctx.list_models()[0].descriptor.id.clone();

        let result = ctx.load_model(&id).await;
        assert!(matches!(result, Err(ChatError::EngineLoad(_))));
        assert_eq!(loader.load_count(), 0);
        assert!(matches!(
            ctx.load_model("missing").await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn add_model_validates_then_lists() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::new());
        let url = "https://huggingface.co/acme/tiny-GGUF/resolve/main/tiny.gguf";
        source.serve(url, FakeArtifact::ok(vec![0u8; 2048]));
        let ctx = context(dir.path(), source, Arc::new(FakeLoader::sequence(Vec::new())));
        ctx.initialize();

        let descriptor = ctx.add_model(url).await.unwrap();
        assert!(ctx
            .list_models()
            .iter()
            .any(|entry| entry.descriptor.id == descriptor.id && !entry.downloaded));
        assert!(dir.path().join("custom_models.json").exists());
    }

    #[tokio::test]
    async fn session_switching_publishes_changes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            Arc::new(FakeSource::new()),
            Arc::new(FakeLoader::sequence(Vec::new())),
        );
        let first = ctx.initialize();
        let second = ctx.new_session();
        assert_eq!(ctx.active_session().unwrap().id, second.id);

        let switched = ctx.switch_session(&first.id).unwrap();
        assert_eq!(switched, first);
        assert!(ctx.switch_session("nope").is_none());
        assert!(ctx.delete_session(&first.id));
        assert_eq!(ctx.active_session().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn send_without_model_records_error_message() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            Arc::new(FakeSource::new()),
            Arc::new(FakeLoader::sequence(Vec::new())),
        );
        ctx.initialize();

        let outcome = ctx.send_message("Hello").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        let session = ctx.active_session().unwrap();
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.messages[2].role, Role::System);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_during_download_ends_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::new());
        let ctx = context(dir.path(), source.clone(), Arc::new(FakeLoader::sequence(Vec::new())));
        ctx.initialize();
        let descriptor = ctx.list_models()[0].descriptor.clone();
        source.serve(
            &descriptor.url,
            FakeArtifact::ok(vec![3u8; 8 * 1024]).chunked(1024, Duration::from_millis(100)),
        );
        let mut rx = ctx.subscribe();

        assert!(ctx.download_model(&descriptor.id).unwrap());
        ctx.remove_model(&descriptor.id).await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::ModelStatus(payload) = event {
                statuses.push(payload.status);
            }
        }
        assert_eq!(statuses.last(), Some(&ModelStatus::NotInstalled));
        assert!(!ctx.list_models()[0].downloaded);
        assert!(!dir.path().join("models").join(descriptor.local_file_name()).exists());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.model_status(&descriptor.id), ModelStatus::NotInstalled);
    }

    #[tokio::test]
    async fn background_flush_writes_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            Arc::new(FakeSource::new()),
            Arc::new(FakeLoader::sequence(Vec::new())),
        );
        ctx.initialize();
        std::fs::remove_file(dir.path().join("sessions.json")).unwrap();

        ctx.on_background();
        assert!(dir.path().join("sessions.json").exists());
    }
}
