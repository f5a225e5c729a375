use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::session::{ChatMessage, ChatSession, SessionSummary};
use crate::error::ChatError;

const STORE_VERSION: u32 = 1;

pub type SharedSessionStore = Arc<Mutex<SessionStore>>;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSessions {
    version: u32,
    sessions: Vec<ChatSession>,
}

/// Owner of every chat transcript. All mutations go through this type and
/// every mutation rewrites the full collection.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    system_prompt: String,
    sessions: Vec<ChatSession>,
    active_id: Option<String>,
}

impl SessionStore {
    /// An empty store; nothing is read until [`SessionStore::load_all`].
    pub fn new(path: PathBuf, system_prompt: impl Into<String>) -> Self {
        Self {
            path,
            system_prompt: system_prompt.into(),
            sessions: Vec::new(),
            active_id: None,
        }
    }

    pub fn into_shared(self) -> SharedSessionStore {
        Arc::new(Mutex::new(self))
    }

    /// Restores persisted sessions, falling back to a fresh session when the
    /// file is missing, empty or unreadable. Returns the active session.
    pub fn load_all(&mut self) -> &ChatSession {
        self.sessions = match read_sessions(&self.path) {
            Ok(sessions) => sessions,
            Err(error) => {
                tracing::warn!("Chat history unreadable, starting fresh: {error}");
                quarantine(&self.path);
                Vec::new()
            }
        };
        self.active_id = None;

        if self.sessions.is_empty() {
            self.create_session();
        } else {
            self.ensure_active();
        }
        tracing::info!(
            sessions = self.sessions.len(),
            "Loaded chat sessions from {}",
            self.path.display()
        );
        self.active_session()
    }

    pub fn create_session(&mut self) -> ChatSession {
        let session = ChatSession::new(&self.system_prompt);
        self.active_id = Some(session.id.clone());
        self.sessions.push(session.clone());
        self.persist_or_warn();
        session
    }

    /// Activates `id` after saving. Unknown ids leave the current session active.
    pub fn switch_to(&mut self, id: &str) -> bool {
        self.persist_or_warn();
        if self.session(id).is_none() {
            tracing::debug!("Ignoring switch to unknown session {id}");
            return false;
        }
        self.active_id = Some(id.to_string());
        true
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|session| session.id != id);
        if self.sessions.len() == before {
            return false;
        }

        if self.active_id.as_deref() == Some(id) {
            self.active_id = None;
            if self.sessions.is_empty() {
                // create_session persists the new collection itself.
                self.create_session();
                return true;
            }
            self.ensure_active();
        }
        self.persist_or_warn();
        true
    }

    pub fn append_message(&mut self, id: &str, message: ChatMessage) -> crate::Result<&ChatSession> {
        let session = self
            .sessions
            .iter_mut()
            .find(|session| session.id == id)
            .ok_or_else(|| ChatError::NotFound(format!("session {id}")))?;
        session.push(message);
        Ok(session)
    }

    /// Writes the complete collection through a temp file and rename.
    pub fn save(&self) -> crate::Result<()> {
        let payload = PersistedSessions {
            version: STORE_VERSION,
            sessions: self.sessions.clone(),
        };
        write_atomically(&self.path, &payload)
    }

    #[must_use]
    pub fn active_id(&self) -> Option<&str> {
        self.active_id.as_deref()
    }

    #[must_use]
    pub fn active(&self) -> Option<&ChatSession> {
        self.active_id.as_deref().and_then(|id| self.session(id))
    }

    #[must_use]
    pub fn session(&self, id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|session| session.id == id)
    }

    #[must_use]
    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    /// Most recently updated first.
    #[must_use]
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|session| SessionSummary {
                id: session.id.clone(),
                title: session.display_title(),
                updated_at: session.updated_at,
                message_count: session.messages.len(),
                active: self.active_id.as_deref() == Some(session.id.as_str()),
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn active_session(&mut self) -> &ChatSession {
        if self.active().is_none() {
            self.ensure_active();
        }
        let index = self
            .active_id
            .as_deref()
            .and_then(|id| self.sessions.iter().position(|session| session.id == id))
            .unwrap_or(0);
        &self.sessions[index]
    }

    /// Repairs a dangling or empty active id: most recently updated session
    /// wins, otherwise a new session is created.
    fn ensure_active(&mut self) {
        if self.active().is_some() {
            return;
        }
        let latest = self
            .sessions
            .iter()
            .max_by_key(|session| session.updated_at)
            .map(|session| session.id.clone());
        match latest {
            Some(id) => self.active_id = Some(id),
            None => {
                self.create_session();
            }
        }
    }

    fn persist_or_warn(&self) {
        if let Err(error) = self.save() {
            tracing::warn!("Failed to persist chat sessions: {error}");
        }
    }
}

fn read_sessions(path: &Path) -> crate::Result<Vec<ChatSession>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path)
        .map_err(|err| ChatError::Storage(format!("read {}: {err}", path.display())))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let persisted: PersistedSessions = serde_json::from_slice(&bytes)?;
    Ok(persisted.sessions)
}

fn write_atomically(path: &Path, payload: &PersistedSessions) -> crate::Result<()> {
    let storage = |err: std::io::Error| ChatError::Storage(format!("write {}: {err}", path.display()));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(storage)?;
    }
    let serialized = serde_json::to_vec_pretty(payload)?;

    let tmp_path = path.with_extension("json.tmp");
    let mut tmp = File::create(&tmp_path).map_err(storage)?;
    tmp.write_all(&serialized).map_err(storage)?;
    tmp.sync_all().map_err(storage)?;
    drop(tmp);

    fs::rename(&tmp_path, path).map_err(storage)?;
    Ok(())
}

/// Moves an unreadable history file aside so a fresh save cannot erase it.
fn quarantine(path: &Path) {
    if !path.exists() {
        return;
    }
    let aside = path.with_extension("json.corrupt");
    if let Err(error) = fs::rename(path, &aside) {
        tracing::warn!("Could not move corrupt history to {}: {error}", aside.display());
    }
}
