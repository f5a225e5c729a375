use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

use super::{
    session::{ChatMessage, ChatSession},
    store::SharedSessionStore,
    token_cache::TokenCountCache,
};
use crate::error::ChatError;
use crate::llm::{EngineSlot, GenerationOptions, InferenceEngine, PromptMessage};

/// Turn boundaries used by the common chat formats (Llama 2/3, ChatML,
/// Phi, Gemma, Command-R, DeepSeek).
pub const STOP_MARKERS: &[&str] = &[
    "</s>",
    "<|end|>",
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "<|EOT|>",
    "<|END_OF_TURN_TOKEN|>",
    "<|end_of_turn|>",
    "<end_of_turn>",
    "<|endoftext|>",
];

pub const EMPTY_RESPONSE_TEXT: &str = "The model did not produce a response. Try rephrasing.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRejection {
    EmptyInput,
    TurnInFlight,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Responded(ChatSession),
    EmptyResponse(ChatSession),
    Failed { session: ChatSession, error: String },
    Rejected(TurnRejection),
}

impl TurnOutcome {
    #[must_use]
    pub fn session(&self) -> Option<&ChatSession> {
        match self {
            TurnOutcome::Responded(session)
            | TurnOutcome::EmptyResponse(session)
            | TurnOutcome::Failed { session, .. } => Some(session),
            TurnOutcome::Rejected(_) => None,
        }
    }
}

pub struct TurnOrchestrator {
    store: SharedSessionStore,
    engine: Arc<EngineSlot>,
    generation: GenerationOptions,
    token_cache: Mutex<TokenCountCache>,
    turns: Mutex<HashMap<String, TurnState>>,
}

impl TurnOrchestrator {
    pub fn new(
        store: SharedSessionStore,
        engine: Arc<EngineSlot>,
        generation: GenerationOptions,
        token_cache_capacity: usize,
    ) -> Self {
        Self {
            store,
            engine,
            generation,
            token_cache: Mutex::new(TokenCountCache::new(token_cache_capacity)),
            turns: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn turn_state(&self, session_id: &str) -> TurnState {
        self.turns
            .lock()
            .get(session_id)
            .copied()
            .unwrap_or(TurnState::Idle)
    }

    /// Runs one user → assistant exchange. Blank input and re-entrant
    /// submissions are rejected without touching the session; engine failures
    /// are recorded in the conversation instead of being returned.
    pub async fn submit(&self, session_id: &str, text: &str) -> crate::Result<TurnOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(TurnOutcome::Rejected(TurnRejection::EmptyInput));
        }
        if self.store.lock().session(session_id).is_none() {
            return Err(ChatError::NotFound(format!("session {session_id}")));
        }
        let Some(_turn) = self.begin_turn(session_id) else {
            tracing::debug!("Turn already in flight for session {session_id}");
            return Ok(TurnOutcome::Rejected(TurnRejection::TurnInFlight));
        };

        let engine = self.engine.current();
        let user_tokens = match &engine {
            Some(engine) => self.count_tokens(engine.as_ref(), text).await,
            None => None,
        };

        let history = {
            let mut store = self.store.lock();
            let session =
                store.append_message(session_id, ChatMessage::user(text).with_token_count(user_tokens))?;
            prompt_history(session)
        };
        let started = Instant::now();

        let result = match &engine {
            Some(engine) => engine
                .completion(&history, &self.generation.with_stop(STOP_MARKERS))
                .await
                .map(|completion| (engine.clone(), completion)),
            None => Err(ChatError::Generation("no model is loaded".into())),
        };
        let elapsed = started.elapsed();

        let (message, kind) = match result {
            Ok((engine, completion)) => {
                let content = strip_stop_markers(&completion.content);
                if content.is_empty() {
                    tracing::warn!("Model returned an empty response for session {session_id}");
                    (ChatMessage::assistant(EMPTY_RESPONSE_TEXT), ReplyKind::Empty)
                } else {
                    let tokens = self.count_tokens(engine.as_ref(), content).await;
                    let mut message = ChatMessage::assistant(content).with_token_count(tokens);
                    message.latency_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
                    message.tokens_per_second = tokens.and_then(|count| throughput(count, elapsed));
                    tracing::info!(
                        latency_ms = message.latency_ms,
                        tokens = message.token_count,
                        "Completed turn for session {session_id}"
                    );
                    (message, ReplyKind::Text)
                }
            }
            Err(error) => {
                tracing::error!("Generation failed for session {session_id}: {error}");
                let message = ChatMessage::system(format!("Error: {error}"));
                (message, ReplyKind::Failed(error.to_string()))
            }
        };

        let session = {
            let mut store = self.store.lock();
            let session = store.append_message(session_id, message)?.clone();
            if let Err(error) = store.save() {
                tracing::warn!("Failed to persist session {session_id}: {error}");
            }
            session
        };

        Ok(match kind {
            ReplyKind::Text => TurnOutcome::Responded(session),
            ReplyKind::Empty => TurnOutcome::EmptyResponse(session),
            ReplyKind::Failed(error) => TurnOutcome::Failed { session, error },
        })
    }

    fn begin_turn(&self, session_id: &str) -> Option<TurnGuard<'_>> {
        let mut turns = self.turns.lock();
        let state = turns.entry(session_id.to_string()).or_insert(TurnState::Idle);
        if *state == TurnState::AwaitingResponse {
            return None;
        }
        *state = TurnState::AwaitingResponse;
        Some(TurnGuard {
            turns: &self.turns,
            session_id: session_id.to_string(),
        })
    }

    async fn count_tokens(&self, engine: &dyn InferenceEngine, text: &str) -> Option<usize> {
        let cached = self.token_cache.lock().get(text);
        if let Some(count) = cached {
            return Some(count);
        }
        match engine.tokenize(text).await {
            Ok(tokens) => {
                self.token_cache.lock().insert(text, tokens.len());
                Some(tokens.len())
            }
            Err(error) => {
                tracing::warn!("Tokenization failed: {error}");
                None
            }
        }
    }
}

enum ReplyKind {
    Text,
    Empty,
    Failed(String),
}

/// Returns the session to idle however the turn ends, including cancellation
/// of the submitting future.
struct TurnGuard<'a> {
    turns: &'a Mutex<HashMap<String, TurnState>>,
    session_id: String,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.turns.lock().remove(&self.session_id);
    }
}

fn prompt_history(session: &ChatSession) -> Vec<PromptMessage> {
    session
        .messages
        .iter()
        .map(|message| PromptMessage {
            role: message.role,
            content: message.content.clone(),
        })
        .collect()
}

fn strip_stop_markers(content: &str) -> &str {
    let end = STOP_MARKERS
        .iter()
        .filter_map(|marker| content.find(marker))
        .min()
        .unwrap_or(content.len());
    content[..end].trim()
}

fn throughput(tokens: usize, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(tokens as f64 / secs)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::chat::{Role, SessionStore};
    use crate::llm::LoadOptions;
    use crate::testing::{FakeEngine, FakeLoader};

    struct Harness {
        _dir: tempfile::TempDir,
        store: SharedSessionStore,
        engine: Arc<FakeEngine>,
        orchestrator: Arc<TurnOrchestrator>,
        session_id: String,
    }

    async fn harness(engine: FakeEngine) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::new(dir.path().join("sessions.json"), "sys");
        let session_id = store.load_all().id.clone();
        let store = store.into_shared();

        let engine = Arc::new(engine);
        let loader = Arc::new(FakeLoader::sequence(vec![engine.clone()]));
        let slot = Arc::new(EngineSlot::new(
            loader,
            LoadOptions::default(),
            Duration::from_secs(10),
        ));
        slot.load(Path::new("/models/fake.gguf")).await.unwrap();

        let orchestrator = Arc::new(TurnOrchestrator::new(
            store.clone(),
            slot,
            GenerationOptions::default(),
            16,
        ));
        Harness {
            _dir: dir,
            store,
            engine,
            orchestrator,
            session_id,
        }
    }

    #[tokio::test]
    async fn successful_turn_appends_user_and_assistant() {
        let h = harness(FakeEngine::replying("Hello there friend")).await;
        let outcome = h.orchestrator.submit(&h.session_id, "Hi model").await.unwrap();

        let TurnOutcome::Responded(session) = outcome else {
            panic!("expected a response, got {outcome:?}");
        };
        assert_eq!(session.messages.len(), 3);
        let user = &session.messages[1];
        assert_eq!(user.role, Role::User);
        assert_eq!(user.content, "Hi model");
        assert_eq!(user.token_count, Some(2));

        let reply = &session.messages[2];
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "Hello there friend");
        assert_eq!(reply.token_count, Some(3));
        assert!(reply.latency_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_uses_elapsed_time() {
        let h = harness(
            FakeEngine::replying("one two three four").with_delay(Duration::from_secs(2)),
        )
        .await;
        let outcome = h.orchestrator.submit(&h.session_id, "count").await.unwrap();
        let session = outcome.session().unwrap();
        let reply = session.messages.last().unwrap();
        assert_eq!(reply.latency_ms, Some(2000));
        let tps = reply.tokens_per_second.unwrap();
        assert!((tps - 2.0).abs() < 1e-6, "tokens/sec was {tps}");
    }

    #[tokio::test]
    async fn engine_receives_full_history_and_stop_markers() {
        let h = harness(FakeEngine::replying("ok")).await;
        h.orchestrator.submit(&h.session_id, "first").await.unwrap();
        h.orchestrator.submit(&h.session_id, "second").await.unwrap();

        let (messages, options) = h.engine.last_request().unwrap();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(messages[3].content, "second");
        assert!(options.stop.iter().any(|marker| marker == "<|im_end|>"));
        assert_eq!(options.stop.len(), STOP_MARKERS.len());
    }

    #[tokio::test]
    async fn blank_input_is_rejected_without_engine_call() {
        let h = harness(FakeEngine::replying("ok")).await;
        for input in ["", "   \n\t"] {
            let outcome = h.orchestrator.submit(&h.session_id, input).await.unwrap();
            assert_eq!(outcome, TurnOutcome::Rejected(TurnRejection::EmptyInput));
        }
        assert_eq!(h.engine.completion_count(), 0);
        assert_eq!(h.store.lock().session(&h.session_id).unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_submission_is_a_noop() {
        let h = harness(FakeEngine::replying("done").with_delay(Duration::from_millis(50))).await;
        let (first, second) = tokio::join!(
            h.orchestrator.submit(&h.session_id, "one"),
            h.orchestrator.submit(&h.session_id, "two"),
        );

        assert!(matches!(first.unwrap(), TurnOutcome::Responded(_)));
        assert_eq!(
            second.unwrap(),
            TurnOutcome::Rejected(TurnRejection::TurnInFlight)
        );
        assert_eq!(h.engine.completion_count(), 1);
        let store = h.store.lock();
        let messages = &store.session(&h.session_id).unwrap().messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(h.orchestrator.turn_state(&h.session_id), TurnState::Idle);
    }

    #[tokio::test]
    async fn empty_generation_appends_placeholder() {
        let h = harness(FakeEngine::replying("   <|im_end|>")).await;
        let outcome = h.orchestrator.submit(&h.session_id, "hello").await.unwrap();
        let TurnOutcome::EmptyResponse(session) = outcome else {
            panic!("expected empty response, got {outcome:?}");
        };
        let reply = session.messages.last().unwrap();
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, EMPTY_RESPONSE_TEXT);
        assert_eq!(reply.tokens_per_second, None);
        assert_eq!(reply.latency_ms, None);
    }

    #[tokio::test]
    async fn engine_failure_becomes_error_message_and_session_stays_usable() {
        let h = harness(FakeEngine::failing("context overflow")).await;
        let outcome = h.orchestrator.submit(&h.session_id, "hello").await.unwrap();
        let TurnOutcome::Failed { session, error } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("context overflow"));
        let last = session.messages.last().unwrap();
        assert_eq!(last.role, Role::System);
        assert!(last.content.contains("context overflow"));

        h.engine.set_reply("recovered");
        let outcome = h.orchestrator.submit(&h.session_id, "again").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Responded(_)));
    }

    #[tokio::test]
    async fn every_outcome_is_persisted() {
        let h = harness(FakeEngine::failing("boom")).await;
        h.orchestrator.submit(&h.session_id, "hello").await.unwrap();

        let path = h.store.lock().path().to_path_buf();
        let mut restarted = SessionStore::new(path, "sys");
        let session = restarted.load_all().clone();
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.messages[1].content, "hello");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let h = harness(FakeEngine::replying("ok")).await;
        let result = h.orchestrator.submit("missing", "hello").await;
        assert!(matches!(result, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn token_counts_are_cached_by_text() {
        let h = harness(FakeEngine::replying("same")).await;
        h.orchestrator.submit(&h.session_id, "repeat").await.unwrap();
        h.orchestrator.submit(&h.session_id, "repeat").await.unwrap();
        // "repeat" and "same" each tokenized once.
        assert_eq!(h.engine.tokenize_count(), 2);
    }

    #[test]
    fn stop_markers_truncate_output() {
        assert_eq!(strip_stop_markers("Hi!<|eot_id|>junk"), "Hi!");
        assert_eq!(strip_stop_markers("  plain  "), "plain");
    }

    #[test]
    fn throughput_guards_zero_elapsed() {
        assert_eq!(throughput(10, Duration::ZERO), None);
        assert_eq!(throughput(10, Duration::from_secs(5)), Some(2.0));
    }
}
