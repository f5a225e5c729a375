mod orchestrator;
mod session;
mod store;
mod token_cache;

pub use orchestrator::{
    TurnOrchestrator, TurnOutcome, TurnRejection, TurnState, EMPTY_RESPONSE_TEXT, STOP_MARKERS,
};
pub use session::{ChatMessage, ChatSession, Role, SessionSummary, DEFAULT_TITLE};
pub use store::{SessionStore, SharedSessionStore};
pub use token_cache::{TokenCountCache, DEFAULT_CAPACITY as DEFAULT_TOKEN_CACHE_CAPACITY};
