mod command;
mod engine;
#[cfg(feature = "llama")]
mod llama;

pub use command::{CommandConfig, CommandEngine, CommandEngineLoader, UnavailableLoader};
pub use engine::{
    Completion, CompletionOptions, EngineLoader, EngineSlot, GenerationOptions, InferenceEngine,
    LoadOptions, ModelMetadata, PromptMessage,
};
#[cfg(feature = "llama")]
pub use llama::{LlamaEngine, LlamaLoader};
