//! On-device chat backend: model catalog and downloads, an engine slot that
//! holds one loaded model, and persisted chat sessions driven turn by turn.

pub mod chat;
pub mod core;
pub mod error;
pub mod llm;
pub mod models;

#[cfg(test)]
mod testing;

pub use error::{ChatError, Result};
