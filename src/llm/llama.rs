use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use llama_cpp::{
    standard_sampler::{SamplerStage, StandardSampler},
    LlamaModel, LlamaParams, SessionParams,
};
use tokio::task;

use super::engine::{
    Completion, CompletionOptions, EngineLoader, InferenceEngine, LoadOptions, ModelMetadata,
    PromptMessage,
};
use crate::chat::Role;
use crate::error::ChatError;

const MAX_GENERATED_CHARS: usize = 16 * 1024;

/// In-process llama.cpp backend.
pub struct LlamaEngine {
    model: LlamaModel,
    context_length: u32,
}

impl LlamaEngine {
    fn session_params(&self) -> SessionParams {
        let mut params = SessionParams::default();
        params.n_ctx = self.context_length;
        params.n_batch = params.n_ctx.min(512);
        params
    }
}

#[async_trait]
impl InferenceEngine for LlamaEngine {
    async fn tokenize(&self, text: &str) -> crate::Result<Vec<i32>> {
        let model = self.model.clone();
        let text = text.to_string();
        task::spawn_blocking(move || {
            model
                .tokenize_bytes(text.as_bytes(), false, false)
                .map(|tokens| tokens.into_iter().map(|token| token.0).collect())
                .map_err(|err| ChatError::Generation(format!("tokenization failed: {err}")))
        })
        .await
        .map_err(|err| ChatError::Generation(format!("tokenize task interrupted: {err}")))?
    }

    async fn completion(
        &self,
        messages: &[PromptMessage],
        options: &CompletionOptions,
    ) -> crate::Result<Completion> {
        let model = self.model.clone();
        let params = self.session_params();
        let prompt = format_chatml(messages);
        let options = options.clone();

        task::spawn_blocking(move || {
            let mut session = model
                .create_session(params)
                .map_err(|err| ChatError::Generation(format!("failed to create session: {err}")))?;
            session
                .advance_context(prompt.as_bytes())
                .map_err(|err| ChatError::Generation(format!("failed to prime context: {err}")))?;

            let sampler = StandardSampler::new_softmax(
                vec![
                    SamplerStage::Temperature(options.temperature),
                    SamplerStage::TopK(options.top_k),
                    SamplerStage::TopP(options.top_p),
                ],
                1,
            );
            let max_tokens = usize::try_from(options.n_predict).unwrap_or(0);
            let handle = session
                .start_completing_with(sampler, max_tokens)
                .map_err(|err| ChatError::Generation(format!("failed to start completion: {err}")))?;

            let mut output = String::new();
            for chunk in handle.into_strings() {
                output.push_str(&chunk);
                if options.stop.iter().any(|marker| output.contains(marker.as_str()))
                    || output.len() >= MAX_GENERATED_CHARS
                {
                    break;
                }
            }
            Ok(Completion { content: output })
        })
        .await
        .map_err(|err| ChatError::Generation(format!("completion task interrupted: {err}")))?
    }

    async fn metadata(&self) -> crate::Result<ModelMetadata> {
        Ok(ModelMetadata {
            description: None,
            parameter_count: None,
            context_length: u32::try_from(self.model.train_len()).ok(),
        })
    }

    async fn release(&self) -> crate::Result<()> {
        Ok(())
    }
}

pub struct LlamaLoader;

#[async_trait]
impl EngineLoader for LlamaLoader {
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
        let path = path.to_path_buf();
        let mut params = LlamaParams::default();
        params.n_gpu_layers = options.gpu_layers;
        params.use_mlock = options.use_mlock;

        let model = task::spawn_blocking(move || {
            LlamaModel::load_from_file(&path, params)
                .map_err(|err| ChatError::EngineLoad(format!("failed to load model: {err}")))
        })
        .await
        .map_err(|err| ChatError::EngineLoad(format!("model load task interrupted: {err}")))??;

        Ok(Arc::new(LlamaEngine {
            model,
            context_length: options.context_length,
        }))
    }
}

fn format_chatml(messages: &[PromptMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        prompt.push_str(&format!("<|im_start|>{role}\n{}<|im_end|>\n", message.content));
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}
