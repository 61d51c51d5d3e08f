//! Text generation for business-logic callers
//!
//! Callers never see the registry's handles; each call borrows one for the
//! duration of a single inference.

use crate::error::ModelResult;
use crate::models::{ModelKey, ModelRegistry, ModelRole, ModelStatus};

/// Generates text with one configured language model
#[derive(Clone)]
pub struct TextGenerator {
    registry: ModelRegistry,
    model: ModelKey,
}

impl TextGenerator {
    pub fn new(registry: ModelRegistry, model: ModelKey) -> Self {
        Self { registry, model }
    }

    /// Generator for the language model called `name`
    pub fn for_language_model(registry: ModelRegistry, name: &str) -> Self {
        Self::new(registry, ModelKey::new(ModelRole::Language, name))
    }

    pub fn model(&self) -> &ModelKey {
        &self.model
    }

    /// Load the model if needed and run one completion
    pub async fn generate_text(&self, prompt: &str, max_tokens: u32) -> ModelResult<String> {
        let handle = self.registry.ensure_loaded(&self.model).await?;
        let result = handle.generate(prompt, max_tokens).await;
        drop(handle);

        match &result {
            Ok(text) => tracing::debug!(
                model = %self.model,
                prompt_chars = prompt.len(),
                output_chars = text.len(),
                "Generated text"
            ),
            Err(e) => tracing::warn!(model = %self.model, error = %e, "Text generation failed"),
        }
        result
    }

    /// Non-blocking readiness probe
    pub fn model_ready(&self) -> bool {
        self.registry.model_ready(&self.model)
    }

    pub fn status(&self) -> ModelStatus {
        self.registry.status(&self.model)
    }
}
