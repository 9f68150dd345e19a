//! Translation through a general-purpose LLM backend.

use super::{LlmBackend, LlmParams, TranslateBackend};
use crate::error::ProviderError;
use async_trait::async_trait;
use std::sync::Arc;

const TRANSLATE_SYSTEM: &str = "You are a translation engine. Translate the user's text into the \
requested language. Keep Markdown syntax and every token of the form \u{27E6}n\u{27E7} exactly as \
written. Reply with the translation only.";

/// Adapts an [`LlmBackend`] into a [`TranslateBackend`].
pub struct LlmTranslateBackend {
    id: String,
    llm: Arc<dyn LlmBackend>,
    temperature: f32,
}

impl LlmTranslateBackend {
    pub fn new(id: impl Into<String>, llm: Arc<dyn LlmBackend>) -> Self {
        Self {
            id: id.into(),
            llm,
            temperature: 0.0,
        }
    }

    fn prompt(segment: &str, target_lang: &str) -> String {
        format!("Target language: {target_lang}\n\n{segment}")
    }
}

#[async_trait]
impl TranslateBackend for LlmTranslateBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn translate(&self, segment: &str, target_lang: &str) -> Result<String, ProviderError> {
        let params = LlmParams {
            system: Some(TRANSLATE_SYSTEM.to_string()),
            temperature: self.temperature,
            max_tokens: None,
            model: None,
        };
        let text = self
            .llm
            .complete(&Self::prompt(segment, target_lang), &params)
            .await?;
        let text = text.trim();
        if text.is_empty() && !segment.trim().is_empty() {
            return Err(ProviderError::InvalidResponse {
                backend: self.id.clone(),
                message: "empty translation".to_string(),
            });
        }
        Ok(text.to_string())
    }
}
