//! Text extraction (OCR) using a vision-capable model.

use std::sync::Arc;

use schemars::JsonSchema;

use crate::{
    drivers::TokenUsage,
    error::CapabilityError,
    llm_client::LlmClient,
    payload::ImagePayload,
    prelude::*,
    prompt::{ChatPrompt, JsonObject, RenderedPrompt},
};

use super::TextExtractor;

/// Our built-in OCR prompt.
const EXTRACT_TEXT_PROMPT: &str = include_str!("extraction/extract_text_prompt.toml");

/// The reply we ask the model for.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct PageText {
    /// All the text visible on the page, in reading order. Empty if the page
    /// has no text.
    text: String,
}

/// Text extracted from a single image.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    pub token_usage: Option<TokenUsage>,
}

/// Extracts text by showing each page to a model.
#[derive(Debug)]
pub struct LlmTextExtractor {
    client: Arc<LlmClient>,
    prompt: ChatPrompt,
}

impl LlmTextExtractor {
    /// Create an extractor using our built-in prompt.
    pub fn new(client: Arc<LlmClient>) -> Result<Self> {
        let prompt = ChatPrompt::from_toml_str(EXTRACT_TEXT_PROMPT)?;
        Ok(Self { client, prompt })
    }

    fn render_prompt(&self, image: &ImagePayload) -> Result<RenderedPrompt> {
        let mut bindings = JsonObject::new();
        bindings.insert("page_data_url".to_owned(), json!(image.to_data_url()));
        self.prompt.render(&bindings)
    }
}

#[async_trait]
impl TextExtractor for LlmTextExtractor {
    #[instrument(level = "debug", skip_all, fields(model = %self.client.model(), mime_type = image.mime_type(), bytes = image.data().len()))]
    async fn extract(&self, image: &ImagePayload) -> Result<ExtractedText, CapabilityError> {
        let prompt = self.render_prompt(image)?;
        let completion = self.client.complete::<PageText>(&prompt).await?;
        Ok(ExtractedText {
            text: completion.value.text,
            token_usage: completion.token_usage,
        })
    }
}
