//! Echo driver for testing.
//!
//! This driver never calls a model. It answers with the text of the last user
//! message, placed in the one string property of the response schema. This is
//! enough to run the whole pipeline offline.

use serde_json::Map;

use crate::{
    prelude::*,
    prompt::{Message, RenderedPrompt},
    retry::{retry_result_ok, try_fatal},
};

use super::{ChatCompletionResponse, Driver, LlmOpts, LlmRetryResult, TokenUsage};

/// Echo driver for testing.
#[derive(Debug, Default)]
pub struct EchoDriver;

impl EchoDriver {
    /// Create a new echo driver.
    pub fn new() -> Self {
        Self
    }
}

/// Find the name of the single string property in `schema`.
fn echo_property_name(schema: &Value) -> Result<&str> {
    let properties = schema
        .get("properties")
        .and_then(|properties| properties.as_object())
        .ok_or_else(|| anyhow!("Echo driver requires an object schema, not {schema}"))?;
    if properties.len() != 1 {
        return Err(anyhow!(
            "Echo driver requires exactly one property in the schema, found {}",
            properties.len()
        ));
    }
    let (name, property) = properties
        .iter()
        .next()
        .ok_or_else(|| anyhow!("Echo driver requires exactly one property in the schema"))?;
    if property.get("type") != Some(&json!("string")) {
        return Err(anyhow!(
            "Echo driver requires the {name:?} property to be a string type"
        ));
    }
    Ok(name)
}

/// Extract the text from the last user message.
fn last_user_text(messages: &[Message]) -> Result<String> {
    messages
        .iter()
        .rev()
        .find_map(|message| message.text.clone())
        .ok_or_else(|| anyhow!("No user message text found in prompt"))
}

#[async_trait]
impl Driver for EchoDriver {
    async fn chat_completion(
        &self,
        _model: &str,
        prompt: &RenderedPrompt,
        schema: Value,
        _llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse> {
        let name = try_fatal!(echo_property_name(&schema));
        let text = try_fatal!(last_user_text(&prompt.messages));

        let mut response = Map::new();
        response.insert(name.to_owned(), Value::String(text));
        retry_result_ok(ChatCompletionResponse {
            response: Value::Object(response),
            token_usage: Some(TokenUsage::default()),
        })
    }
}
