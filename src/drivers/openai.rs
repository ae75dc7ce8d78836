//! Our OpenAI driver, which we also use for LiteLLM, Ollama and other
//! compatible gateways.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateChatCompletionResponse, FinishReason},
};

use crate::{
    drivers::TokenUsage,
    prelude::*,
    prompt::{Message, RenderedPrompt},
    retry::{
        IsKnownTransient, retry_result_fatal, retry_result_ok, try_fatal,
        try_potentially_transient, try_transient,
    },
};

use super::{ChatCompletionResponse, Driver, LlmOpts, LlmRetryResult};

/// Talks to anything which speaks the OpenAI chat completions API.
#[derive(Debug)]
pub struct OpenAiDriver {
    client: Client<OpenAIConfig>,
}

impl OpenAiDriver {
    /// Create a new OpenAI driver, configured from `OPENAI_API_KEY` and
    /// `OPENAI_API_BASE`.
    pub async fn new() -> Result<Self> {
        let mut client_config = OpenAIConfig::new();
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            client_config = client_config.with_api_key(api_key);
        }
        if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
            client_config = client_config.with_api_base(api_base);
        }
        Ok(Self {
            client: Client::with_config(client_config),
        })
    }
}

#[async_trait]
impl Driver for OpenAiDriver {
    #[instrument(level = "debug", skip_all, fields(model = model))]
    async fn chat_completion(
        &self,
        model: &str,
        prompt: &RenderedPrompt,
        schema: Value,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse> {
        // Build our request.
        let req = build_request(model, prompt, schema, llm_opts);
        trace!(%req, "Request");

        // Run our LLM request with a timeout.
        let chat = self.client.chat();
        let future = llm_opts.apply_timeout(chat.create_byot::<_, Value>(req));
        let chat_result = try_potentially_transient!(future.await);
        debug!(%chat_result, "OpenAI response");
        let response = try_fatal!(
            serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
                .context("Error parsing OpenAI response")
        );

        // Compute our token usage.
        let token_usage = response.usage.map(|usage| TokenUsage {
            prompt_tokens: u64::from(usage.prompt_tokens),
            completion_tokens: u64::from(usage.completion_tokens),
        });

        // Extract our response content.
        let Some(choice) = response.choices.first() else {
            return retry_result_fatal(anyhow!("No choices in OpenAI response").into());
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(
                anyhow!("Content filter triggered (may also be a RECITATION error for Gemini models)")
                    .into(),
            );
        }
        let Some(content) = choice.message.content.as_deref() else {
            return retry_result_fatal(anyhow!("No content in OpenAI response").into());
        };
        let response = try_transient!(
            // If we didn't get JSON here, the model ignored our response format.
            // Another attempt may do better.
            serde_json::from_str::<Value>(content)
                .with_context(|| format!("Error parsing OpenAI response content: {:?}", content))
        );
        retry_result_ok(ChatCompletionResponse {
            response,
            token_usage,
        })
    }
}

/// Build a chat completion request as raw JSON, for use with `create_byot`.
fn build_request(model: &str, prompt: &RenderedPrompt, schema: Value, llm_opts: &LlmOpts) -> Value {
    let mut messages = vec![];
    if let Some(developer) = &prompt.developer {
        messages.push(json!({ "role": "system", "content": developer }));
    }
    messages.extend(prompt.messages.iter().map(user_message));

    let name = schema
        .get("title")
        .and_then(|title| title.as_str())
        .unwrap_or("ResponseFormat")
        .to_owned();
    let mut req = json!({
        "model": model,
        "messages": messages,
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": name,
                "schema": schema,
                "strict": true,
            },
        },
        // Don't keep copies of textbook pages around on the provider's side.
        "store": false,
    });
    if let Some(max_completion_tokens) = llm_opts.max_completion_tokens {
        req["max_completion_tokens"] = json!(max_completion_tokens);
    }
    if let Some(temperature) = llm_opts.temperature {
        req["temperature"] = json!(temperature);
    }
    if let Some(top_p) = llm_opts.top_p {
        req["top_p"] = json!(top_p);
    }
    req
}

fn user_message(message: &Message) -> Value {
    if message.images.is_empty() {
        return json!({
            "role": "user",
            "content": message.text.as_deref().unwrap_or_default(),
        });
    }
    let mut parts = vec![];
    if let Some(text) = &message.text {
        parts.push(json!({ "type": "text", "text": text }));
    }
    for image in &message.images {
        parts.push(json!({ "type": "image_url", "image_url": { "url": image } }));
    }
    json!({ "role": "user", "content": parts })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> RenderedPrompt {
        RenderedPrompt {
            developer: Some("Be exact.".to_owned()),
            messages: vec![
                Message {
                    text: Some("Read this.".to_owned()),
                    images: vec!["data:image/png;base64,AAAA".to_owned()],
                },
                Message {
                    text: Some("Thanks.".to_owned()),
                    images: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_build_request() {
        let llm_opts = LlmOpts {
            temperature: Some(0.5),
            ..LlmOpts::default()
        };
        let schema = json!({ "title": "PageText", "type": "object" });
        let req = build_request("gpt-4o-mini", &prompt(), schema, &llm_opts);

        assert_eq!(req["model"], "gpt-4o-mini");
        assert_eq!(req["store"], false);
        assert_eq!(req["temperature"], 0.5);
        assert!(req.get("top_p").is_none());
        assert_eq!(req["response_format"]["json_schema"]["name"], "PageText");

        let messages = req["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"][0]["text"], "Read this.");
        assert_eq!(
            messages[1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
        assert_eq!(messages[2]["content"], "Thanks.");
    }
}
