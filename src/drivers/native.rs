//! Native LLM driver, which talks to each provider's own API.
//!
//! We use the [`genai`] crate, which picks a provider based on the model name
//! and reads API keys from the usual environment variables.

use std::sync::Arc;

use genai::{
    Client,
    chat::{
        ChatMessage, ChatOptions, ChatRequest, ChatResponseFormat, ChatRole, ContentPart,
        ImageSource, JsonSpec, MessageContent, Usage,
    },
    webc,
};

use crate::{
    data_url::parse_data_url,
    prelude::*,
    prompt::{Message, RenderedPrompt},
    retry::{IsKnownTransient, retry_result_ok, try_fatal, try_potentially_transient, try_transient},
};

use super::{ChatCompletionResponse, Driver, LlmOpts, LlmRetryResult, TokenUsage};

/// Driver for talking to providers natively.
#[derive(Debug)]
pub struct NativeDriver {
    client: Client,
}

impl NativeDriver {
    /// Create a new native driver.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            client: Client::default(),
        })
    }
}

#[async_trait]
impl Driver for NativeDriver {
    #[instrument(level = "debug", skip_all, fields(model = model))]
    async fn chat_completion(
        &self,
        model: &str,
        prompt: &RenderedPrompt,
        schema: Value,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse> {
        // Report what native driver we're using under the hood.
        if let Ok(service_target) = self.client.resolve_service_target(model).await {
            debug!(
                adapter_kind = %service_target.model.adapter_kind,
                "Using native driver"
            );
        }

        // Convert our prompt to a genai request and build our options.
        let req = try_fatal!(to_genai_request(prompt));
        let name = schema
            .get("title")
            .and_then(|title| title.as_str())
            .unwrap_or("ResponseFormat")
            .to_owned();
        let opts = ChatOptions {
            temperature: llm_opts.temperature.map(f64::from),
            max_tokens: llm_opts.max_completion_tokens,
            top_p: llm_opts.top_p.map(f64::from),
            response_format: Some(ChatResponseFormat::JsonSpec(JsonSpec {
                name,
                description: None,
                schema,
            })),
            ..ChatOptions::default()
        };

        // Run our LLM request with a timeout.
        let future = llm_opts.apply_timeout(self.client.exec_chat(model, req, Some(&opts)));
        let chat_res = try_potentially_transient!(future.await);

        // Extract our response content.
        let content = try_fatal!(
            chat_res
                .content
                .as_ref()
                .ok_or_else(|| anyhow!("No content in response: {:?}", chat_res))
        );
        let content_str = try_fatal!(
            content
                .text_as_str()
                .ok_or_else(|| anyhow!("Expected text content in response, found: {:?}", content))
        );
        // Extract JSON from our content. If it isn't JSON, the model ignored
        // our response format, so give it another chance.
        let response = try_transient!(
            serde_json::from_str::<Value>(content_str)
                .with_context(|| format!("Error parsing response content: {content_str:?}"))
        );
        debug!(%response, "Response");

        // Compute our token usage.
        let token_usage = if let Usage {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
            ..
        } = chat_res.usage
        {
            Some(TokenUsage {
                prompt_tokens: u64::try_from(prompt_tokens).unwrap_or_default(),
                completion_tokens: u64::try_from(completion_tokens).unwrap_or_default(),
            })
        } else {
            None
        };

        retry_result_ok(ChatCompletionResponse {
            response,
            token_usage,
        })
    }
}

impl IsKnownTransient for genai::Error {
    fn is_known_transient(&self) -> bool {
        match self {
            genai::Error::NoChatResponse { .. }
            | genai::Error::InvalidJsonResponseElement { .. } => true,
            genai::Error::WebAdapterCall { webc_error, .. }
            | genai::Error::WebModelCall { webc_error, .. } => webc_error.is_known_transient(),
            _ => false,
        }
    }
}

impl IsKnownTransient for webc::Error {
    fn is_known_transient(&self) -> bool {
        match self {
            webc::Error::ResponseFailedNotJson { .. } => true,
            webc::Error::ResponseFailedStatus { status, .. } => status.is_known_transient(),
            webc::Error::Reqwest(error) => error.is_known_transient(),
            _ => false,
        }
    }
}

fn to_genai_request(prompt: &RenderedPrompt) -> Result<ChatRequest> {
    let messages = prompt
        .messages
        .iter()
        .map(to_genai_message)
        .collect::<Result<Vec<_>>>()?;
    Ok(ChatRequest {
        system: prompt.developer.clone(),
        messages,
        ..ChatRequest::default()
    })
}

fn to_genai_message(message: &Message) -> Result<ChatMessage> {
    match message {
        Message { text, images } if !images.is_empty() => {
            let mut parts = vec![];
            if let Some(text) = text {
                parts.push(ContentPart::Text(text.clone()));
            }
            for image in images {
                let (mime_type, data) = parse_data_url(image)
                    .ok_or_else(|| anyhow!("expected a base64 data: URL for image"))?;
                parts.push(ContentPart::Image {
                    content_type: mime_type,
                    source: ImageSource::Base64(Arc::from(data)),
                });
            }
            Ok(ChatMessage {
                role: ChatRole::User,
                content: MessageContent::Parts(parts),
                options: None,
            })
        }
        Message {
            text: Some(text), ..
        } => Ok(ChatMessage::user(text.clone())),
        Message { .. } => Err(anyhow!("No text or images in user message")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_genai_request() {
        let prompt = RenderedPrompt {
            developer: Some("Be exact.".to_owned()),
            messages: vec![Message {
                text: Some("Read this.".to_owned()),
                images: vec!["data:image/jpeg;base64,/9j/".to_owned()],
            }],
        };
        let req = to_genai_request(&prompt).unwrap();
        assert_eq!(req.system.as_deref(), Some("Be exact."));
        assert_eq!(req.messages.len(), 1);
        let MessageContent::Parts(parts) = &req.messages[0].content else {
            panic!("expected a multi-part message");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(
            &parts[1],
            ContentPart::Image { content_type, .. } if content_type == "image/jpeg"
        ));
    }

    #[test]
    fn test_bad_messages_are_rejected() {
        let empty = Message {
            text: None,
            images: vec![],
        };
        assert!(to_genai_message(&empty).is_err());

        let not_a_data_url = Message {
            text: None,
            images: vec!["https://example.com/page.png".to_owned()],
        };
        assert!(to_genai_message(&not_a_data_url).is_err());
    }
}
