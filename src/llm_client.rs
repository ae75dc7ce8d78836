//! A model client shared by all our services.

use std::{fmt, sync::Arc};

use jsonschema::Validator;
use leaky_bucket::RateLimiter;
use schemars::{JsonSchema, schema_for};
use serde::de::DeserializeOwned;

use crate::{
    drivers::{ChatCompletionResponse, Driver, LlmOpts, LlmRetryResult, TokenUsage},
    error::CapabilityError,
    prelude::*,
    prompt::RenderedPrompt,
    retry::{retry_result_ok, run_with_retries, try_retry_result, try_transient},
};

/// A structured reply from a model.
#[derive(Debug)]
pub struct Completion<T> {
    /// The parsed, schema-checked reply.
    pub value: T,

    /// Token usage, if the driver reported it.
    pub token_usage: Option<TokenUsage>,
}

/// Everything needed to call one model. Built once and then shared read-only.
pub struct LlmClient {
    driver: Arc<dyn Driver>,
    model: String,
    llm_opts: LlmOpts,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClient")
            .field("driver", &self.driver)
            .field("model", &self.model)
            .field("llm_opts", &self.llm_opts)
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish()
    }
}

impl LlmClient {
    /// Create a client using the driver named in `llm_opts`.
    pub async fn new(model: impl Into<String>, llm_opts: LlmOpts) -> Result<Self> {
        let driver = llm_opts.driver.create_driver().await?;
        Ok(Self::with_driver(driver, model, llm_opts))
    }

    /// Create a client using a specific driver.
    pub fn with_driver(
        driver: Box<dyn Driver>,
        model: impl Into<String>,
        llm_opts: LlmOpts,
    ) -> Self {
        let rate_limiter = llm_opts
            .rate_limit
            .as_ref()
            .map(|rate_limit| Arc::new(rate_limit.to_rate_limiter()));
        Self {
            driver: Arc::from(driver),
            model: model.into(),
            llm_opts,
            rate_limiter,
        }
    }

    /// A client for another model, sharing our driver and our rate limit.
    pub fn for_model(&self, model: impl Into<String>) -> Self {
        Self {
            driver: self.driver.clone(),
            model: model.into(),
            llm_opts: self.llm_opts.clone(),
            rate_limiter: self.rate_limiter.clone(),
        }
    }

    /// The model we talk to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send `prompt` to our model, and parse the reply as a `T`.
    ///
    /// The model is asked for JSON matching the schema of `T`, and the reply is
    /// checked against that schema before we deserialize it.
    #[instrument(level = "debug", skip_all, fields(model = %self.model))]
    pub async fn complete<T>(&self, prompt: &RenderedPrompt) -> Result<Completion<T>, CapabilityError>
    where
        T: DeserializeOwned + JsonSchema + Send,
    {
        let schema = response_schema::<T>();
        let validator = jsonschema::validator_for(&schema)
            .map_err(|err| anyhow!("invalid response schema: {err}"))?;
        run_with_retries(self.llm_opts.max_retries, || {
            self.complete_once::<T>(prompt, &schema, &validator)
        })
        .await
    }

    async fn complete_once<T>(
        &self,
        prompt: &RenderedPrompt,
        schema: &Value,
        validator: &Validator,
    ) -> LlmRetryResult<Completion<T>>
    where
        T: DeserializeOwned + Send,
    {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }
        trace!(images = prompt.image_count(), text = %prompt.user_text(), "Prompt");
        let ChatCompletionResponse {
            response,
            token_usage,
        } = try_retry_result!(
            self.driver
                .chat_completion(&self.model, prompt, schema.clone(), &self.llm_opts)
                .await
        );

        // Models sometimes ignore the schema, so check for ourselves. A fresh
        // attempt will often do better.
        try_transient!(
            validator
                .validate(&response)
                .map_err(|err| err.to_owned())
                .with_context(|| format!("model reply did not match schema: {response}"))
        );
        let value = try_transient!(
            serde_json::from_value::<T>(response).context("could not parse model reply")
        );
        retry_result_ok(Completion { value, token_usage })
    }
}

/// The JSON Schema we ask models to follow when replying with a `T`.
pub fn response_schema<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| json!({}));
    // Several providers reject this key in structured output schemas.
    if let Some(schema) = schema.as_object_mut() {
        schema.remove("$schema");
    }
    schema
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use async_openai::error::OpenAIError;
    use keen_retry::RetryResult;

    use super::*;
    use crate::{
        drivers::echo::EchoDriver,
        retry::{IsKnownTransient, retry_result_ok, try_potentially_transient},
    };
    use crate::prompt::Message;

    #[derive(Debug, Deserialize, JsonSchema)]
    #[serde(deny_unknown_fields)]
    struct Reply {
        text: String,
    }

    /// A driver which always returns the same JSON.
    #[derive(Debug)]
    struct FixedDriver {
        response: Value,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Driver for FixedDriver {
        async fn chat_completion(
            &self,
            _model: &str,
            _prompt: &RenderedPrompt,
            _schema: Value,
            _llm_opts: &LlmOpts,
        ) -> LlmRetryResult<ChatCompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            RetryResult::Ok {
                reported_input: (),
                output: ChatCompletionResponse {
                    response: self.response.clone(),
                    token_usage: None,
                },
            }
        }
    }

    /// A driver whose requests never finish.
    #[derive(Debug)]
    struct StuckDriver {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Driver for StuckDriver {
        async fn chat_completion(
            &self,
            _model: &str,
            _prompt: &RenderedPrompt,
            _schema: Value,
            llm_opts: &LlmOpts,
        ) -> LlmRetryResult<ChatCompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let stuck = futures::future::pending::<Result<ChatCompletionResponse, OpenAIError>>();
            let response = try_potentially_transient!(llm_opts.apply_timeout(stuck).await);
            retry_result_ok(response)
        }
    }

    fn prompt(text: &str) -> RenderedPrompt {
        RenderedPrompt {
            developer: None,
            messages: vec![Message {
                text: Some(text.to_owned()),
                images: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn test_for_model_shares_rate_limit() {
        let llm_opts = LlmOpts {
            rate_limit: Some("1/h".parse().unwrap()),
            ..LlmOpts::default()
        };
        let client = LlmClient::with_driver(Box::new(EchoDriver::new()), "a", llm_opts);
        let other = client.for_model("b");
        assert_eq!(other.model(), "b");
        let (Some(ours), Some(theirs)) = (&client.rate_limiter, &other.rate_limiter) else {
            panic!("expected rate limiters");
        };
        assert!(Arc::ptr_eq(ours, theirs));
    }

    #[test]
    fn test_response_schema() {
        let schema = response_schema::<Reply>();
        assert!(schema.get("$schema").is_none());
        assert_eq!(schema["title"], "Reply");
        assert_eq!(schema["additionalProperties"], false);
    }

    #[tokio::test]
    async fn test_complete_with_echo() {
        let client = LlmClient::with_driver(Box::new(EchoDriver::new()), "echo", LlmOpts::default());
        let completion = client.complete::<Reply>(&prompt("hello")).await.unwrap();
        assert_eq!(completion.value.text, "hello");
    }

    #[tokio::test]
    async fn test_timeouts_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let driver = StuckDriver {
            calls: calls.clone(),
        };
        let llm_opts = LlmOpts {
            timeout: 1,
            max_retries: 2,
            ..LlmOpts::default()
        };
        let client = LlmClient::with_driver(Box::new(driver), "stuck", llm_opts);
        let err = client.complete::<Reply>(&prompt("hello")).await.unwrap_err();
        assert!(matches!(err, CapabilityError::TimedOut(d) if d.as_secs() == 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schema_mismatch_fails_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let driver = FixedDriver {
            response: json!({ "txt": "oops" }),
            calls: calls.clone(),
        };
        let client = LlmClient::with_driver(Box::new(driver), "fixed", LlmOpts::default());
        let err = client.complete::<Reply>(&prompt("hello")).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Failed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
