//! LLM drivers.
//!
//! A driver knows how to send a [`RenderedPrompt`] to one family of model APIs
//! and get back a JSON response matching a schema. Everything above this layer
//! is driver-agnostic.

use std::{error, fmt, ops::AddAssign, pin::Pin, time::Duration};

use clap::{Args, ValueEnum};
use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::RetryResult;
use schemars::JsonSchema;
use tokio::time;

use crate::{
    error::CapabilityError, prelude::*, prompt::RenderedPrompt, rate_limit::RateLimit,
    retry::IsKnownTransient,
};

pub mod echo;
pub mod native;
pub mod openai;

/// Our different driver types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum DriverType {
    /// OpenAI driver (also for LiteLLM, Ollama, etc).
    #[default]
    #[clap(name = "openai")]
    OpenAI,

    /// Talk to each provider's native API, based on the model name.
    Native,

    /// Don't call any model. Echo the prompt back (for testing).
    Echo,
}

impl DriverType {
    /// Instantiate an appropriate driver.
    pub async fn create_driver(&self) -> Result<Box<dyn Driver>> {
        match self {
            DriverType::OpenAI => Ok(Box::new(openai::OpenAiDriver::new().await?)),
            DriverType::Native => Ok(Box::new(native::NativeDriver::new().await?)),
            DriverType::Echo => Ok(Box::new(echo::EchoDriver::new())),
        }
    }
}

/// Options for talking to LLMs.
#[derive(Args, Clone, Debug)]
pub struct LlmOpts {
    /// The LLM driver to use. The default works with OpenAI, LiteLLM and
    /// Ollama.
    #[clap(long, value_enum, default_value_t = DriverType::default())]
    pub driver: DriverType,

    /// An upper limit on the number of completion tokens to generate. This may
    /// help prevent runaway responses, but it may also cause incomplete
    /// results.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// The temperature to use for sampling, between 0.0 and 2.0. Defaults to
    /// the model's default.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// The top-p sampling value to use, between 0.0 and 1.0. Defaults to the
    /// model's default.
    #[clap(long)]
    pub top_p: Option<f32>,

    /// A timeout, in seconds, for each LLM request. Note that even if a
    /// request times out, you'll probably still be charged. 0 waits forever.
    #[clap(long, default_value = "120")]
    pub timeout: u64,

    /// A rate limit for LLM API requests, of the form "10/s", "500/m" or
    /// "2000/h". This is applied separately from `--jobs`.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// Retry requests which fail for reasons that look transient, up to this
    /// many times, with exponential backoff. By default, we never retry.
    #[clap(long, default_value = "0")]
    pub max_retries: u8,
}

impl Default for LlmOpts {
    fn default() -> Self {
        Self {
            driver: DriverType::default(),
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            timeout: 120,
            rate_limit: None,
            max_retries: 0,
        }
    }
}

impl LlmOpts {
    /// Our per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Apply our timeout to a future.
    ///
    /// `'fut` is the lifetime of any data borrowed by `future`, which we need
    /// to preserve. We box the result because the two branches have different
    /// future types.
    pub fn apply_timeout<'fut, T, E>(
        &self,
        future: impl Future<Output = Result<T, E>> + Send + 'fut,
    ) -> Pin<Box<dyn Future<Output = Result<T, LlmError<E>>> + Send + 'fut>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let future = future.map_err(LlmError::Native);
        if self.timeout == 0 {
            return future.boxed();
        }
        let timeout = self.timeout();
        time::timeout(timeout, future)
            // Flatten `Result<Result<T, LlmError<E>>, Elapsed>`.
            .map(move |result| match result {
                Ok(inner) => inner,
                Err(_) => Err(LlmError::Timeout(timeout)),
            })
            .boxed()
    }
}

/// A [`RetryResult`] for LLM requests. This allows [`Driver`] instances to
/// distinguish between errors that may be transient, and errors that are
/// definitely fatal.
pub type LlmRetryResult<T> = RetryResult<(), (), T, CapabilityError>;

/// Interface trait for LLM drivers.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync + 'static {
    /// Run a "chat completion" request, asking for a JSON response matching
    /// `schema`.
    ///
    /// Drivers don't need to validate the response against `schema`. We do
    /// that for them.
    async fn chat_completion(
        &self,
        model: &str,
        prompt: &RenderedPrompt,
        schema: Value,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse>;
}

/// A chat completion response.
#[derive(Debug)]
pub struct ChatCompletionResponse {
    /// Structured response from the LLM. This will not have been
    /// validated yet.
    pub response: Value,

    /// Token usage.
    pub token_usage: Option<TokenUsage>,
}

/// Token usage.
#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    /// How many tokens were used in the prompt?
    pub prompt_tokens: u64,

    /// How many tokens were used in the response?
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Was our token usage zero?
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }

    /// Add up optional usage reports, returning `None` if nothing was used.
    pub fn sum<'a>(usages: impl IntoIterator<Item = Option<&'a TokenUsage>>) -> Option<Self> {
        let mut total = TokenUsage::default();
        for usage in usages.into_iter().flatten() {
            total += usage.clone();
        }
        if total.is_zero() { None } else { Some(total) }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// An error which occurred while calling an LLM.
///
/// Used internally by drivers to handle timeouts.
#[derive(Debug)]
pub enum LlmError<E> {
    /// A native error.
    Native(E),

    /// We gave up waiting after this long.
    Timeout(Duration),
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Timeouts go straight back to the caller, who decides whether to
            // try again.
            LlmError::Timeout(_) => false,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "LLM error: {err}"),
            LlmError::Timeout(after) => {
                write!(f, "LLM request timed out after {}s", after.as_secs())
            }
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout(_) => None,
        }
    }
}
