//! Command-line entry points.

use std::sync::Arc;

use clap::ValueEnum;
use futures::future::{AbortHandle, AbortRegistration};

use crate::{drivers::LlmOpts, llm_client::LlmClient, prelude::*};

pub mod generate;
pub mod ocr;
pub mod schema;

/// The model we use if none is specified.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// How to print our results.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Plain text.
    #[default]
    Text,
    /// Pretty-printed JSON, with extra details.
    Json,
}

/// Create a shared model client.
pub async fn create_llm_client(model: &str, llm_opts: &LlmOpts) -> Result<Arc<LlmClient>> {
    let client = LlmClient::new(model, llm_opts.clone())
        .await
        .with_context(|| format!("could not create {:?} driver", llm_opts.driver))?;
    Ok(Arc::new(client))
}

/// Get an [`AbortRegistration`] which is aborted when the user hits Ctrl-C.
pub fn abort_on_ctrl_c() -> AbortRegistration {
    let (handle, registration) = AbortHandle::new_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding requests");
            handle.abort();
        }
    });
    registration
}
