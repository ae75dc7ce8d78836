//! The `ocr` subcommand.

use std::sync::Arc;

use clap::Args;
use futures::future::Abortable;
use schemars::JsonSchema;

use crate::{
    async_utils::io::{read_images, write_json_output, write_text_output},
    drivers::{LlmOpts, TokenUsage},
    error::{PaperError, error_chain},
    orchestrator::{ExtractedPages, FailurePolicy, OrchestratorOpts, extract_pages},
    prelude::*,
    services::{LlmTextExtractor, TextExtractor},
    ui::{ExtractionProgress, Ui},
};

use super::{DEFAULT_MODEL, OutputFormat, abort_on_ctrl_c, create_llm_client};

/// Command line arguments for `ocr`.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Images to read, in order.
    #[clap(value_name = "IMAGE", required = true)]
    pub images: Vec<PathBuf>,

    /// The model used to read the pages.
    #[clap(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Max number of pages to read at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// Skip pages which can't be read, instead of failing.
    #[clap(long)]
    pub best_effort: bool,

    /// Output format. Text output joins all pages, and JSON output has one
    /// entry per page.
    #[clap(long, value_enum, default_value_t = OutputFormat::default())]
    pub output_format: OutputFormat,

    /// Write the text to this file instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,
}

/// OCR output for one page.
#[derive(Debug, Serialize, JsonSchema)]
pub struct OcrOutput {
    /// The image we read.
    pub path: PathBuf,

    /// The text on the page, if we could read it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Why we couldn't read the page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Tokens used reading this page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl OcrOutput {
    /// One output record per input path.
    fn from_pages(paths: &[PathBuf], extracted: ExtractedPages) -> Vec<Self> {
        let mut outputs = paths
            .iter()
            .zip(extracted.pages)
            .map(|(path, page)| OcrOutput {
                path: path.clone(),
                token_usage: page.as_ref().and_then(|page| page.token_usage.clone()),
                text: page.map(|page| page.text),
                error: None,
            })
            .collect::<Vec<_>>();
        for failure in extracted.failures {
            if let Some(output) = failure
                .image_index()
                .and_then(|index| outputs.get_mut(index))
            {
                output.error = Some(error_chain(&failure));
            }
        }
        outputs
    }
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let images = read_images(&opts.images).await?;
    let client = create_llm_client(&opts.model, &opts.llm_opts).await?;
    let extractor: Arc<dyn TextExtractor> = Arc::new(ExtractionProgress::new(
        &ui,
        Arc::new(LlmTextExtractor::new(client)?),
        images.len(),
    ));
    let orchestrator_opts = OrchestratorOpts {
        concurrency_limit: opts.job_count,
        failure_policy: if opts.best_effort {
            FailurePolicy::SkipFailedPages
        } else {
            FailurePolicy::FailFast
        },
    };

    let extraction = extract_pages(extractor.as_ref(), &images, &orchestrator_opts);
    let extracted = Abortable::new(extraction, abort_on_ctrl_c())
        .await
        .map_err(|_aborted| PaperError::Cancelled)??;

    let output_path = opts.output_path.as_deref();
    match opts.output_format {
        OutputFormat::Text => write_text_output(output_path, &extracted.joined_text()).await,
        OutputFormat::Json => {
            let outputs = OcrOutput::from_pages(&opts.images, extracted);
            write_json_output(output_path, &outputs).await
        }
    }
}
