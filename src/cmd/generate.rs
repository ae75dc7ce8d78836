//! The `generate` subcommand.

use std::sync::Arc;

use clap::Args;
use schemars::JsonSchema;

use crate::{
    async_utils::io::{read_images, read_json_or_toml, write_json_output, write_text_output},
    drivers::{LlmOpts, TokenUsage},
    options::GenerationOptions,
    orchestrator::{FailurePolicy, OrchestratorOpts, TestPaperOrchestrator},
    payload::ImagePayload,
    prelude::*,
    services::{LlmPaperComposer, LlmTextExtractor, PaperComposer, TextExtractor},
    ui::{CompositionProgress, ExtractionProgress, Ui},
};

use super::{DEFAULT_MODEL, OutputFormat, abort_on_ctrl_c, create_llm_client};

/// Command line arguments for `generate`.
#[derive(Debug, Args)]
pub struct GenerateOpts {
    /// Photos of textbook pages, in order.
    #[clap(
        value_name = "IMAGE",
        required_unless_present = "request_path",
        conflicts_with = "request_path"
    )]
    pub images: Vec<PathBuf>,

    /// Total marks for the test paper.
    #[clap(long, required_unless_present = "request_path", conflicts_with = "request_path")]
    pub marks: Option<i64>,

    /// The language to write the test paper in.
    #[clap(long, conflicts_with = "request_path")]
    pub language: Option<String>,

    /// Formatting instructions, passed to the model as-is. These take
    /// precedence over the default paper structure.
    #[clap(long, conflicts_with = "request_path")]
    pub format_instructions: Option<String>,

    /// A question type to include, such as "Essay" or "True/False". May be
    /// repeated. Defaults to a mix of multiple choice, short answer and essay
    /// questions.
    #[clap(
        short = 't',
        long = "question-type",
        value_name = "TYPE",
        conflicts_with = "request_path"
    )]
    pub question_types: Vec<String>,

    /// An image of a sample paper whose layout should be copied. Its content
    /// is never used.
    #[clap(long, value_name = "IMAGE", conflicts_with = "request_path")]
    pub format_reference: Option<PathBuf>,

    /// Read the whole request from a TOML or JSON file instead. Run
    /// `paper-smith schema PaperRequest` for the format.
    #[clap(long = "request", value_name = "FILE")]
    pub request_path: Option<PathBuf>,

    /// The model used to write the paper.
    #[clap(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// The model used to read the pages. Defaults to `--model`.
    #[clap(long)]
    pub ocr_model: Option<String>,

    /// Max number of pages to read at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// Skip pages which can't be read, instead of failing. Skipped pages are
    /// reported on stderr and in JSON output.
    #[clap(long)]
    pub best_effort: bool,

    /// Output format.
    #[clap(long, value_enum, default_value_t = OutputFormat::default())]
    pub output_format: OutputFormat,

    /// Write the paper to this file instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,
}

/// A test paper request, as stored in a file.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PaperRequest {
    /// Page images, in order. Relative paths are resolved against the
    /// directory containing the request file.
    pub images: Vec<PathBuf>,

    /// Total marks for the test paper.
    pub marks: i64,

    /// The language to write the test paper in. Defaults to English.
    #[serde(default)]
    pub language: Option<String>,

    /// Formatting instructions, passed to the model as-is.
    #[serde(default)]
    pub format_instructions: Option<String>,

    /// Question types to include. Empty means a default mix.
    #[serde(default)]
    pub question_types: Vec<String>,

    /// An image of a sample paper whose layout should be copied.
    #[serde(default)]
    pub format_reference: Option<PathBuf>,
}

impl PaperRequest {
    /// Build a request from command line flags, or load it from `--request`.
    async fn from_opts(opts: &GenerateOpts) -> Result<Self> {
        if let Some(path) = &opts.request_path {
            let mut request = read_json_or_toml::<PaperRequest>(path).await?;
            let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
            request.resolve_paths(base_dir);
            return Ok(request);
        }
        Ok(PaperRequest {
            images: opts.images.clone(),
            marks: opts.marks.ok_or_else(|| anyhow!("--marks is required"))?,
            language: opts.language.clone(),
            format_instructions: opts.format_instructions.clone(),
            question_types: opts.question_types.clone(),
            format_reference: opts.format_reference.clone(),
        })
    }

    /// Make relative paths relative to `base_dir`.
    fn resolve_paths(&mut self, base_dir: &Path) {
        for image in &mut self.images {
            if image.is_relative() {
                *image = base_dir.join(&*image);
            }
        }
        if let Some(format_reference) = &mut self.format_reference {
            if format_reference.is_relative() {
                *format_reference = base_dir.join(&*format_reference);
            }
        }
    }

    /// Load images and build our generation options.
    async fn load(&self) -> Result<(Vec<ImagePayload>, GenerationOptions)> {
        let images = read_images(&self.images).await?;
        let format_reference_image = match &self.format_reference {
            Some(path) => Some(
                ImagePayload::from_path(path)
                    .await
                    .context("could not load format reference")?,
            ),
            None => None,
        };
        let mut options = GenerationOptions::with_marks(self.marks);
        if let Some(language) = &self.language {
            options.language = language.clone();
        }
        options.exam_format_instructions = self.format_instructions.clone();
        options.question_types = self.question_types.clone();
        options.format_reference_image = format_reference_image;
        Ok((images, options))
    }
}

/// Our output, when `--output-format json` is used.
#[derive(Debug, Serialize, JsonSchema)]
pub struct PaperOutput {
    /// The test paper.
    pub test_paper: String,

    /// Total marks requested.
    pub marks: i64,

    /// How many page images we were given.
    pub image_count: usize,

    /// Indices of pages which were skipped in best-effort mode.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_pages: Vec<usize>,

    /// Tokens used by all model calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

/// The `generate` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_generate(ui: Ui, opts: &GenerateOpts) -> Result<()> {
    let request = PaperRequest::from_opts(opts).await?;
    let (images, options) = request.load().await?;
    let marks = options.marks;
    let image_count = images.len();

    let client = create_llm_client(&opts.model, &opts.llm_opts).await?;
    let ocr_client = match &opts.ocr_model {
        Some(ocr_model) if ocr_model != &opts.model => Arc::new(client.for_model(ocr_model)),
        _ => client.clone(),
    };
    let extractor: Arc<dyn TextExtractor> = Arc::new(ExtractionProgress::new(
        &ui,
        Arc::new(LlmTextExtractor::new(ocr_client)?),
        image_count,
    ));
    let composer: Arc<dyn PaperComposer> = Arc::new(CompositionProgress::new(
        &ui,
        Arc::new(LlmPaperComposer::new(client)?),
    ));
    let orchestrator = TestPaperOrchestrator::new(
        extractor,
        composer,
        OrchestratorOpts {
            concurrency_limit: opts.job_count,
            failure_policy: if opts.best_effort {
                FailurePolicy::SkipFailedPages
            } else {
                FailurePolicy::FailFast
            },
        },
    );

    let paper = match orchestrator
        .generate_cancellable(images, options, abort_on_ctrl_c())
        .await
    {
        Ok(paper) => paper,
        Err(err) if err.is_retryable() => {
            return Err(anyhow::Error::from(err)
                .context("the model was too slow; try again later, or raise --timeout"));
        }
        Err(err) => return Err(err.into()),
    };
    if !paper.skipped_pages.is_empty() {
        let skipped = paper
            .skipped_pages
            .iter()
            .map(|index| request.images[*index].display().to_string())
            .collect::<Vec<_>>();
        warn!("Skipped unreadable pages: {}", skipped.join(", "));
    }
    if let Some(token_usage) = &paper.token_usage {
        info!(
            prompt_tokens = token_usage.prompt_tokens,
            completion_tokens = token_usage.completion_tokens,
            "Token usage"
        );
    }

    let output_path = opts.output_path.as_deref();
    match opts.output_format {
        OutputFormat::Text => write_text_output(output_path, &paper.text).await,
        OutputFormat::Json => {
            let output = PaperOutput {
                test_paper: paper.text,
                marks,
                image_count,
                skipped_pages: paper.skipped_pages,
                token_usage: paper.token_usage,
            };
            write_json_output(output_path, &output).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_paths_are_relative_to_the_request_file() {
        let mut request: PaperRequest = toml::from_str(
            r#"
images = ["pages/1.png", "/abs/2.png"]
marks = 20
format_reference = "sample.jpg"
"#,
        )
        .unwrap();
        request.resolve_paths(Path::new("requests"));
        assert_eq!(
            request.images,
            vec![PathBuf::from("requests/pages/1.png"), PathBuf::from("/abs/2.png")]
        );
        assert_eq!(
            request.format_reference,
            Some(PathBuf::from("requests/sample.jpg"))
        );
        assert!(request.question_types.is_empty());
    }

    #[test]
    fn test_request_rejects_unknown_fields() {
        let result = toml::from_str::<PaperRequest>("images = []\nmarks = 1\npages = 3\n");
        assert!(result.is_err());
    }
}
