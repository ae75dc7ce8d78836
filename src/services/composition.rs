//! Test paper composition.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use schemars::JsonSchema;

use crate::{
    drivers::TokenUsage,
    error::CapabilityError,
    llm_client::LlmClient,
    options::GenerationOptions,
    prelude::*,
    prompt::{ChatPrompt, JsonObject, RenderedPrompt},
};

use super::PaperComposer;

/// Our built-in composition prompt.
const COMPOSE_PAPER_PROMPT: &str = include_str!("composition/compose_paper_prompt.toml");

/// What we need to write a test paper.
#[derive(Clone, Debug)]
pub struct CompositionRequest {
    /// Text from every page, in page order.
    pub aggregated_text: String,
    pub options: GenerationOptions,
}

/// A finished test paper.
#[derive(Clone, Debug, PartialEq)]
pub struct ComposedPaper {
    /// The paper itself, and nothing else.
    pub text: String,

    /// Total token usage for producing this paper.
    pub token_usage: Option<TokenUsage>,

    /// Indices of input images which were skipped because we couldn't read
    /// them. Only ever non-empty in best-effort mode.
    pub skipped_pages: Vec<usize>,
}

/// The reply we ask the model for.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct PaperResponse {
    /// The complete test paper, with no introduction or closing remarks.
    test_paper: String,
}

/// Our built-in composition prompt template.
pub fn default_composition_prompt() -> Result<ChatPrompt> {
    ChatPrompt::from_toml_str(COMPOSE_PAPER_PROMPT)
}

/// Template bindings for a composition request.
///
/// Optional bindings are left out entirely when they don't apply, so that
/// templates can test for them with `{{#if}}`.
fn composition_bindings(request: &CompositionRequest) -> JsonObject {
    let options = &request.options;
    let mut bindings = JsonObject::new();
    bindings.insert("marks".to_owned(), json!(options.marks));
    bindings.insert("extracted_text".to_owned(), json!(request.aggregated_text));
    if !options.question_types.is_empty() {
        bindings.insert("question_types".to_owned(), json!(options.question_types));
    }
    if let Some(language) = options.non_default_language() {
        bindings.insert("language".to_owned(), json!(language));
    }
    if let Some(instructions) = &options.exam_format_instructions {
        bindings.insert("exam_format_instructions".to_owned(), json!(instructions));
    }
    if let Some(image) = &options.format_reference_image {
        bindings.insert("format_reference_data_url".to_owned(), json!(image.to_data_url()));
        bindings.insert("has_format_reference".to_owned(), json!(true));
    }
    bindings
}

/// Render `template` for `request`.
pub fn render_composition_prompt(
    template: &ChatPrompt,
    request: &CompositionRequest,
) -> Result<RenderedPrompt> {
    template.render(&composition_bindings(request))
}

static CODE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\n(.*?)\n?[ \t]*```$")
        .expect("failed to compile code fence regex")
});

static PREAMBLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Either a bare "Sure!", or a line introducing the paper itself.
    Regex::new(
        r"(?i)^(?:(?:sure|certainly|of course|absolutely|okay|ok)[!.,]?|(?:(?:sure|certainly|of course|absolutely|okay|ok)[!.,]?\s+)?(?:here is|here's|below is)\s+(?:your|the|a|an)\s+(?:[\w/-]+\s+){0,3}?(?:test|exam|paper|quiz|assessment)\b.*[:!.])$",
    )
    .expect("failed to compile preamble regex")
});

static SIGN_OFF_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Only sign-offs addressed to whoever asked for the paper.
    Regex::new(r"(?i)^(let me know|i hope (this|that|you find)|hope this helps|feel free to)\b")
        .expect("failed to compile sign-off regex")
});

/// Strip the chatter models like to wrap around a test paper.
///
/// We remove surrounding whitespace, one leading preamble line ("Sure! Here is
/// your test paper:"), one trailing sign-off paragraph ("Let me know if...")
/// and a Markdown code fence around the whole paper. Nothing inside the paper
/// is touched.
pub fn clean_paper_text(raw: &str) -> Result<String> {
    let mut text = raw.trim();

    if let Some((first_line, rest)) = text.split_once('\n') {
        if PREAMBLE_RE.is_match(first_line.trim()) {
            text = rest.trim();
        }
    }

    if let Some((body, last_paragraph)) = text.rsplit_once("\n\n") {
        if SIGN_OFF_RE.is_match(last_paragraph.trim()) {
            text = body.trim();
        }
    }

    if let Some(caps) = CODE_FENCE_RE.captures(text) {
        if let Some(inner) = caps.get(1) {
            text = inner.as_str().trim();
        }
    }

    if text.is_empty() {
        Err(anyhow!("model returned an empty test paper"))
    } else {
        Ok(text.to_owned())
    }
}

/// Writes test papers using a model.
#[derive(Debug)]
pub struct LlmPaperComposer {
    client: Arc<LlmClient>,
    prompt: ChatPrompt,
}

impl LlmPaperComposer {
    /// Create a composer using our built-in prompt.
    pub fn new(client: Arc<LlmClient>) -> Result<Self> {
        Ok(Self {
            client,
            prompt: default_composition_prompt()?,
        })
    }
}

#[async_trait]
impl PaperComposer for LlmPaperComposer {
    #[instrument(level = "debug", skip_all, fields(model = %self.client.model(), marks = request.options.marks))]
    async fn compose(
        &self,
        request: &CompositionRequest,
    ) -> Result<ComposedPaper, CapabilityError> {
        let prompt = render_composition_prompt(&self.prompt, request)?;
        let completion = self.client.complete::<PaperResponse>(&prompt).await?;
        let text = clean_paper_text(&completion.value.test_paper)?;
        Ok(ComposedPaper {
            text,
            token_usage: completion.token_usage,
            skipped_pages: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drivers::{LlmOpts, echo::EchoDriver},
        payload::ImagePayload,
    };

    const DEFAULT_MIX: &str = "multiple choice, short answer, and essay questions";

    fn request(options: GenerationOptions) -> CompositionRequest {
        CompositionRequest {
            aggregated_text: "Page 1 content\n\nPage 2 content".to_owned(),
            options,
        }
    }

    fn render(options: GenerationOptions) -> RenderedPrompt {
        let template = default_composition_prompt().unwrap();
        render_composition_prompt(&template, &request(options)).unwrap()
    }

    #[test]
    fn test_prompt_states_marks_and_text() {
        let text = render(GenerationOptions::with_marks(20)).user_text();
        assert!(text.contains("worth a total of 20 marks"));
        assert!(text.contains("add up to exactly 20"));
        assert!(text.contains("Text:\nPage 1 content\n\nPage 2 content"));
    }

    #[test]
    fn test_default_question_mix() {
        let text = render(GenerationOptions::with_marks(20)).user_text();
        assert!(text.contains(DEFAULT_MIX));
        assert!(!text.contains("Use only these question types"));
    }

    #[test]
    fn test_requested_question_types() {
        let mut options = GenerationOptions::with_marks(20);
        options.question_types = vec!["Essay".to_owned(), "True/False".to_owned()];
        let text = render(options).user_text();
        assert!(text.contains("Use only these question types: Essay, True/False."));
        assert!(!text.contains(DEFAULT_MIX));
    }

    #[test]
    fn test_language() {
        let mut options = GenerationOptions::with_marks(20);
        options.language = "French".to_owned();
        assert!(render(options).user_text().contains("Write the entire test paper in French."));

        let text = render(GenerationOptions::with_marks(20)).user_text();
        assert!(!text.contains("Write the entire test paper in"));
    }

    #[test]
    fn test_format_instructions_are_verbatim() {
        let instructions = "Section A: 5 MCQs <1 mark each>\nSection B: 2 essays";
        let mut options = GenerationOptions::with_marks(20);
        options.exam_format_instructions = Some(instructions.to_owned());
        let text = render(options).user_text();
        assert!(text.contains(instructions));
        assert!(text.contains("take precedence"));
    }

    #[test]
    fn test_format_reference_is_attached_as_layout_only() {
        let without = render(GenerationOptions::with_marks(20));
        assert_eq!(without.image_count(), 0);
        assert!(!without.user_text().contains("sample test paper"));

        let mut options = GenerationOptions::with_marks(20);
        options.format_reference_image =
            Some(ImagePayload::new("image/png", vec![0x89, b'P', b'N', b'G']).unwrap());
        let with = render(options);
        assert_eq!(with.image_count(), 1);
        assert!(with.user_text().contains("Do not use any of its questions or content."));
        assert!(!with.user_text().contains("iVBORw"));
    }

    #[test]
    fn test_clean_paper_text() {
        let cases = [
            ("  Q1. Name a river. (2 marks)\n", "Q1. Name a river. (2 marks)"),
            (
                "Sure! Here is your test paper:\nQ1. Name a river. (2 marks)",
                "Q1. Name a river. (2 marks)",
            ),
            (
                "```markdown\n# History Test\nQ1. Why? (5 marks)\n```",
                "# History Test\nQ1. Why? (5 marks)",
            ),
            (
                "# Test\n\nQ1. Why? (5 marks)\n\nLet me know if you need an answer key!",
                "# Test\n\nQ1. Why? (5 marks)",
            ),
            (
                "Certainly.\n```\nQ1. Why? (5 marks)\n```\n\nI hope this helps.",
                "Q1. Why? (5 marks)",
            ),
            (
                "Here's a 20-mark geography test:\nQ1. Name a river. (2 marks)",
                "Q1. Name a river. (2 marks)",
            ),
            (
                "Q1. Why? (5 marks)\n\nFeel free to adjust the marks.",
                "Q1. Why? (5 marks)",
            ),
            // Papers often open with instructions and close with a note to
            // candidates. Those stay.
            (
                "Here is a map of Europe\nQ1. Label it. (5 marks)",
                "Here is a map of Europe\nQ1. Label it. (5 marks)",
            ),
            (
                "Here are the instructions for candidates.\nQ1. Define osmosis. (5 marks)",
                "Here are the instructions for candidates.\nQ1. Define osmosis. (5 marks)",
            ),
            (
                "Q1. Define osmosis. (5 marks)\n\nIf you need more space, use the back of this sheet.",
                "Q1. Define osmosis. (5 marks)\n\nIf you need more space, use the back of this sheet.",
            ),
            (
                "Q1. Define osmosis. (5 marks)\n\nGood luck!",
                "Q1. Define osmosis. (5 marks)\n\nGood luck!",
            ),
        ];
        for (raw, expected) in cases {
            assert_eq!(clean_paper_text(raw).unwrap(), expected, "cleaning {raw:?}");
        }
        assert!(clean_paper_text(" \n ").is_err());
        assert!(clean_paper_text("```\n\n```").is_err());
    }

    #[tokio::test]
    async fn test_compose_with_echo() {
        let client = LlmClient::with_driver(Box::new(EchoDriver::new()), "echo", LlmOpts::default());
        let composer = LlmPaperComposer::new(Arc::new(client)).unwrap();
        let paper = composer
            .compose(&request(GenerationOptions::with_marks(20)))
            .await
            .unwrap();
        assert!(paper.text.contains("20 marks"));
        assert!(paper.text.contains("Page 2 content"));
        assert!(paper.skipped_pages.is_empty());
    }
}
