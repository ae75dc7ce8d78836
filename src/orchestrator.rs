//! Turning a stack of page images into one test paper.

use std::sync::Arc;

use futures::{
    StreamExt as _,
    future::{AbortRegistration, Abortable},
    stream,
};
use tracing::{Instrument as _, debug_span};
use uuid::Uuid;

use crate::{
    drivers::TokenUsage,
    error::{PaperError, Stage, error_chain},
    options::GenerationOptions,
    payload::ImagePayload,
    prelude::*,
    services::{ComposedPaper, CompositionRequest, ExtractedText, PaperComposer, TextExtractor},
};

/// The separator we put between the text of consecutive pages.
pub const FRAGMENT_SEPARATOR: &str = "\n\n";

/// What to do when we can't read a page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Give up on the whole request.
    #[default]
    FailFast,

    /// Leave the page out, and report it in [`ComposedPaper::skipped_pages`].
    SkipFailedPages,
}

/// Knobs for running requests.
#[derive(Clone, Debug)]
pub struct OrchestratorOpts {
    /// How many pages may be extracted at once.
    pub concurrency_limit: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for OrchestratorOpts {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// The result of extracting text from every page of a request.
#[derive(Debug)]
pub struct ExtractedPages {
    /// One slot per input image, in input order. `None` if the page was
    /// skipped.
    pub pages: Vec<Option<ExtractedText>>,

    /// Why pages were skipped, in input order.
    pub failures: Vec<PaperError>,
}

impl ExtractedPages {
    /// Indices of the pages we skipped.
    pub fn skipped_pages(&self) -> Vec<usize> {
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(index, page)| page.is_none().then_some(index))
            .collect()
    }

    /// The text of every page we read, joined in input order.
    pub fn joined_text(&self) -> String {
        join_fragments(self.pages.iter().flatten().map(|page| page.text.as_str()))
    }

    /// Token usage across all pages.
    pub fn token_usage(&self) -> Option<TokenUsage> {
        TokenUsage::sum(self.pages.iter().flatten().map(|page| page.token_usage.as_ref()))
    }
}

/// Join page texts with a blank line between them. Empty pages still count as
/// pages.
pub fn join_fragments<'a>(fragments: impl IntoIterator<Item = &'a str>) -> String {
    fragments
        .into_iter()
        .collect::<Vec<_>>()
        .join(FRAGMENT_SEPARATOR)
}

/// Extract the text from every image, running at most
/// `opts.concurrency_limit` extractions at once.
///
/// Extractions may finish in any order, but each result goes back into the
/// slot for its image. With [`FailurePolicy::FailFast`], the first failure is
/// returned immediately, and any extractions still running are dropped. With
/// [`FailurePolicy::SkipFailedPages`], we only fail if no page at all could be
/// read.
pub async fn extract_pages(
    extractor: &dyn TextExtractor,
    images: &[ImagePayload],
    opts: &OrchestratorOpts,
) -> Result<ExtractedPages, PaperError> {
    let mut results = stream::iter(images.iter().enumerate())
        .map(|(image_index, image)| async move {
            let result = extractor
                .extract(image)
                .instrument(debug_span!("extract_page", image_index))
                .await;
            (image_index, result)
        })
        .buffer_unordered(opts.concurrency_limit.max(1));

    let mut pages = vec![None; images.len()];
    let mut failures = vec![];
    while let Some((image_index, result)) = results.next().await {
        match result {
            Ok(extracted) => pages[image_index] = Some(extracted),
            Err(err) => {
                let err = PaperError::from_capability(Stage::Extraction { image_index }, err);
                match opts.failure_policy {
                    FailurePolicy::FailFast => return Err(err),
                    FailurePolicy::SkipFailedPages => {
                        warn!(image_index, "Skipping page: {}", error_chain(&err));
                        failures.push((image_index, err));
                    }
                }
            }
        }
    }

    failures.sort_by_key(|(image_index, _)| *image_index);
    let mut failures = failures.into_iter().map(|(_, err)| err).collect::<Vec<_>>();
    if !images.is_empty() && pages.iter().all(Option::is_none) && !failures.is_empty() {
        return Err(failures.swap_remove(0));
    }
    Ok(ExtractedPages { pages, failures })
}

/// Runs test paper requests from start to finish.
pub struct TestPaperOrchestrator {
    extractor: Arc<dyn TextExtractor>,
    composer: Arc<dyn PaperComposer>,
    opts: OrchestratorOpts,
}

impl TestPaperOrchestrator {
    pub fn new(
        extractor: Arc<dyn TextExtractor>,
        composer: Arc<dyn PaperComposer>,
        opts: OrchestratorOpts,
    ) -> Self {
        Self {
            extractor,
            composer,
            opts,
        }
    }

    /// Generate a test paper from `images`.
    ///
    /// Bad requests are rejected before any model is called. Otherwise we
    /// extract every page, join the text in page order, and make exactly one
    /// composition call.
    #[instrument(
        level = "info",
        skip_all,
        fields(request_id = %Uuid::new_v4(), image_count = images.len())
    )]
    pub async fn generate(
        &self,
        images: Vec<ImagePayload>,
        options: GenerationOptions,
    ) -> Result<ComposedPaper, PaperError> {
        validate(&images, &options)?;
        let options = options.normalized();

        let extracted = extract_pages(self.extractor.as_ref(), &images, &self.opts).await?;
        let request = CompositionRequest {
            aggregated_text: extracted.joined_text(),
            options,
        };
        debug!(
            chars = request.aggregated_text.len(),
            "Composing test paper"
        );
        let mut paper = self
            .composer
            .compose(&request)
            .await
            .map_err(|err| PaperError::from_capability(Stage::Composition, err))?;

        paper.token_usage =
            TokenUsage::sum([extracted.token_usage().as_ref(), paper.token_usage.as_ref()]);
        paper.skipped_pages = extracted.skipped_pages();
        Ok(paper)
    }

    /// Like [`Self::generate`], but gives up with [`PaperError::Cancelled`] as
    /// soon as the matching [`futures::future::AbortHandle`] is aborted. Every
    /// model call still in flight is dropped.
    pub async fn generate_cancellable(
        &self,
        images: Vec<ImagePayload>,
        options: GenerationOptions,
        registration: AbortRegistration,
    ) -> Result<ComposedPaper, PaperError> {
        match Abortable::new(self.generate(images, options), registration).await {
            Ok(result) => result,
            Err(_aborted) => Err(PaperError::Cancelled),
        }
    }
}

fn validate(images: &[ImagePayload], options: &GenerationOptions) -> Result<(), PaperError> {
    if images.is_empty() {
        return Err(PaperError::Validation(
            "at least one image is required".to_owned(),
        ));
    }
    if options.marks <= 0 {
        return Err(PaperError::Validation(format!(
            "marks must be a positive number, found {}",
            options.marks
        )));
    }
    Ok(())
}
