//! The two model-backed services the pipeline is built from.
//!
//! The orchestrator only sees these traits, so tests can swap in doubles and
//! the CLI can wrap them with progress reporting.

use crate::{error::CapabilityError, payload::ImagePayload, prelude::*};

pub mod composition;
pub mod extraction;

pub use self::{
    composition::{ComposedPaper, CompositionRequest, LlmPaperComposer},
    extraction::{ExtractedText, LlmTextExtractor},
};

/// Reads the text out of one page image.
#[async_trait]
pub trait TextExtractor: Send + Sync + 'static {
    /// Return the plain text visible in `image`. A blank page yields an empty
    /// string, not an error.
    async fn extract(&self, image: &ImagePayload) -> Result<ExtractedText, CapabilityError>;
}

/// Writes a test paper from extracted text.
#[async_trait]
pub trait PaperComposer: Send + Sync + 'static {
    /// Write one test paper for `request`.
    async fn compose(
        &self,
        request: &CompositionRequest,
    ) -> Result<ComposedPaper, CapabilityError>;
}
