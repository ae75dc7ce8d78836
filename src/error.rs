//! Errors reported by the paper pipeline.
//!
//! The CLI and I/O code just use [`anyhow`], but callers of the pipeline need
//! to tell a bad request from a broken page from a slow model, so the pipeline
//! has its own error types.

use std::{error, fmt, time::Duration};

use crate::drivers::LlmError;

/// A single call to an external model failed.
#[derive(Debug)]
pub enum CapabilityError {
    /// The model returned an error, or output we couldn't use.
    Failed(anyhow::Error),

    /// The model didn't answer in time.
    TimedOut(Duration),
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityError::Failed(err) => write!(f, "{err}"),
            CapabilityError::TimedOut(after) => {
                write!(f, "no response after {}s", after.as_secs())
            }
        }
    }
}

impl error::Error for CapabilityError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            CapabilityError::Failed(err) => Some(&**err),
            CapabilityError::TimedOut(_) => None,
        }
    }
}

impl From<anyhow::Error> for CapabilityError {
    fn from(err: anyhow::Error) -> Self {
        CapabilityError::Failed(err)
    }
}

impl<E> From<LlmError<E>> for CapabilityError
where
    E: error::Error + Send + Sync + 'static,
{
    fn from(err: LlmError<E>) -> Self {
        match err {
            LlmError::Timeout(after) => CapabilityError::TimedOut(after),
            other => CapabilityError::Failed(other.into()),
        }
    }
}

/// Which part of a request was running when something went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Extracting text from the image with this index.
    Extraction { image_index: usize },

    /// Writing the test paper.
    Composition,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Extraction { image_index } => {
                write!(f, "reading image #{}", image_index + 1)
            }
            Stage::Composition => write!(f, "writing the test paper"),
        }
    }
}

/// A test paper request failed.
#[derive(Debug)]
pub enum PaperError {
    /// The request itself was bad. No model was called.
    Validation(String),

    /// We couldn't extract text from one of the images.
    Extraction {
        /// Index of the failed image, counting from 0.
        image_index: usize,
        source: anyhow::Error,
    },

    /// We couldn't write the test paper.
    Composition(anyhow::Error),

    /// A model call took longer than we allow.
    Timeout { stage: Stage, after: Duration },

    /// The caller gave up on this request.
    Cancelled,
}

impl PaperError {
    /// Attach request-level context to a failed model call.
    pub fn from_capability(stage: Stage, err: CapabilityError) -> Self {
        match (stage, err) {
            (stage, CapabilityError::TimedOut(after)) => PaperError::Timeout { stage, after },
            (Stage::Extraction { image_index }, CapabilityError::Failed(source)) => {
                PaperError::Extraction {
                    image_index,
                    source,
                }
            }
            (Stage::Composition, CapabilityError::Failed(source)) => {
                PaperError::Composition(source)
            }
        }
    }

    /// The image this error is about, if any.
    pub fn image_index(&self) -> Option<usize> {
        match self {
            PaperError::Extraction { image_index, .. }
            | PaperError::Timeout {
                stage: Stage::Extraction { image_index },
                ..
            } => Some(*image_index),
            _ => None,
        }
    }

    /// Would trying again later plausibly help?
    pub fn is_retryable(&self) -> bool {
        matches!(self, PaperError::Timeout { .. })
    }
}

impl fmt::Display for PaperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaperError::Validation(msg) => write!(f, "invalid request: {msg}"),
            PaperError::Extraction { image_index, .. } => write!(
                f,
                "could not extract text from image #{} (index {})",
                image_index + 1,
                image_index
            ),
            PaperError::Composition(_) => write!(f, "could not write the test paper"),
            PaperError::Timeout { stage, after } => {
                write!(f, "timed out after {}s while {}", after.as_secs(), stage)
            }
            PaperError::Cancelled => write!(f, "request was cancelled"),
        }
    }
}

impl error::Error for PaperError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            PaperError::Extraction { source, .. } | PaperError::Composition(source) => {
                Some(&**source)
            }
            _ => None,
        }
    }
}

/// Format an error and all of its causes on one line.
pub fn error_chain(err: &(dyn error::Error + 'static)) -> String {
    std::iter::successors(Some(err), |err| err.source())
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn test_timeouts_stay_timeouts() {
        let err = PaperError::from_capability(
            Stage::Extraction { image_index: 2 },
            CapabilityError::TimedOut(Duration::from_secs(30)),
        );
        assert!(matches!(
            err,
            PaperError::Timeout {
                stage: Stage::Extraction { image_index: 2 },
                ..
            }
        ));
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "timed out after 30s while reading image #3");
        assert_eq!(err.image_index(), Some(2));
    }

    #[test]
    fn test_failures_carry_their_stage() {
        let err = PaperError::from_capability(
            Stage::Extraction { image_index: 1 },
            CapabilityError::Failed(anyhow!("blurry")),
        );
        assert!(matches!(err, PaperError::Extraction { image_index: 1, .. }));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("index 1"));

        let err = PaperError::from_capability(
            Stage::Composition,
            CapabilityError::Failed(anyhow!("empty")),
        );
        assert!(matches!(err, PaperError::Composition(_)));
    }

    #[test]
    fn test_each_cause_is_reported_once() {
        let inner = anyhow!("HTTP 500").context("model call failed");
        let err = PaperError::from_capability(
            Stage::Extraction { image_index: 0 },
            CapabilityError::Failed(inner),
        );
        assert_eq!(
            err.to_string(),
            "could not extract text from image #1 (index 0)"
        );
        assert_eq!(
            error_chain(&err),
            "could not extract text from image #1 (index 0): model call failed: HTTP 500"
        );

        let err = CapabilityError::Failed(anyhow!("HTTP 500").context("model call failed"));
        assert_eq!(err.to_string(), "model call failed");
        assert_eq!(error_chain(&err), "model call failed: HTTP 500");
    }

    #[test]
    fn test_llm_timeouts_convert() {
        let err: CapabilityError =
            LlmError::<std::io::Error>::Timeout(Duration::from_secs(5)).into();
        assert!(matches!(err, CapabilityError::TimedOut(d) if d.as_secs() == 5));
    }
}
