//! Image payloads, as selected by the user.

use std::fmt;

use crate::{data_url::data_url, prelude::*};

/// An image, ready to be sent to an LLM.
///
/// This is opaque: we never decode or re-encode the image, we just pass the
/// bytes along with their MIME type.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    /// The MIME type, which is always `image/*`.
    mime_type: String,

    /// The raw image bytes.
    data: Vec<u8>,
}

impl ImagePayload {
    /// Create a new image payload.
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Result<Self> {
        let mime_type = mime_type.into();
        if !mime_type.starts_with("image/") {
            return Err(anyhow!("expected an image, found {:?}", mime_type));
        }
        if data.is_empty() {
            return Err(anyhow!("image data is empty"));
        }
        Ok(Self { mime_type, data })
    }

    /// Load an image from disk.
    ///
    /// We trust the file's magic bytes over its extension, but fall back to the
    /// extension for formats [`infer`] doesn't recognize.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read image {:?}", path))?;
        let mime_type = match infer::get(&data) {
            Some(kind) => kind.mime_type().to_owned(),
            None => mime_guess::from_path(path)
                .first()
                .map(|mime| mime.essence_str().to_owned())
                .ok_or_else(|| anyhow!("cannot determine file type of {:?}", path))?,
        };
        debug!(%mime_type, bytes = data.len(), "Loaded image");
        Self::new(mime_type, data).with_context(|| format!("cannot use {:?}", path))
    }

    /// The MIME type of this image.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// The raw bytes of this image.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encode this image as a `data:` URL.
    pub fn to_data_url(&self) -> String {
        data_url(&self.mime_type, &self.data)
    }
}

// Images can be megabytes long, so don't dump them into our logs.
impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}
