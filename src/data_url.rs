//! `data:` URLs, which is how we ship images to LLMs.

use std::sync::LazyLock;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use regex::Regex;

/// Convert binary data to a `data:` URL.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    // Some sources say the Base64 data should also be percent-encoded, but
    // Gemini and several other LLMs reject that.
    format!("data:{};base64,{}", mime_type, BASE64_STANDARD.encode(data))
}

/// Regex for parsing a `data:` URL.
static DATA_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^data:(?P<mime_type>[^;,]+);base64,(?P<data>.+)$")
        .expect("failed to compile data URL regex")
});

/// Split a `data:` URL into a MIME type and the still-encoded Base64 data.
///
/// Returns `None` for anything that isn't a Base64 `data:` URL.
pub fn parse_data_url(data_url: &str) -> Option<(String, &str)> {
    let caps = DATA_URL_RE.captures(data_url)?;
    let mime_type = caps.name("mime_type")?.as_str().to_owned();
    let data = caps.name("data")?.as_str();
    Some((mime_type, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_url_parses_back() {
        let url = data_url("image/png", b"\x89PNG");
        assert_eq!(url, "data:image/png;base64,iVBORw==");
        let (mime_type, data) = parse_data_url(&url).unwrap();
        assert_eq!(mime_type, "image/png");
        assert_eq!(data, "iVBORw==");
    }

    #[test]
    fn test_parse_rejects_other_urls() {
        assert!(parse_data_url("https://example.com/page.png").is_none());
        assert!(parse_data_url("data:text/plain,hello").is_none());
        assert!(parse_data_url("data:image/png;base64,").is_none());
    }
}
