//! Chat prompt templates.
//!
//! Prompts are stored as TOML, and every string in them is a
//! [Handlebars](https://handlebarsjs.com/) template. Rendering a
//! [`ChatPrompt`] against a set of bindings produces a [`RenderedPrompt`],
//! which is what our drivers actually send.

use handlebars::{Handlebars, no_escape};
use serde_json::Map;

use crate::prelude::*;

/// A JSON object, without the surrounding [`Value::Object`] wrapper.
pub type JsonObject = Map<String, Value>;

/// A chat prompt template.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatPrompt {
    /// The developer (aka "system") message, if any.
    #[serde(default)]
    pub developer: Option<String>,

    /// User messages.
    pub messages: Vec<MessageTemplate>,
}

impl ChatPrompt {
    /// Parse a prompt from TOML.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse prompt template")
    }

    /// Render this prompt.
    pub fn render(&self, bindings: &JsonObject) -> Result<RenderedPrompt> {
        let mut handlebars = Handlebars::new();
        // Our output goes to an LLM, not a browser.
        handlebars.register_escape_fn(no_escape);

        let developer = self
            .developer
            .as_deref()
            .map(|developer| render_str(&handlebars, developer, bindings))
            .transpose()?;
        let messages = self
            .messages
            .iter()
            .map(|message| message.render(&handlebars, bindings))
            .collect::<Result<Vec<_>>>()?;
        Ok(RenderedPrompt {
            developer,
            messages,
        })
    }
}

/// A user message template.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageTemplate {
    /// The text of the message.
    #[serde(default)]
    pub text: Option<String>,

    /// Image templates. Each should render to a `data:` URL, or to the empty
    /// string if the image is optional and missing.
    #[serde(default)]
    pub images: Vec<String>,
}

impl MessageTemplate {
    fn render(&self, handlebars: &Handlebars, bindings: &JsonObject) -> Result<Message> {
        let text = self
            .text
            .as_deref()
            .map(|text| render_str(handlebars, text, bindings))
            .transpose()?;
        let mut images = vec![];
        for image in &self.images {
            let image = render_str(handlebars, image, bindings)?;
            let image = image.trim();
            if !image.is_empty() {
                images.push(image.to_owned());
            }
        }
        Ok(Message { text, images })
    }
}

fn render_str(handlebars: &Handlebars, template: &str, bindings: &JsonObject) -> Result<String> {
    handlebars
        .render_template(template, bindings)
        .with_context(|| format!("failed to render template {:?}", template))
}

/// A prompt with all templates filled in.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedPrompt {
    /// The developer (aka "system") message, if any.
    pub developer: Option<String>,

    /// User messages.
    pub messages: Vec<Message>,
}

impl RenderedPrompt {
    /// All the user-visible text in this prompt, for tests and logging.
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter_map(|message| message.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// How many images are attached to this prompt?
    pub fn image_count(&self) -> usize {
        self.messages.iter().map(|message| message.images.len()).sum()
    }
}

/// A rendered user message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Message text.
    pub text: Option<String>,

    /// Images, as `data:` URLs.
    pub images: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT: &str = r#"
developer = "You grade {{subject}} homework."

[[messages]]
text = "Marks: {{marks}}. Quote: {{quote}}"
images = ["{{page}}", "{{missing}}"]
"#;

    fn bindings() -> JsonObject {
        let Value::Object(bindings) = json!({
            "subject": "history",
            "marks": 20,
            "quote": "<b> & \"q\"",
            "page": "data:image/png;base64,AAAA",
        }) else {
            unreachable!();
        };
        bindings
    }

    #[test]
    fn test_render() {
        let prompt = ChatPrompt::from_toml_str(PROMPT).unwrap();
        let rendered = prompt.render(&bindings()).unwrap();
        assert_eq!(
            rendered.developer.as_deref(),
            Some("You grade history homework.")
        );
        // No HTML escaping, and missing images are dropped.
        assert_eq!(rendered.user_text(), "Marks: 20. Quote: <b> & \"q\"");
        assert_eq!(rendered.image_count(), 1);
        assert_eq!(rendered.messages[0].images[0], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = ChatPrompt::from_toml_str("assistant = 'hi'\nmessages = []").unwrap_err();
        assert!(format!("{err:?}").contains("unknown field"));
    }
}
