//! Options controlling what kind of test paper we generate.

use crate::payload::ImagePayload;

/// The language we write test papers in, unless asked otherwise.
pub const DEFAULT_LANGUAGE: &str = "English";

/// Everything the user can tell us about the paper they want, apart from the
/// source pages themselves.
#[derive(Clone, Debug)]
pub struct GenerationOptions {
    /// Total marks for the whole paper. Only positive values are valid, but we
    /// accept anything here and reject it during validation.
    pub marks: i64,

    /// The language to write the paper in.
    pub language: String,

    /// Free-form formatting instructions, passed to the model verbatim.
    pub exam_format_instructions: Option<String>,

    /// The question types to use. Empty means "a sensible mix".
    pub question_types: Vec<String>,

    /// A sample paper whose layout we should imitate. Never used as content.
    pub format_reference_image: Option<ImagePayload>,
}

impl GenerationOptions {
    /// Options with the given marks and everything else defaulted.
    pub fn with_marks(marks: i64) -> Self {
        Self {
            marks,
            language: DEFAULT_LANGUAGE.to_owned(),
            exam_format_instructions: None,
            question_types: vec![],
            format_reference_image: None,
        }
    }

    /// Clean up user input.
    ///
    /// Question types behave like an ordered set: labels are trimmed, blanks are
    /// dropped, and case-insensitive duplicates are dropped after their first
    /// appearance. Blank language and format instructions count as missing.
    pub fn normalized(mut self) -> Self {
        let mut seen = Vec::<String>::new();
        self.question_types = self
            .question_types
            .into_iter()
            .filter_map(|label| {
                let label = label.trim().to_owned();
                let key = label.to_lowercase();
                if label.is_empty() || seen.contains(&key) {
                    None
                } else {
                    seen.push(key);
                    Some(label)
                }
            })
            .collect();

        let language = self.language.trim();
        self.language = if language.is_empty() {
            DEFAULT_LANGUAGE.to_owned()
        } else {
            language.to_owned()
        };

        self.exam_format_instructions = self
            .exam_format_instructions
            .filter(|instructions| !instructions.trim().is_empty());
        self
    }

    /// The requested language, if it differs from [`DEFAULT_LANGUAGE`].
    pub fn non_default_language(&self) -> Option<&str> {
        let language = self.language.trim();
        if language.is_empty() || language.eq_ignore_ascii_case(DEFAULT_LANGUAGE) {
            None
        } else {
            Some(language)
        }
    }
}
