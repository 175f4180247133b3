//! Decoding JSON objects out of free-form model replies.

use serde::de::DeserializeOwned;

/// Remove a surrounding markdown code fence, if present.
///
/// A leading fence line (with or without a language tag) and a trailing
/// fence are dropped; everything else is returned trimmed.
pub fn strip_code_fences(text: &str) -> &str {
    let mut body = text.trim();
    if body.starts_with("```") {
        body = match body.find('\n') {
            Some(pos) => &body[pos + 1..],
            None => "",
        };
    }
    body = body.trim_end();
    if let Some(stripped) = body.strip_suffix("```") {
        body = stripped;
    }
    body.trim()
}

/// Result of decoding a model reply into `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredReply<T> {
    Parsed(T),
    /// The reply was not valid JSON for `T`; the raw text is kept.
    Unparsed { raw: String, error: String },
}

impl<T: DeserializeOwned> StructuredReply<T> {
    pub fn decode(reply: &str) -> Self {
        let body = strip_code_fences(reply);
        match serde_json::from_str::<T>(body) {
            Ok(value) => Self::Parsed(value),
            Err(e) => Self::Unparsed {
                raw: reply.trim().to_string(),
                error: e.to_string(),
            },
        }
    }
}

impl<T> StructuredReply<T> {
    pub fn parsed(self) -> Option<T> {
        match self {
            Self::Parsed(value) => Some(value),
            Self::Unparsed { .. } => None,
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            Self::Parsed(value) => Ok(value),
            Self::Unparsed { error, .. } => Err(error),
        }
    }
}
