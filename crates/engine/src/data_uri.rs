//! `data:<mime>[;param]*;base64,<payload>` parsing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const SCHEME: &str = "data:";
const EMBEDDED_IMAGE_PREFIX: &str = "data:image/";
const BASE64_MARKER: &str = "base64";

/// Extension used for any media type outside the known table.
pub const FALLBACK_EXTENSION: &str = ".png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub mime_type: String,
    pub payload: Vec<u8>,
}

impl DataUri {
    pub fn extension(&self) -> &'static str {
        classify_extension(&self.mime_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed data URI: {0}")]
    MalformedUri(&'static str),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
}

/// Cheap pre-filter: only strings with this prefix are ever decoded.
pub fn is_embedded_image(s: &str) -> bool {
    s.starts_with(EMBEDDED_IMAGE_PREFIX)
}

pub fn decode(s: &str) -> Result<DataUri, DecodeError> {
    let without_scheme = s
        .strip_prefix(SCHEME)
        .ok_or(DecodeError::MalformedUri("missing data: prefix"))?;

    let (meta, payload) = without_scheme
        .split_once(',')
        .ok_or(DecodeError::MalformedUri("missing ',' separator"))?;

    let mut params = meta.split(';');
    let mime_type = params.next().unwrap_or_default().trim();
    if mime_type.is_empty() {
        return Err(DecodeError::MalformedUri("missing media type"));
    }
    let is_base64 = params
        .last()
        .is_some_and(|p| p.trim().eq_ignore_ascii_case(BASE64_MARKER));
    if !is_base64 {
        return Err(DecodeError::MalformedUri("payload is not base64-encoded"));
    }

    let payload = STANDARD
        .decode(payload)
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;

    Ok(DataUri {
        mime_type: mime_type.to_ascii_lowercase(),
        payload,
    })
}

pub fn encode(bytes: &[u8], mime_type: &str) -> String {
    format!("{SCHEME}{mime_type};{BASE64_MARKER},{}", STANDARD.encode(bytes))
}

/// Map a media type to a file extension (with the leading dot).
///
/// Total: anything unrecognized becomes `.png`, even when the bytes are not
/// PNG. Kept for compatibility with names already handed out.
pub fn classify_extension(mime_type: &str) -> &'static str {
    match mime_type.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        _ => FALLBACK_EXTENSION,
    }
}
