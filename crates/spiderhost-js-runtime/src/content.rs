//! Script payload normalization.
//!
//! Spider payloads arrive over the network in whatever shape the publisher
//! chose: plain source, base64 of a gzip/zlib stream, or one of the encoded
//! bytecode prefixes. [`normalize`] turns them into text the engine can take,
//! or rejects them before they reach the engine.

use std::io::Read;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::read::{GzDecoder, ZlibDecoder};

use crate::bytecode::{BB_PREFIX, DRPY_PREFIX};
use crate::error::ContentError;

/// Largest payload accepted, before and after decompression.
pub const MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024;

/// Surface markers at least one of which any plain script contains.
const SCRIPT_MARKERS: &[&str] = &["function", "=>", "export", "var", "let", "const"];

/// Transport compression recognized by its base64 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zlib,
    Bzip2,
}

impl Compression {
    /// Sniff the leading characters of base64 text.
    pub fn sniff(content: &str) -> Option<Self> {
        if content.starts_with("H4sI") {
            Some(Compression::Gzip)
        } else if content.starts_with("eJx") || content.starts_with("eNr") {
            Some(Compression::Zlib)
        } else if content.starts_with("Qlpo") {
            Some(Compression::Bzip2)
        } else {
            None
        }
    }
}

/// Validate and, if needed, decompress a raw script payload.
pub fn normalize(raw: String) -> Result<String, ContentError> {
    check_envelope(&raw)?;

    let content = match Compression::sniff(raw.trim_start()) {
        Some(compression) => {
            let text = decompress(compression, raw.trim())?;
            tracing::debug!(?compression, size = text.len(), "decompressed script payload");
            check_envelope(&text)?;
            text
        }
        None => raw,
    };

    if content.starts_with(BB_PREFIX) || content.starts_with(DRPY_PREFIX) {
        return Ok(content);
    }
    if SCRIPT_MARKERS.iter().any(|marker| content.contains(marker)) {
        return Ok(content);
    }
    Err(ContentError::NotScript)
}

fn check_envelope(content: &str) -> Result<(), ContentError> {
    if content.len() > MAX_CONTENT_BYTES {
        return Err(ContentError::TooLarge {
            limit: MAX_CONTENT_BYTES,
            actual: content.len(),
        });
    }
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ContentError::Empty);
    }
    if trimmed.starts_with('<') {
        return Err(ContentError::Html);
    }
    Ok(())
}

fn decompress(compression: Compression, encoded: &str) -> Result<String, ContentError> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ContentError::Decompress(e.to_string()))?;

    let reader: Box<dyn Read + '_> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(bytes.as_slice())),
        Compression::Zlib => Box::new(ZlibDecoder::new(bytes.as_slice())),
        Compression::Bzip2 => return Err(ContentError::Bzip2Unsupported),
    };

    let mut text = String::new();
    reader
        .take(MAX_CONTENT_BYTES as u64 + 1)
        .read_to_string(&mut text)
        .map_err(|e| ContentError::Decompress(e.to_string()))?;
    Ok(text)
}

/// Cheap structural check run on template text before it is handed to an
/// engine: braces, brackets and parentheses must never close more than they
/// opened and must all balance at the end.
pub fn precheck_template(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }

    let (mut braces, mut brackets, mut parens) = (0i64, 0i64, 0i64);
    for c in text.chars() {
        match c {
            '{' => braces += 1,
            '}' => braces -= 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            '(' => parens += 1,
            ')' => parens -= 1,
            _ => continue,
        }
        if braces < 0 || brackets < 0 || parens < 0 {
            return false;
        }
    }
    braces == 0 && brackets == 0 && parens == 0
}
