//! Module payload formats and the shared compiled-module cache.

use std::sync::{Arc, OnceLock};

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use dashmap::DashMap;

/// Prefix of url-safe base64 bytecode that runs as is.
pub const DRPY_PREFIX: &str = "//DRPY";

/// Prefix of standard base64 bytecode that needs [`bb_transform`].
pub const BB_PREFIX: &str = "//bb";

/// Marker written into byte 0 of a transformed `//bb` payload.
const BB_MARKER: u8 = 1;

/// Shared libraries compiled once per process: (module file name, cache key).
const SHARED_LIBRARIES: &[(&str, &str)] = &[
    ("cheerio.min.js", "cheerio.min"),
    ("crypto-js.js", "crypto-js"),
];

/// A module payload after format detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModulePayload {
    /// Ready-to-load engine bytecode.
    Bytecode(Vec<u8>),
    /// Source text to compile.
    Source(String),
}

/// Why an encoded payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 after {prefix}: {message}")]
    Base64 { prefix: &'static str, message: String },

    #[error("//bb payload too short ({0} bytes)")]
    TooShort(usize),
}

impl ModulePayload {
    /// Detect the payload format from its prefix and decode it.
    pub fn detect(text: &str) -> Result<Self, DecodeError> {
        if let Some(rest) = text.strip_prefix(DRPY_PREFIX) {
            let encoded = compact(rest);
            let bytes = URL_SAFE
                .decode(encoded.as_bytes())
                .or_else(|_| URL_SAFE_NO_PAD.decode(encoded.as_bytes()))
                .map_err(|e| DecodeError::Base64 {
                    prefix: DRPY_PREFIX,
                    message: e.to_string(),
                })?;
            return Ok(ModulePayload::Bytecode(bytes));
        }

        if let Some(rest) = text.strip_prefix(BB_PREFIX) {
            let bytes = STANDARD
                .decode(compact(rest).as_bytes())
                .map_err(|e| DecodeError::Base64 {
                    prefix: BB_PREFIX,
                    message: e.to_string(),
                })?;
            return bb_transform(&bytes).map(ModulePayload::Bytecode);
        }

        Ok(ModulePayload::Source(text.to_string()))
    }
}

fn compact(text: &str) -> String {
    text.chars().filter(|c| !c.is_ascii_whitespace()).collect()
}

/// Rewrite a decoded `//bb` blob into engine bytecode.
///
/// The output is 4 bytes shorter than the input: byte 0 becomes the marker and
/// `input[5..]` is copied to `output[1..]`.
pub fn bb_transform(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if bytes.len() < 5 {
        return Err(DecodeError::TooShort(bytes.len()));
    }
    let mut out = Vec::with_capacity(bytes.len() - 4);
    out.push(BB_MARKER);
    out.extend_from_slice(&bytes[5..]);
    Ok(out)
}

/// Cache key for module names that refer to a shared library.
pub fn shared_library_key(name: &str) -> Option<&'static str> {
    SHARED_LIBRARIES
        .iter()
        .find(|(file, _)| name.ends_with(file))
        .map(|(_, key)| *key)
}

/// Process-wide store of compiled shared libraries.
///
/// Entries are write-once: concurrent compiles of the same library produce
/// equivalent bytecode, so the first insert wins and later ones are dropped.
#[derive(Debug, Default)]
pub struct BytecodeCache {
    modules: DashMap<String, Arc<[u8]>>,
}

impl BytecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by every engine host in this process.
    pub fn shared() -> Arc<BytecodeCache> {
        static SHARED: OnceLock<Arc<BytecodeCache>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(BytecodeCache::new())).clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        self.modules.get(key).map(|entry| entry.value().clone())
    }

    /// Insert unless present. Returns whether this call stored the value.
    pub fn insert_if_absent(&self, key: &str, bytecode: Vec<u8>) -> bool {
        let mut inserted = false;
        self.modules.entry(key.to_string()).or_insert_with(|| {
            inserted = true;
            Arc::from(bytecode)
        });
        inserted
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bb_transform_layout() {
        let input = [9u8, 8, 7, 6, 5, 4, 3, 2, 1];
        let out = bb_transform(&input).unwrap();
        assert_eq!(out.len(), input.len() - 4);
        assert_eq!(out, vec![1, 4, 3, 2, 1]);
    }

    #[test]
    fn test_bb_transform_too_short() {
        assert_eq!(bb_transform(&[1, 2, 3, 4]), Err(DecodeError::TooShort(4)));
        assert_eq!(bb_transform(&[1, 2, 3, 4, 5]).unwrap(), vec![1]);
    }

    #[test]
    fn test_detect_bb() {
        let raw = [0u8, 0, 0, 0, 0, 0xAA, 0xBB];
        let text = format!("{}{}", BB_PREFIX, STANDARD.encode(raw));
        assert_eq!(
            ModulePayload::detect(&text).unwrap(),
            ModulePayload::Bytecode(vec![1, 0xAA, 0xBB])
        );
    }

    #[test]
    fn test_detect_drpy_is_url_safe() {
        let raw = [0xFBu8, 0xFF, 0xBF];
        let text = format!("{}{}", DRPY_PREFIX, URL_SAFE.encode(raw));
        assert!(text.contains('-') || text.contains('_'));
        assert_eq!(ModulePayload::detect(&text).unwrap(), ModulePayload::Bytecode(raw.to_vec()));
    }

    #[test]
    fn test_detect_source_and_bad_base64() {
        assert_eq!(
            ModulePayload::detect("export default 1").unwrap(),
            ModulePayload::Source("export default 1".into())
        );
        assert!(matches!(
            ModulePayload::detect("//bb***"),
            Err(DecodeError::Base64 { prefix: BB_PREFIX, .. })
        ));
    }

    #[test]
    fn test_shared_library_keys() {
        assert_eq!(shared_library_key("assets://js/lib/cheerio.min.js"), Some("cheerio.min"));
        assert_eq!(shared_library_key("crypto-js.js"), Some("crypto-js"));
        assert_eq!(shared_library_key("drpy2.min.js"), None);
    }

    #[test]
    fn test_cache_is_write_once() {
        let cache = BytecodeCache::new();
        assert!(cache.insert_if_absent("crypto-js", vec![1, 2]));
        assert!(!cache.insert_if_absent("crypto-js", vec![3]));
        assert_eq!(&*cache.get("crypto-js").unwrap(), &[1, 2]);
        assert_eq!(cache.len(), 1);
    }
}
