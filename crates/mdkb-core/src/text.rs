//! Decoding document bytes to UTF-8 text.
//!
//! Markdown collections are mostly UTF-8 but not exclusively. Detection order:
//! 1. BOM (UTF-8, UTF-16 LE/BE)
//! 2. UTF-8 validation
//! 3. chardetng statistical guess for legacy encodings (Windows-1252, Latin-1, ...)

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16_LE_BOM: &[u8] = &[0xFF, 0xFE];
const UTF16_BE_BOM: &[u8] = &[0xFE, 0xFF];

/// Decode a byte buffer into a UTF-8 string.
///
/// Invalid sequences become U+FFFD rather than failing the whole document.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(UTF8_BOM) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    if let Some(rest) = bytes.strip_prefix(UTF16_LE_BOM) {
        return decode_with(UTF_16LE, rest);
    }
    if let Some(rest) = bytes.strip_prefix(UTF16_BE_BOM) {
        return decode_with(UTF_16BE, rest);
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);
    if encoding == UTF_8 {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    decode_with(encoding, bytes)
}

fn decode_with(encoding: &'static Encoding, bytes: &[u8]) -> String {
    let (cow, _) = encoding.decode_without_bom_handling(bytes);
    cow.into_owned()
}

/// Truncate to at most `max_chars` characters without splitting a code point
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
