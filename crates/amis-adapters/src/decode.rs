//! Legacy Big5 decoding and export-file recognition.

use std::path::Path;

use encoding_rs::BIG5;

/// Export file extensions accepted from a file host (compared case-insensitively).
pub const RECOGNIZED_EXTENSIONS: &[&str] = &["txt"];

pub fn has_recognized_extension(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            RECOGNIZED_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedExport {
    pub text: String,
    /// At least one byte sequence was replaced with U+FFFD.
    pub had_replacements: bool,
}

/// Decode an export body. Malformed sequences become U+FFFD; a UTF-8 or
/// UTF-16 BOM overrides the Big5 default.
pub fn decode_export(bytes: &[u8]) -> DecodedExport {
    let (text, _encoding, had_replacements) = BIG5.decode(bytes);
    DecodedExport {
        text: text.into_owned(),
        had_replacements,
    }
}
