//! # Text Chunker
//!
//! Book files come in whatever charset the user imported them with. Before
//! sending, the bytes are decoded with an auto-detected charset and the text is
//! cut into windows of the link's transport encoding, UTF-16, where every code
//! unit is two bytes:
//!
//! ```text
//! bytes ──(detect + decode)──► String ──(encode_utf16)──► [u16; n]
//!                                                           │
//!            ┌──────────────┬──────────────┬────────────────┘
//!            ▼              ▼              ▼
//!        window 0       window 1       window 2      (≤ chunk_size bytes each)
//!            │              │              │
//!            ▼              ▼              ▼
//!         String         String         String       (opaque chunk strings)
//! ```
//!
//! A window never ends between the two halves of a surrogate pair, so each
//! chunk is valid text on its own and the concatenation of all chunks is the
//! original text.

use chardetng::EncodingDetector;
use encoding_rs::Encoding;

/// Bytes per UTF-16 code unit on the wire
pub const UTF16_UNIT: usize = 2;

/// Result of charset detection and decoding
#[derive(Debug, Clone)]
pub struct DecodedText {
    /// Decoded text
    pub text: String,
    /// Charset the bytes were decoded with
    pub encoding: &'static Encoding,
    /// Whether malformed sequences were replaced with U+FFFD
    pub had_errors: bool,
}

/// Decode book bytes with an auto-detected charset.
///
/// A byte order mark wins over detection; otherwise the guess is made on the
/// whole buffer with UTF-8 allowed.
pub fn decode_text(bytes: &[u8]) -> DecodedText {
    let guess = match Encoding::for_bom(bytes) {
        Some((encoding, _)) => encoding,
        None => {
            let mut detector = EncodingDetector::new();
            detector.feed(bytes, true);
            detector.guess(None, true)
        }
    };

    // `decode` strips the BOM itself and may switch encoding on it
    let (text, encoding, had_errors) = guess.decode(bytes);
    DecodedText {
        text: text.into_owned(),
        encoding,
        had_errors,
    }
}

/// Split text into chunks of at most `chunk_size` UTF-16 bytes.
///
/// Empty text yields no chunks. Chunk sizes below two code units are raised
/// to two so that a surrogate pair always fits.
pub fn split_text(text: &str, chunk_size: usize) -> Vec<String> {
    let units_per_chunk = (chunk_size / UTF16_UNIT).max(2);
    let units: Vec<u16> = text.encode_utf16().collect();

    let mut chunks = Vec::with_capacity(units.len().div_ceil(units_per_chunk));
    let mut start = 0;
    while start < units.len() {
        let mut end = (start + units_per_chunk).min(units.len());
        if end < units.len() && is_high_surrogate(units[end - 1]) {
            end -= 1;
        }
        // Windows hold whole scalar values, so this never substitutes
        chunks.push(String::from_utf16_lossy(&units[start..end]));
        start = end;
    }
    chunks
}

/// Chunk index to resume from when the band already holds `length` bytes.
///
/// Returns `total_chunks` when the band holds the whole payload. Lengths beyond
/// that mean the partial file on the band does not belong to this payload, and
/// the transfer restarts from zero.
pub fn resume_chunk(length: u64, chunk_size: usize, total_chunks: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    let resume = length / chunk_size as u64;
    match usize::try_from(resume) {
        Ok(index) if index <= total_chunks => index,
        _ => 0,
    }
}

fn is_high_surrogate(unit: u16) -> bool {
    (0xD800..=0xDBFF).contains(&unit)
}
