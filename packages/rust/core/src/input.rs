//! Input file loading: encoding detection, decoding, and row parsing.
//!
//! Input files hold one input per row. A second comma-separated column, when
//! present, is the per-row type hint. Spreadsheet exports often arrive with a
//! BOM or in a legacy single-byte encoding, so the raw bytes are sniffed before
//! parsing.

use std::path::Path;

use tracing::{debug, info, warn};

use bulkmapper_shared::{BulkMapperError, MappingInput, Result};

/// Longest input the API accepts, in characters. Longer inputs are truncated.
pub const MAX_INPUT_LENGTH: usize = 127;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16_LE_BOM: &[u8] = &[0xFF, 0xFE];
const UTF16_BE_BOM: &[u8] = &[0xFE, 0xFF];

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Text encodings recognized for input files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    /// UTF-8 with a leading byte-order mark (Excel's "CSV UTF-8").
    Utf8Bom,
    /// UTF-16 with byte order taken from the BOM; little-endian without one.
    Utf16,
    Utf16Le,
    Utf16Be,
    /// ISO-8859-1: every byte is one code point.
    Latin1,
}

impl TextEncoding {
    /// Parse a user-supplied encoding label such as `utf-8` or `latin-1`.
    pub fn from_label(label: &str) -> Result<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "utf-8-sig" | "utf8-sig" => Ok(Self::Utf8Bom),
            "utf-16" | "utf16" => Ok(Self::Utf16),
            "utf-16le" | "utf16le" => Ok(Self::Utf16Le),
            "utf-16be" | "utf16be" => Ok(Self::Utf16Be),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Ok(Self::Latin1),
            _ => Err(BulkMapperError::validation(format!(
                "unsupported input encoding '{label}': expected utf-8, utf-8-sig, utf-16, utf-16le, utf-16be or latin-1"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Utf8Bom => "utf-8-sig",
            Self::Utf16 => "utf-16",
            Self::Utf16Le => "utf-16le",
            Self::Utf16Be => "utf-16be",
            Self::Latin1 => "latin-1",
        }
    }
}

/// Guess the encoding of raw file content.
///
/// BOMs win; otherwise valid UTF-8 is UTF-8 and anything else is Latin-1.
pub fn detect_encoding(bytes: &[u8]) -> TextEncoding {
    if bytes.starts_with(UTF8_BOM) {
        TextEncoding::Utf8Bom
    } else if bytes.starts_with(UTF16_LE_BOM) {
        TextEncoding::Utf16Le
    } else if bytes.starts_with(UTF16_BE_BOM) {
        TextEncoding::Utf16Be
    } else if std::str::from_utf8(bytes).is_ok() {
        TextEncoding::Utf8
    } else {
        TextEncoding::Latin1
    }
}

/// Decode raw bytes, dropping any BOM. Undecodable sequences become U+FFFD.
pub fn decode(bytes: &[u8], encoding: TextEncoding) -> String {
    match encoding {
        TextEncoding::Utf8 | TextEncoding::Utf8Bom => {
            let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
            String::from_utf8_lossy(body).into_owned()
        }
        TextEncoding::Utf16 => {
            let order = if bytes.starts_with(UTF16_BE_BOM) {
                TextEncoding::Utf16Be
            } else {
                TextEncoding::Utf16Le
            };
            decode(bytes, order)
        }
        TextEncoding::Utf16Le => {
            let body = bytes.strip_prefix(UTF16_LE_BOM).unwrap_or(bytes);
            let units: Vec<u16> = body
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        TextEncoding::Utf16Be => {
            let body = bytes.strip_prefix(UTF16_BE_BOM).unwrap_or(bytes);
            let units: Vec<u16> = body
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        TextEncoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Truncate an input to [`MAX_INPUT_LENGTH`] characters, warning if it was cut.
pub fn prepare_value(value: &str) -> String {
    if value.chars().count() <= MAX_INPUT_LENGTH {
        return value.to_string();
    }

    let truncated: String = value.chars().take(MAX_INPUT_LENGTH).collect();
    warn!(
        max = MAX_INPUT_LENGTH,
        input = %truncated,
        "input too long, truncated"
    );
    truncated
}

/// Parse decoded file content into inputs.
///
/// Rows are headerless CSV of varying width: column 1 is the value, column 2
/// (if non-blank) the type hint, anything further is ignored. Blank rows are
/// dropped.
pub fn parse_inputs(text: &str) -> Result<Vec<MappingInput>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut inputs = Vec::new();

    for (row, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| BulkMapperError::parse(format!("malformed input row {}: {e}", row + 1)))?;

        let value = record.get(0).unwrap_or("").trim_end_matches(['\r', '\n']);
        if value.trim().is_empty() {
            continue;
        }

        let mut input = MappingInput::new(prepare_value(value));
        if let Some(hint) = record.get(1).map(str::trim).filter(|h| !h.is_empty()) {
            input = input.with_hint(hint);
        }
        inputs.push(input);
    }

    Ok(inputs)
}

/// Read, decode and parse an input file.
///
/// `encoding` overrides detection when set.
pub fn load_inputs(path: &Path, encoding: Option<TextEncoding>) -> Result<Vec<MappingInput>> {
    let bytes = std::fs::read(path).map_err(|e| BulkMapperError::io(path, e))?;

    let encoding = match encoding {
        Some(explicit) => explicit,
        None => {
            let detected = detect_encoding(&bytes);
            debug!(path = %path.display(), encoding = detected.name(), "detected input encoding");
            detected
        }
    };

    let inputs = parse_inputs(&decode(&bytes, encoding))?;

    info!(
        path = %path.display(),
        encoding = encoding.name(),
        rows = inputs.len(),
        "loaded input file"
    );

    Ok(inputs)
}
