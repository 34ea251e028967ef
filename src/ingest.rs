use encoding_rs::{Encoding, GBK, UTF_8, WINDOWS_1252};
use log::{debug, warn};
use std::borrow::Cow;
use std::path::Path;
use thiserror::Error;

use crate::spreadsheet;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv", "json", "py", "html", "css", "js"];
const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx"];
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    Spreadsheet,
}

impl FileKind {
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())?;

        if TEXT_EXTENSIONS.contains(&ext.as_str()) {
            Some(FileKind::Text)
        } else if SPREADSHEET_EXTENSIONS.contains(&ext.as_str()) {
            Some(FileKind::Spreadsheet)
        } else {
            None
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
}

/// Which attempt produced the text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Gbk,
    Latin1Lossy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedText {
    pub text: String,
    pub encoding: TextEncoding,
}

/// Decode bytes as UTF-8, then GBK, then Windows-1252. The last step
/// cannot fail.
pub fn decode_text(bytes: &[u8]) -> DecodedText {
    if let Some(text) = decode_strict(UTF_8, strip_utf8_bom(bytes)) {
        return DecodedText {
            text,
            encoding: TextEncoding::Utf8,
        };
    }

    if let Some(text) = decode_strict(GBK, bytes) {
        return DecodedText {
            text,
            encoding: TextEncoding::Gbk,
        };
    }

    let (text, _had_errors) = WINDOWS_1252.decode_without_bom_handling(bytes);
    DecodedText {
        text: text.into_owned(),
        encoding: TextEncoding::Latin1Lossy,
    }
}

fn strip_utf8_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
}

fn decode_strict(encoding: &'static Encoding, bytes: &[u8]) -> Option<String> {
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(Cow::into_owned)
}

/// Turn an uploaded file into the text that goes into the prompt
pub fn read_upload(filename: &str, bytes: &[u8]) -> Result<String, IngestError> {
    match FileKind::from_filename(filename) {
        Some(FileKind::Text) => {
            let decoded = decode_text(bytes);
            debug!("Decoded {} as {:?}", filename, decoded.encoding);
            Ok(decoded.text)
        }
        Some(FileKind::Spreadsheet) => match spreadsheet::flatten_workbook(bytes) {
            Ok(text) => Ok(text),
            Err(e) => {
                warn!("Failed to parse spreadsheet {}: {:#}", filename, e);
                Ok(format!("[Spreadsheet parse error in {}: {:#}]", filename, e))
            }
        },
        None => Err(IngestError::Unsupported(filename.to_string())),
    }
}
