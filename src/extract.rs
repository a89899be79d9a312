//! Document loading: per-format text extraction plus normalization.
//!
//! The upload layer supplies bytes and a declared MIME type; this module
//! returns normalized UTF-8 text ready for chunking. Each supported format
//! is a [`DocumentParser`] implementation selected by MIME type, so adding
//! a format means adding a parser, not extending a conditional chain.

use std::io::Read;

use crate::error::IngestError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extracts plain text from one document format.
pub trait DocumentParser: Send + Sync {
    /// The MIME type this parser handles.
    fn mime(&self) -> &'static str;
    /// Parse raw bytes into plain text. Fails with `Parse` on corrupt input.
    fn parse(&self, bytes: &[u8]) -> Result<String, IngestError>;
}

/// Look up the parser for a declared MIME type.
pub fn parser_for(mime: &str) -> Option<&'static dyn DocumentParser> {
    static PDF: PdfParser = PdfParser;
    static DOCX: DocxParser = DocxParser;
    static TEXT: PlainTextParser = PlainTextParser { mime: MIME_TEXT };
    static MARKDOWN: PlainTextParser = PlainTextParser {
        mime: MIME_MARKDOWN,
    };

    match mime {
        MIME_PDF => Some(&PDF),
        MIME_DOCX => Some(&DOCX),
        MIME_TEXT => Some(&TEXT),
        MIME_MARKDOWN => Some(&MARKDOWN),
        _ => None,
    }
}

/// Extract and normalize text for the given MIME type.
///
/// Returns `UnsupportedFormat` for unknown types and `Parse` for corrupt
/// input; both abort ingestion before anything is persisted.
pub fn extract_text(bytes: &[u8], mime: &str) -> Result<String, IngestError> {
    let parser =
        parser_for(mime).ok_or_else(|| IngestError::UnsupportedFormat(mime.to_string()))?;
    let raw = parser.parse(bytes)?;
    Ok(normalize(&raw))
}

/// Collapse whitespace so chunk lengths are measured consistently.
///
/// Runs of spaces and tabs become a single space, blank-line runs become a
/// single paragraph break, and trailing whitespace is trimmed. Chunking and
/// span offsets both operate on this normalized form.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_newlines = 0usize;
    let mut pending_space = false;

    for ch in text.chars() {
        match ch {
            '\n' | '\r' => {
                pending_newlines += 1;
                pending_space = false;
            }
            c if c.is_whitespace() => pending_space = true,
            c => {
                if pending_newlines > 0 && !out.is_empty() {
                    out.push_str(if pending_newlines > 1 { "\n\n" } else { "\n" });
                } else if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_newlines = 0;
                pending_space = false;
                out.push(c);
            }
        }
    }

    out
}

// ============ PDF ============

struct PdfParser;

impl DocumentParser for PdfParser {
    fn mime(&self) -> &'static str {
        MIME_PDF
    }

    fn parse(&self, bytes: &[u8]) -> Result<String, IngestError> {
        pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| IngestError::Parse(format!("PDF extraction failed: {}", e)))
    }
}

// ============ DOCX (OOXML) ============

struct DocxParser;

impl DocumentParser for DocxParser {
    fn mime(&self) -> &'static str {
        MIME_DOCX
    }

    fn parse(&self, bytes: &[u8]) -> Result<String, IngestError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| IngestError::Parse(format!("OOXML archive: {}", e)))?;
        let mut doc_xml = Vec::new();
        let mut found = false;
        for i in 0..archive.len() {
            let entry = archive
                .by_index(i)
                .map_err(|e| IngestError::Parse(format!("OOXML archive: {}", e)))?;
            if entry.name() == "word/document.xml" {
                entry
                    .take(MAX_XML_ENTRY_BYTES)
                    .read_to_end(&mut doc_xml)
                    .map_err(|e| IngestError::Parse(format!("OOXML read: {}", e)))?;
                if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
                    return Err(IngestError::Parse(
                        "word/document.xml exceeds size limit".to_string(),
                    ));
                }
                found = true;
                break;
            }
        }
        if !found {
            return Err(IngestError::Parse(
                "word/document.xml not found".to_string(),
            ));
        }
        extract_w_t_elements(&doc_xml)
    }
}

/// Pull the text runs (`<w:t>` elements) out of a WordprocessingML body,
/// inserting paragraph breaks at `</w:p>` boundaries.
fn extract_w_t_elements(xml: &[u8]) -> Result<String, IngestError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" && !out.is_empty() {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(IngestError::Parse(format!("OOXML xml: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ Plain text / Markdown ============

struct PlainTextParser {
    mime: &'static str,
}

impl DocumentParser for PlainTextParser {
    fn mime(&self) -> &'static str {
        self.mime
    }

    fn parse(&self, bytes: &[u8]) -> Result<String, IngestError> {
        // Tolerate non-UTF-8 uploads; lossy replacement beats rejecting
        // otherwise-readable documents.
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}
