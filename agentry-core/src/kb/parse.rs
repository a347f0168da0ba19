//! Document parsing for the ingest pipeline.
//!
//! Formats are whitelisted by extension and cross-checked against magic
//! bytes for the binary formats; a mismatch is a parse failure, not a
//! silent fallback. Uploads are capped at 10 MiB.

use std::io::Read;

use crate::error::IngestError;

/// Maximum accepted upload size.
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// The document format whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Pdf,
    Docx,
    Txt,
    Md,
    Csv,
}

impl DocFormat {
    /// Resolve a format from a filename extension.
    pub fn from_filename(filename: &str) -> Result<Self, IngestError> {
        let ext = filename
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        match ext.as_str() {
            "pdf" => Ok(DocFormat::Pdf),
            "docx" => Ok(DocFormat::Docx),
            "txt" => Ok(DocFormat::Txt),
            "md" | "markdown" => Ok(DocFormat::Md),
            "csv" => Ok(DocFormat::Csv),
            other => Err(IngestError::UnsupportedFormat { ext: other.into() }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocFormat::Pdf => "pdf",
            DocFormat::Docx => "docx",
            DocFormat::Txt => "txt",
            DocFormat::Md => "md",
            DocFormat::Csv => "csv",
        }
    }
}

/// Validate size and magic bytes, then extract plain text.
pub fn extract_text(format: DocFormat, bytes: &[u8]) -> Result<String, IngestError> {
    if bytes.len() > MAX_FILE_SIZE {
        return Err(IngestError::TooLarge {
            size: bytes.len(),
            limit: MAX_FILE_SIZE,
        });
    }
    check_magic(format, bytes)?;

    match format {
        DocFormat::Pdf => extract_pdf(bytes),
        DocFormat::Docx => extract_docx(bytes),
        DocFormat::Csv => extract_csv(bytes),
        DocFormat::Txt | DocFormat::Md => Ok(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Binary formats must carry their signature; a `.pdf` that is secretly a
/// zip (or vice versa) is rejected here.
fn check_magic(format: DocFormat, bytes: &[u8]) -> Result<(), IngestError> {
    match format {
        DocFormat::Pdf => {
            if !bytes.starts_with(b"%PDF-") {
                return Err(IngestError::MagicMismatch {
                    expected: "pdf".into(),
                });
            }
        }
        DocFormat::Docx => {
            if !bytes.starts_with(b"PK\x03\x04") {
                return Err(IngestError::MagicMismatch {
                    expected: "docx".into(),
                });
            }
        }
        DocFormat::Txt | DocFormat::Md | DocFormat::Csv => {}
    }
    Ok(())
}

fn extract_pdf(bytes: &[u8]) -> Result<String, IngestError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| IngestError::Parse {
        message: format!("pdf extraction failed: {e}"),
    })
}

/// DOCX is a zip archive; the document body lives in `word/document.xml`.
/// Paragraph ends become newlines so the chunker sees real boundaries.
fn extract_docx(bytes: &[u8]) -> Result<String, IngestError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor).map_err(|e| IngestError::Parse {
        message: format!("docx archive unreadable: {e}"),
    })?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|_| IngestError::Parse {
            message: "docx missing word/document.xml".into(),
        })?
        .read_to_string(&mut xml)
        .map_err(|e| IngestError::Parse {
            message: format!("docx body unreadable: {e}"),
        })?;

    let mut reader = quick_xml::Reader::from_str(&xml);
    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Text(t)) => {
                if let Ok(fragment) = t.unescape() {
                    text.push_str(&fragment);
                }
            }
            Ok(quick_xml::events::Event::End(end)) => {
                if end.name().as_ref() == b"w:p" {
                    text.push_str("\n\n");
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(IngestError::Parse {
                    message: format!("docx xml malformed: {e}"),
                });
            }
            _ => {}
        }
    }
    Ok(text)
}

/// CSV rows become comma-joined lines; the header stays on top so chunk
/// text remains self-describing.
fn extract_csv(bytes: &[u8]) -> Result<String, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut lines = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| IngestError::Parse {
            message: format!("csv malformed: {e}"),
        })?;
        lines.push(record.iter().collect::<Vec<_>>().join(", "));
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_filename() {
        assert_eq!(DocFormat::from_filename("a.pdf").unwrap(), DocFormat::Pdf);
        assert_eq!(DocFormat::from_filename("b.DOCX").unwrap(), DocFormat::Docx);
        assert_eq!(DocFormat::from_filename("c.markdown").unwrap(), DocFormat::Md);
        assert!(DocFormat::from_filename("d.exe").is_err());
        assert!(DocFormat::from_filename("no-extension").is_err());
    }

    #[test]
    fn test_size_cap() {
        let oversized = vec![b'a'; MAX_FILE_SIZE + 1];
        assert!(matches!(
            extract_text(DocFormat::Txt, &oversized),
            Err(IngestError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_magic_mismatch() {
        // A text payload with a .pdf extension is rejected.
        assert!(matches!(
            extract_text(DocFormat::Pdf, b"just text"),
            Err(IngestError::MagicMismatch { .. })
        ));
        assert!(matches!(
            extract_text(DocFormat::Docx, b"%PDF-1.7 nope"),
            Err(IngestError::MagicMismatch { .. })
        ));
    }

    #[test]
    fn test_plain_text_passthrough() {
        let text = extract_text(DocFormat::Txt, "hello\n\nworld".as_bytes()).unwrap();
        assert_eq!(text, "hello\n\nworld");
    }

    #[test]
    fn test_csv_extraction() {
        let csv = b"name,stage\nAda,won\nGrace,open";
        let text = extract_text(DocFormat::Csv, csv).unwrap();
        assert_eq!(text, "name, stage\nAda, won\nGrace, open");
    }

    #[test]
    fn test_docx_extraction() {
        // Build a minimal docx in memory: a zip with word/document.xml.
        let mut buffer = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buffer);
            let mut writer = zip::ZipWriter::new(cursor);
            let options = zip::write::SimpleFileOptions::default();
            use std::io::Write;
            writer.start_file("word/document.xml", options).unwrap();
            writer
                .write_all(
                    br#"<?xml version="1.0"?><w:document xmlns:w="ns"><w:body>
                        <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
                        <w:p><w:r><w:t>Second paragraph.</w:t></w:r></w:p>
                        </w:body></w:document>"#,
                )
                .unwrap();
            writer.finish().unwrap();
        }

        let text = extract_text(DocFormat::Docx, &buffer).unwrap();
        assert!(text.contains("First paragraph."));
        assert!(text.contains("Second paragraph."));
        // Paragraph boundary survives as a blank line.
        assert!(text.contains("\n\n"));
    }

    #[test]
    fn test_docx_without_body_fails() {
        let mut buffer = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buffer);
            let mut writer = zip::ZipWriter::new(cursor);
            let options = zip::write::SimpleFileOptions::default();
            use std::io::Write;
            writer.start_file("unrelated.txt", options).unwrap();
            writer.write_all(b"nothing").unwrap();
            writer.finish().unwrap();
        }
        assert!(matches!(
            extract_text(DocFormat::Docx, &buffer),
            Err(IngestError::Parse { .. })
        ));
    }
}
