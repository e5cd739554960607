use regex::Regex;
use std::io::{Cursor, Read};
use std::path::Path;

/// Turns an attachment into plain text for classification.
///
/// `None` covers both unsupported formats and decode failures; callers
/// treat either as "nothing to scan".
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, filename: &str, data: &[u8]) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    PlainText,
    Pdf,
    Docx,
}

impl DocumentFormat {
    pub fn from_filename(filename: &str) -> Option<Self> {
        let extension = Path::new(filename)
            .extension()?
            .to_str()?
            .to_lowercase();
        match extension.as_str() {
            "txt" | "csv" | "py" | "js" | "html" | "css" => Some(Self::PlainText),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FormatExtractor {
    paragraph: Regex,
    text_run: Regex,
}

impl Default for FormatExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatExtractor {
    pub fn new() -> Self {
        Self {
            paragraph: Regex::new(r"(?s)<w:p[\s>].*?</w:p>").unwrap(),
            text_run: Regex::new(r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>").unwrap(),
        }
    }

    fn extract_pdf_text(&self, data: &[u8]) -> Option<String> {
        // pdf-extract panics on some malformed documents instead of erroring.
        match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(data)) {
            Ok(Ok(text)) => {
                log::debug!("Extracted {} chars from PDF", text.len());
                Some(text)
            }
            Ok(Err(e)) => {
                log::debug!("Failed to extract PDF text: {e}");
                None
            }
            Err(_) => {
                log::debug!("PDF parser panicked, skipping attachment");
                None
            }
        }
    }

    fn extract_docx_text(&self, data: &[u8]) -> Option<String> {
        let mut archive = match zip::ZipArchive::new(Cursor::new(data)) {
            Ok(archive) => archive,
            Err(e) => {
                log::debug!("DOCX is not a readable archive: {e}");
                return None;
            }
        };
        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .ok()?
            .read_to_string(&mut xml)
            .ok()?;
        Some(self.document_xml_text(&xml))
    }

    /// One line per `<w:p>` paragraph, built from its `<w:t>` runs.
    fn document_xml_text(&self, xml: &str) -> String {
        let mut text = String::new();
        for paragraph in self.paragraph.find_iter(xml) {
            for run in self.text_run.captures_iter(paragraph.as_str()) {
                text.push_str(&html_escape::decode_html_entities(&run[1]));
            }
            text.push('\n');
        }
        text
    }
}

impl ContentExtractor for FormatExtractor {
    fn extract(&self, filename: &str, data: &[u8]) -> Option<String> {
        let format = DocumentFormat::from_filename(filename)?;
        let text = match format {
            DocumentFormat::PlainText => Some(String::from_utf8_lossy(data).into_owned()),
            DocumentFormat::Pdf => self.extract_pdf_text(data),
            DocumentFormat::Docx => self.extract_docx_text(data),
        }?;

        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn docx_with(document_xml: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("word/document.xml", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(document_xml.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            DocumentFormat::from_filename("notes.TXT"),
            Some(DocumentFormat::PlainText)
        );
        assert_eq!(
            DocumentFormat::from_filename("keys.py"),
            Some(DocumentFormat::PlainText)
        );
        assert_eq!(
            DocumentFormat::from_filename("report.pdf"),
            Some(DocumentFormat::Pdf)
        );
        assert_eq!(
            DocumentFormat::from_filename("memo.docx"),
            Some(DocumentFormat::Docx)
        );
        assert_eq!(DocumentFormat::from_filename("photo.png"), None);
        assert_eq!(DocumentFormat::from_filename("legacy.doc"), None);
        assert_eq!(DocumentFormat::from_filename("README"), None);
    }

    #[test]
    fn test_plain_text_is_decoded_lossily() {
        let extractor = FormatExtractor::new();
        let text = extractor
            .extract("cards.csv", b"name,card\nbob,4111111111111111\xff\n")
            .unwrap();
        assert!(text.contains("4111111111111111"));
    }

    #[test]
    fn test_blank_text_is_unusable() {
        let extractor = FormatExtractor::new();
        assert_eq!(extractor.extract("empty.txt", b""), None);
        assert_eq!(extractor.extract("spaces.txt", b"  \n\t "), None);
    }

    #[test]
    fn test_unsupported_extension() {
        let extractor = FormatExtractor::new();
        assert_eq!(extractor.extract("image.png", b"password=hunter2"), None);
    }

    #[test]
    fn test_corrupt_documents_yield_none() {
        let extractor = FormatExtractor::new();
        assert_eq!(extractor.extract("broken.pdf", b"not a pdf at all"), None);
        assert_eq!(extractor.extract("broken.docx", b"not a zip either"), None);
    }

    #[test]
    fn test_docx_paragraphs() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>
<w:p><w:r><w:t>API key: </w:t></w:r><w:r><w:t xml:space="preserve">sk-123 &amp; more</w:t></w:r></w:p>
<w:p><w:pPr><w:pStyle w:val="Normal"/></w:pPr><w:r><w:t>Second line</w:t></w:r></w:p>
</w:body></w:document>"#;
        let extractor = FormatExtractor::new();
        let text = extractor.extract("memo.docx", &docx_with(xml)).unwrap();
        assert_eq!(text, "API key: sk-123 & more\nSecond line\n");
    }

    #[test]
    fn test_docx_without_document_part() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("other.xml", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"<x/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let extractor = FormatExtractor::new();
        assert_eq!(extractor.extract("memo.docx", &bytes), None);
    }
}
