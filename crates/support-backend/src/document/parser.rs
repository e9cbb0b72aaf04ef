//! Document Loader: format-dispatched parsing into normalized `(text,
//! metadata)`. Images and audio are delegated to
//! a `CaptioningProvider` external collaborator (out of scope,
//! consumed through this narrow trait) and carry `modality != text`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;

use crate::models::domain::Modality;

pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "pdf", "txt", "md", "docx", "doc", "html", "htm", "csv", "png", "jpg", "jpeg", "mp3", "wav",
];

pub const MAX_BYTES: u64 = 50 * 1024 * 1024;
pub const MAX_TEXT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub text: String,
    pub page_count: Option<usize>,
    pub modality: Modality,
}

/// Image captioning / audio transcription, consumed by the Document
/// Loader for non-text modalities. A thin seam so this crate never talks
/// to a concrete vision/speech API directly.
#[async_trait]
pub trait CaptioningProvider: Send + Sync {
    async fn caption_image(&self, bytes: &[u8], file_name: &str) -> Result<String>;
    async fn transcribe_audio(&self, bytes: &[u8], file_name: &str) -> Result<String>;
}

/// Fallback used when no captioning provider is configured: degrades to a
/// placeholder noting the asset was not processed, rather than failing the
/// whole ingestion job.
pub struct NullCaptioningProvider;

#[async_trait]
impl CaptioningProvider for NullCaptioningProvider {
    async fn caption_image(&self, _bytes: &[u8], file_name: &str) -> Result<String> {
        Ok(format!("[image: {file_name}, no captioning provider configured]"))
    }

    async fn transcribe_audio(&self, _bytes: &[u8], file_name: &str) -> Result<String> {
        Ok(format!("[audio: {file_name}, no transcription provider configured]"))
    }
}

pub struct DocumentParser;

impl DocumentParser {
    pub fn extension_of(path: &Path) -> String {
        path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase()
    }

    pub fn is_supported(path: &Path) -> bool {
        SUPPORTED_EXTENSIONS.contains(&Self::extension_of(path).as_str())
    }

    /// Dispatches on extension; images/audio are routed through `captioner`.
    /// Byte-size limits (§4.1) are the ingestion core's responsibility,
    /// checked before this is called.
    pub async fn parse(
        path: &Path,
        bytes: &[u8],
        captioner: &dyn CaptioningProvider,
    ) -> Result<ParsedDocument> {
        let ext = Self::extension_of(path);
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("document").to_string();

        match ext.as_str() {
            "pdf" => Self::parse_pdf(bytes),
            "docx" | "doc" => Self::parse_docx(bytes),
            "html" | "htm" => Self::parse_html(bytes),
            "csv" => Self::parse_csv(bytes),
            "png" | "jpg" | "jpeg" => {
                let text = captioner.caption_image(bytes, &file_name).await?;
                Ok(ParsedDocument { text, page_count: None, modality: Modality::Image })
            }
            "mp3" | "wav" => {
                let text = captioner.transcribe_audio(bytes, &file_name).await?;
                Ok(ParsedDocument { text, page_count: None, modality: Modality::Audio })
            }
            // "txt" | "md" and any unrecognized extension fall back to raw text.
            _ => Self::parse_text(bytes),
        }
    }

    fn parse_pdf(bytes: &[u8]) -> Result<ParsedDocument> {
        use lopdf::Document;

        let doc = Document::load_mem(bytes).context("failed to parse PDF")?;
        let page_count = doc.get_pages().len();

        let mut text = String::new();
        for page_num in 1..=page_count as u32 {
            if let Ok(page_text) = doc.extract_text(&[page_num]) {
                text.push_str(&page_text);
                text.push('\n');
            }
        }

        Ok(ParsedDocument { text, page_count: Some(page_count), modality: Modality::Text })
    }

    fn parse_docx(bytes: &[u8]) -> Result<ParsedDocument> {
        use docx_rs::*;

        let docx = read_docx(bytes).context("failed to parse DOCX")?;
        let mut text = String::new();

        for child in docx.document.children {
            if let DocumentChild::Paragraph(para) = child {
                for child in para.children {
                    if let ParagraphChild::Run(run) = child {
                        for child in run.children {
                            if let RunChild::Text(t) = child {
                                text.push_str(&t.text);
                            }
                        }
                    }
                }
                text.push('\n');
            }
        }

        Ok(ParsedDocument { text, page_count: None, modality: Modality::Text })
    }

    fn parse_html(bytes: &[u8]) -> Result<ParsedDocument> {
        use scraper::{Html, Selector};

        let raw = String::from_utf8_lossy(bytes);
        let document = Html::parse_document(&raw);
        let body_selector = Selector::parse("body").unwrap_or_else(|_| Selector::parse("html").unwrap());

        let mut text = String::new();
        for node in document.select(&body_selector) {
            for fragment in node.text() {
                let trimmed = fragment.trim();
                if !trimmed.is_empty() {
                    text.push_str(trimmed);
                    text.push(' ');
                }
            }
        }

        Ok(ParsedDocument { text, page_count: None, modality: Modality::Text })
    }

    fn parse_csv(bytes: &[u8]) -> Result<ParsedDocument> {
        let raw = String::from_utf8_lossy(bytes);
        let text = raw
            .lines()
            .map(|line| line.split(',').map(str::trim).collect::<Vec<_>>().join(" | "))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ParsedDocument { text, page_count: None, modality: Modality::Text })
    }

    fn parse_text(bytes: &[u8]) -> Result<ParsedDocument> {
        let (text, _, had_errors) = encoding_rs::UTF_8.decode(bytes);
        if had_errors {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            return Ok(ParsedDocument { text: text.into_owned(), page_count: None, modality: Modality::Text });
        }
        Ok(ParsedDocument { text: text.into_owned(), page_count: None, modality: Modality::Text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn plain_text_round_trips() {
        let parsed = DocumentParser::parse(
            &PathBuf::from("note.txt"),
            b"hello world",
            &NullCaptioningProvider,
        )
        .await
        .unwrap();
        assert_eq!(parsed.text, "hello world");
        assert_eq!(parsed.modality, Modality::Text);
    }

    #[tokio::test]
    async fn csv_rows_are_pipe_joined() {
        let parsed = DocumentParser::parse(
            &PathBuf::from("data.csv"),
            b"a,b,c\n1,2,3",
            &NullCaptioningProvider,
        )
        .await
        .unwrap();
        assert_eq!(parsed.text, "a | b | c\n1 | 2 | 3");
    }

    #[tokio::test]
    async fn image_delegates_to_captioning_provider() {
        let parsed = DocumentParser::parse(
            &PathBuf::from("photo.png"),
            b"\x89PNG",
            &NullCaptioningProvider,
        )
        .await
        .unwrap();
        assert_eq!(parsed.modality, Modality::Image);
        assert!(parsed.text.contains("photo.png"));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        assert!(!DocumentParser::is_supported(&PathBuf::from("archive.zip")));
        assert!(DocumentParser::is_supported(&PathBuf::from("note.txt")));
    }
}
