//! Default [`ContentExtractor`]: PDF text via `pdf-extract`, plain text
//! passed through.
//!
//! The format is sniffed from the artifact's leading bytes rather than its
//! extension, since journal servers are loose with content types.

use std::path::Path;

use async_trait::async_trait;

use crate::error::{HarvestError, HarvestResult};
use crate::process::ContentExtractor;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";

/// Guess the content type of an artifact body.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"%PDF-") {
        Some(MIME_PDF)
    } else if std::str::from_utf8(bytes).is_ok() {
        Some(MIME_TEXT)
    } else {
        None
    }
}

/// Extract plain UTF-8 text from an artifact body.
pub fn extract_text(bytes: &[u8]) -> HarvestResult<String> {
    match sniff_content_type(bytes) {
        Some(MIME_PDF) => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| HarvestError::Content(format!("PDF extraction failed: {}", e))),
        Some(_) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        None => Err(HarvestError::Content(
            "unsupported artifact format".to_string(),
        )),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtractor;

#[async_trait]
impl ContentExtractor for PdfExtractor {
    async fn extract(&self, path: &Path) -> HarvestResult<String> {
        let bytes = tokio::fs::read(path).await?;
        // pdf-extract is CPU bound and can take seconds on large papers.
        tokio::task::spawn_blocking(move || extract_text(&bytes))
            .await
            .map_err(|e| HarvestError::Processing(format!("extraction task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_by_leading_bytes() {
        assert_eq!(sniff_content_type(b"%PDF-1.5 ..."), Some(MIME_PDF));
        assert_eq!(sniff_content_type(b"plain words"), Some(MIME_TEXT));
        assert_eq!(sniff_content_type(&[0xff, 0xfe, 0x00, 0x81]), None);
    }

    #[test]
    fn text_passes_through() {
        assert_eq!(extract_text(b"Abstract.\n\nBody.").unwrap(), "Abstract.\n\nBody.");
    }

    #[test]
    fn binary_garbage_is_rejected() {
        assert!(extract_text(&[0xff, 0xfe, 0x00, 0x81]).is_err());
    }

    #[tokio::test]
    async fn extracts_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("paper.txt");
        std::fs::write(&path, "Slow light.").unwrap();
        assert_eq!(PdfExtractor.extract(&path).await.unwrap(), "Slow light.");
    }
}
