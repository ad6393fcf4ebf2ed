use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),

    #[error("{tool} failed: {message}")]
    Tool { tool: &'static str, message: String },
}

/// One rendered page, ready for a vision model or OCR
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    /// 1-based
    pub page_number: usize,
    pub bytes: Vec<u8>,
    pub media_type: String,
}

/// Direct text-layer extraction, no rendering involved
pub trait PdfTextLayer: Send + Sync {
    fn extract_text(&self, pdf_bytes: &[u8]) -> Result<String, ExtractError>;
}

/// Text layer via the pdf-extract crate
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfExtractTextLayer;

impl PdfTextLayer for PdfExtractTextLayer {
    fn extract_text(&self, pdf_bytes: &[u8]) -> Result<String, ExtractError> {
        // pdf-extract panics on some malformed inputs
        std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(pdf_bytes))
            .map_err(|_| ExtractError::PdfParsing("parser panicked".to_string()))?
            .map_err(|e| ExtractError::PdfParsing(e.to_string()))
    }
}

/// Renders a PDF into ordered page images
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    async fn rasterize(&self, pdf_path: &Path) -> Result<Vec<PageImage>, ExtractError>;
}

/// Rasterizer shelling out to Poppler's `pdftoppm`
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    pub dpi: u32,
    pub program: String,
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self {
            dpi: 200,
            program: "pdftoppm".to_string(),
        }
    }
}

#[async_trait]
impl PageRasterizer for PdftoppmRasterizer {
    async fn rasterize(&self, pdf_path: &Path) -> Result<Vec<PageImage>, ExtractError> {
        let out_dir = tempfile::tempdir()?;
        let prefix = out_dir.path().join("page");

        let output = Command::new(&self.program)
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-png")
            .arg(pdf_path)
            .arg(&prefix)
            .output()
            .await
            .map_err(|e| ExtractError::Tool {
                tool: "pdftoppm",
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ExtractError::Tool {
                tool: "pdftoppm",
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let mut files: Vec<(usize, PathBuf)> = std::fs::read_dir(out_dir.path())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter_map(|path| page_number_of(&path).map(|n| (n, path)))
            .collect();
        files.sort_by_key(|(n, _)| *n);

        let mut pages = Vec::with_capacity(files.len());
        for (page_number, path) in files {
            pages.push(PageImage {
                page_number,
                bytes: tokio::fs::read(&path).await?,
                media_type: "image/png".to_string(),
            });
        }
        debug!("Rasterized {} pages at {} dpi", pages.len(), self.dpi);
        Ok(pages)
    }
}

/// `page-07.png` -> 7
fn page_number_of(path: &Path) -> Option<usize> {
    if path.extension().and_then(|e| e.to_str()) != Some("png") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.rsplit('-').next()?.parse().ok()
}

/// MIME type from a file extension
pub fn media_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// PDF by extension or by the `%PDF` magic bytes
pub fn is_pdf(path: &Path, bytes: &[u8]) -> bool {
    media_type_for(path) == "application/pdf" || bytes.starts_with(b"%PDF")
}

pub fn non_whitespace_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_number_parsing() {
        assert_eq!(page_number_of(Path::new("/tmp/x/page-07.png")), Some(7));
        assert_eq!(page_number_of(Path::new("/tmp/x/page-12.png")), Some(12));
        assert_eq!(page_number_of(Path::new("/tmp/x/page-1.ppm")), None);
    }

    #[test]
    fn test_media_types() {
        assert_eq!(media_type_for(Path::new("a.PDF")), "application/pdf");
        assert_eq!(media_type_for(Path::new("scan.jpeg")), "image/jpeg");
        assert_eq!(media_type_for(Path::new("noext")), "application/octet-stream");
        assert!(is_pdf(Path::new("upload.bin"), b"%PDF-1.7 ..."));
        assert!(!is_pdf(Path::new("scan.png"), b"\x89PNG"));
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        assert!(PdfExtractTextLayer.extract_text(b"not a pdf").is_err());
    }

    #[test]
    fn test_non_whitespace_chars() {
        assert_eq!(non_whitespace_chars(" a b\n\tc "), 3);
    }
}
