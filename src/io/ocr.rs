use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::pdf::{ExtractError, PageImage};

/// Deterministic OCR, the last resort for a page the model could not read
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image: &PageImage, language: &str) -> Result<String, ExtractError>;
}

/// OCR through the `tesseract` command-line tool
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    pub program: String,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            program: "tesseract".to_string(),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize(&self, image: &PageImage, language: &str) -> Result<String, ExtractError> {
        let suffix = match image.media_type.as_str() {
            "image/jpeg" => ".jpg",
            "image/tiff" => ".tif",
            "image/bmp" => ".bmp",
            _ => ".png",
        };
        let file = tempfile::Builder::new().suffix(suffix).tempfile()?;
        tokio::fs::write(file.path(), &image.bytes).await?;

        let lang = tesseract_language(language);
        let output = Command::new(&self.program)
            .arg(file.path())
            .arg("stdout")
            .arg("-l")
            .arg(&lang)
            .output()
            .await
            .map_err(|e| ExtractError::Tool {
                tool: "tesseract",
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ExtractError::Tool {
                tool: "tesseract",
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(
            "Tesseract ({}) read {} chars from page {}",
            lang,
            text.len(),
            image.page_number
        );
        Ok(text)
    }
}

/// Map a language hint to tesseract language codes.
///
/// `+`-joined hints are mapped part by part; unknown codes pass through.
pub fn tesseract_language(hint: &str) -> String {
    let mapped: Vec<&str> = hint
        .split('+')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.to_lowercase().as_str() {
            "en" | "eng" | "english" => "eng",
            "mk" | "mkd" | "macedonian" => "mkd",
            "sr" | "srp" => "srp",
            "bg" | "bul" => "bul",
            "de" | "deu" => "deu",
            _ => part,
        })
        .collect();
    if mapped.is_empty() {
        "eng".to_string()
    } else {
        mapped.join("+")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tesseract_language_mapping() {
        assert_eq!(tesseract_language("en"), "eng");
        assert_eq!(tesseract_language("mk"), "mkd");
        assert_eq!(tesseract_language("mk+en"), "mkd+eng");
        assert_eq!(tesseract_language("fra"), "fra");
        assert_eq!(tesseract_language(""), "eng");
    }
}
