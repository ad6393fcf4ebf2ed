use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::io::{
    OcrEngine, PageImage, PageRasterizer, PdfExtractTextLayer, PdfTextLayer, PdftoppmRasterizer,
    TesseractOcr, is_pdf, media_type_for, non_whitespace_chars,
};
use crate::llm::prompts::{EXTRACTION_PROMPTS, extraction_prompt};
use crate::llm::{
    CandidateKind, CompletionRequest, ImageInput, ModelClient, RetryOutcome, RetryPolicy,
    ValidityClassifier, ValidityContext, retry_with_variants,
};

/// Configuration for text extraction
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Retry policy for the per-page model call
    pub retry: RetryPolicy,
    /// Text-layer output with at least this many non-whitespace chars skips rendering
    pub min_text_layer_chars: usize,
    /// OCR language when the caller gives no hint
    pub default_language: String,
    pub max_tokens: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default().best_effort(),
            min_text_layer_chars: 10,
            default_language: "eng".to_string(),
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Embedded PDF text, no model or OCR involved
    TextLayer,
    /// Pages rendered and read one by one
    PageByPage,
}

/// Where a page's text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    Model,
    /// Model output that never passed validation
    ModelBestEffort,
    Ocr,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageResult {
    pub page_number: usize,
    pub source: PageSource,
    pub chars: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub text: String,
    pub method: ExtractionMethod,
    pub pages: Vec<PageResult>,
}

impl ExtractionResult {
    fn text_layer(text: &str) -> Self {
        Self {
            text: text.trim().to_string(),
            method: ExtractionMethod::TextLayer,
            pages: Vec::new(),
        }
    }
}

/// Placeholder for a page neither the model nor OCR could read
pub fn page_placeholder(page_number: usize) -> String {
    format!("[Error: could not extract text from page {}]", page_number)
}

/// Page-wise text recovery: text layer, then model per page, then OCR
pub struct Extractor {
    model: Arc<dyn ModelClient>,
    text_layer: Arc<dyn PdfTextLayer>,
    rasterizer: Arc<dyn PageRasterizer>,
    ocr: Arc<dyn OcrEngine>,
    classifier: ValidityClassifier,
    config: ExtractionConfig,
}

impl Extractor {
    /// Extractor with pdf-extract, pdftoppm and tesseract backends
    pub fn new(model: Arc<dyn ModelClient>, config: ExtractionConfig) -> Self {
        Self {
            model,
            text_layer: Arc::new(PdfExtractTextLayer),
            rasterizer: Arc::new(PdftoppmRasterizer::default()),
            ocr: Arc::new(TesseractOcr::default()),
            classifier: ValidityClassifier::default(),
            config,
        }
    }

    pub fn with_text_layer(mut self, text_layer: Arc<dyn PdfTextLayer>) -> Self {
        self.text_layer = text_layer;
        self
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn with_classifier(mut self, classifier: ValidityClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Extract plain text from a PDF or image. Never fails; unreadable pages
    /// become placeholders.
    pub async fn extract(&self, path: &Path, language: Option<&str>) -> String {
        self.extract_detailed(path, language).await.text
    }

    /// Like [`Extractor::extract`], also reporting how each page was read
    pub async fn extract_detailed(&self, path: &Path, language: Option<&str>) -> ExtractionResult {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not read input file: {}", e);
                return self.placeholder_result(1);
            }
        };

        let pages = if is_pdf(path, &bytes) {
            // 1. Text layer fast path
            let text_layer = self.text_layer.clone();
            let layer = tokio::task::spawn_blocking(move || text_layer.extract_text(&bytes)).await;
            let layer_text = match layer {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    warn!("Text layer unavailable: {}", e);
                    String::new()
                }
                Err(e) => {
                    warn!("Text layer task failed: {}", e);
                    String::new()
                }
            };
            let layer_chars = non_whitespace_chars(&layer_text);
            if layer_chars >= self.config.min_text_layer_chars {
                info!("Extraction: text layer has {} chars, skipping page rendering", layer_chars);
                return ExtractionResult::text_layer(&layer_text);
            }

            // 2. Render pages
            match self.rasterizer.rasterize(path).await {
                Ok(pages) if !pages.is_empty() => pages,
                other => {
                    match other {
                        Err(e) => warn!("Rasterization failed: {}", e),
                        Ok(_) => warn!("Rasterization produced no pages"),
                    }
                    if layer_chars > 0 {
                        return ExtractionResult::text_layer(&layer_text);
                    }
                    return self.placeholder_result(1);
                }
            }
        } else {
            vec![PageImage {
                page_number: 1,
                media_type: media_type_for(path).to_string(),
                bytes,
            }]
        };

        info!("Extraction: reading {} pages", pages.len());

        let mut texts = Vec::with_capacity(pages.len());
        let mut results = Vec::with_capacity(pages.len());
        for page in &pages {
            let (text, source) = self.extract_page(page, language).await;
            results.push(PageResult {
                page_number: page.page_number,
                source,
                chars: text.chars().count(),
            });
            texts.push(text);
        }

        ExtractionResult {
            text: texts.join("\n"),
            method: ExtractionMethod::PageByPage,
            pages: results,
        }
    }

    fn placeholder_result(&self, page_number: usize) -> ExtractionResult {
        let text = page_placeholder(page_number);
        ExtractionResult {
            pages: vec![PageResult {
                page_number,
                source: PageSource::Placeholder,
                chars: text.chars().count(),
            }],
            text,
            method: ExtractionMethod::PageByPage,
        }
    }

    async fn extract_page(&self, page: &PageImage, language: Option<&str>) -> (String, PageSource) {
        let image = ImageInput::from_bytes(&page.bytes, page.media_type.clone());
        let label = format!("extract page {}", page.page_number);
        let context = ValidityContext::new(CandidateKind::ExtractedText);

        let outcome = retry_with_variants(
            &self.config.retry,
            &label,
            EXTRACTION_PROMPTS.len(),
            |variant| {
                let request = CompletionRequest::new(extraction_prompt(variant, language))
                    .with_image(image.clone())
                    .with_max_tokens(self.config.max_tokens)
                    .with_temperature(0.0);
                let model = &self.model;
                async move { model.complete(request).await }
            },
            |text: &String| self.classifier.check(text, context),
        )
        .await;

        match outcome {
            Ok(RetryOutcome::Accepted { value, .. }) => (value.trim().to_string(), PageSource::Model),
            Ok(RetryOutcome::BestEffort { value, .. }) => {
                warn!(
                    "Page {}: model output never validated, trying OCR",
                    page.page_number
                );
                match self.ocr_page(page, language).await {
                    Some(text) => (text, PageSource::Ocr),
                    None if !value.trim().is_empty() => {
                        (value.trim().to_string(), PageSource::ModelBestEffort)
                    }
                    None => (page_placeholder(page.page_number), PageSource::Placeholder),
                }
            }
            Err(e) => {
                warn!("Page {}: {}; falling back to OCR", page.page_number, e);
                match self.ocr_page(page, language).await {
                    Some(text) => (text, PageSource::Ocr),
                    None => (page_placeholder(page.page_number), PageSource::Placeholder),
                }
            }
        }
    }

    /// OCR text of a page, `None` when OCR fails or reads nothing
    async fn ocr_page(&self, page: &PageImage, language: Option<&str>) -> Option<String> {
        let language = language
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(self.config.default_language.as_str());
        match self.ocr.recognize(page, language).await {
            Ok(text) if non_whitespace_chars(&text) > 0 => Some(text.trim().to_string()),
            Ok(_) => {
                warn!("Page {}: OCR found no text", page.page_number);
                None
            }
            Err(e) => {
                warn!("Page {}: OCR failed: {}", page.page_number, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use async_trait::async_trait;

    use crate::io::ExtractError;
    use crate::llm::fake::{Reply, ScriptedModel};

    #[test]
    fn test_placeholder_format() {
        assert_eq!(page_placeholder(3), "[Error: could not extract text from page 3]");
    }

    #[test]
    fn test_default_config() {
        let config = ExtractionConfig::default();
        assert_eq!(config.min_text_layer_chars, 10);
        assert_eq!(config.retry.max_attempts, 3);
    }

    struct EmptyLayer;

    impl PdfTextLayer for EmptyLayer {
        fn extract_text(&self, _pdf_bytes: &[u8]) -> Result<String, ExtractError> {
            Ok(String::new())
        }
    }

    struct Pages(usize);

    #[async_trait]
    impl PageRasterizer for Pages {
        async fn rasterize(&self, _pdf_path: &Path) -> Result<Vec<PageImage>, ExtractError> {
            Ok((1..=self.0)
                .map(|page_number| PageImage {
                    page_number,
                    bytes: format!("page {page_number}").into_bytes(),
                    media_type: "image/png".to_string(),
                })
                .collect())
        }
    }

    /// OCR that can only read the listed pages
    struct OcrByPage(HashMap<usize, &'static str>);

    #[async_trait]
    impl OcrEngine for OcrByPage {
        async fn recognize(&self, image: &PageImage, _language: &str) -> Result<String, ExtractError> {
            self.0
                .get(&image.page_number)
                .map(|t| t.to_string())
                .ok_or_else(|| ExtractError::Tool {
                    tool: "tesseract",
                    message: "unreadable".to_string(),
                })
        }
    }

    fn scanned_pdf() -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        std::fs::write(file.path(), b"%PDF-1.4 scanned").unwrap();
        file
    }

    fn extractor(model: Arc<ScriptedModel>, pages: usize, ocr: OcrByPage) -> Extractor {
        let config = ExtractionConfig {
            retry: RetryPolicy::new(3, None).best_effort(),
            ..Default::default()
        };
        Extractor::new(model, config)
            .with_text_layer(Arc::new(EmptyLayer))
            .with_rasterizer(Arc::new(Pages(pages)))
            .with_ocr(Arc::new(ocr))
    }

    #[tokio::test]
    async fn test_pages_joined_in_order_with_mixed_sources() {
        let mut replies = vec![Reply::Text("Hemoglobin 13.5 g/dL 12-16".to_string())];
        replies.extend((0..6).map(|_| Reply::Fail));
        let model = Arc::new(ScriptedModel::new(replies));
        let ocr = OcrByPage(HashMap::from([(2, "WBC 6.1 10^9/L 4-10\n")]));
        let pdf = scanned_pdf();

        let result = extractor(model.clone(), 3, ocr)
            .extract_detailed(pdf.path(), None)
            .await;

        assert_eq!(result.method, ExtractionMethod::PageByPage);
        assert_eq!(
            result.text,
            "Hemoglobin 13.5 g/dL 12-16\nWBC 6.1 10^9/L 4-10\n[Error: could not extract text from page 3]"
        );
        let sources: Vec<_> = result.pages.iter().map(|p| (p.page_number, p.source)).collect();
        assert_eq!(
            sources,
            vec![
                (1, PageSource::Model),
                (2, PageSource::Ocr),
                (3, PageSource::Placeholder)
            ]
        );
        assert_eq!(model.calls(), 7);
    }

    #[tokio::test]
    async fn test_rejected_page_keeps_model_text_when_ocr_reads_nothing() {
        let model = Arc::new(ScriptedModel::new(vec![Reply::Text(
            "I'm sorry, but the page says Glucose 5.4".to_string(),
        )]));
        let pdf = scanned_pdf();

        let result = extractor(model.clone(), 1, OcrByPage(HashMap::new()))
            .extract_detailed(pdf.path(), None)
            .await;

        assert_eq!(result.text, "I'm sorry, but the page says Glucose 5.4");
        assert_eq!(result.pages[0].source, PageSource::ModelBestEffort);
        assert_eq!(model.calls(), 3);
    }
}
