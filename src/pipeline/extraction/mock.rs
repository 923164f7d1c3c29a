use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::types::{EngineOutput, ImageVariant, PdfPageRenderer, RecognitionEngine, VariantKind};
use super::ExtractionError;
use crate::models::{content_hash, DocumentType, EngineCapability, EngineKind, Field};

/// Mock recognition engine for testing.
///
/// Returns a configurable text and structured fields. Counts invocations so
/// tests can assert how many real engine calls a scenario caused.
pub struct MockEngine {
    kind: EngineKind,
    capability: EngineCapability,
    text: String,
    variant_text: HashMap<VariantKind, String>,
    content_text: HashMap<String, String>,
    panic_on: HashSet<String>,
    fields: BTreeMap<Field, String>,
    document_hint: Option<DocumentType>,
    confidence: f32,
    delay: Option<Duration>,
    failure: Option<String>,
    configured: bool,
    calls: Arc<AtomicUsize>,
}

impl MockEngine {
    pub fn new(kind: EngineKind, text: &str) -> Self {
        Self {
            kind,
            capability: EngineCapability::Vision,
            text: text.to_string(),
            variant_text: HashMap::new(),
            content_text: HashMap::new(),
            panic_on: HashSet::new(),
            fields: BTreeMap::new(),
            document_hint: None,
            confidence: 0.9,
            delay: None,
            failure: None,
            configured: true,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_capability(mut self, capability: EngineCapability) -> Self {
        self.capability = capability;
        self
    }

    /// Text returned for one specific preprocessing variant.
    pub fn with_variant_text(mut self, variant: VariantKind, text: &str) -> Self {
        self.variant_text.insert(variant, text.to_string());
        self
    }

    /// Text returned for images with exactly these bytes.
    pub fn with_content_text(mut self, bytes: &[u8], text: &str) -> Self {
        self.content_text.insert(content_hash(bytes), text.to_string());
        self
    }

    /// Panic when called with exactly these bytes.
    pub fn panicking_on(mut self, bytes: &[u8]) -> Self {
        self.panic_on.insert(content_hash(bytes));
        self
    }

    pub fn with_field(mut self, field: Field, value: &str) -> Self {
        self.fields.insert(field, value.to_string());
        self
    }

    pub fn with_document_hint(mut self, hint: DocumentType) -> Self {
        self.document_hint = Some(hint);
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, reason: &str) -> Self {
        self.failure = Some(reason.to_string());
        self
    }

    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }

    /// Shared invocation counter; clone before boxing the engine.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecognitionEngine for MockEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn capability(&self) -> EngineCapability {
        self.capability
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn recognize(
        &self,
        image: &ImageVariant,
        _hint: Option<DocumentType>,
    ) -> Result<EngineOutput, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let hash = content_hash(&image.bytes);
        if self.panic_on.contains(&hash) {
            panic!("mock engine crashed on {hash}");
        }
        if let Some(reason) = &self.failure {
            return Err(ExtractionError::engine(self.kind, reason.clone()));
        }

        let text = self
            .variant_text
            .get(&image.kind)
            .or_else(|| self.content_text.get(&hash))
            .cloned()
            .unwrap_or_else(|| self.text.clone());
        let field_confidence = self.fields.keys().map(|f| (*f, self.confidence)).collect();

        Ok(EngineOutput {
            text,
            fields: self.fields.clone(),
            field_confidence,
            document_hint: self.document_hint,
            confidence: self.confidence,
        })
    }
}

/// Mock PDF renderer: each page renders to the bytes it was given.
pub struct MockPdfRenderer {
    pages: Vec<Vec<u8>>,
    encrypted: bool,
}

impl MockPdfRenderer {
    pub fn new(pages: Vec<Vec<u8>>) -> Self {
        Self {
            pages,
            encrypted: false,
        }
    }

    pub fn encrypted() -> Self {
        Self {
            pages: Vec::new(),
            encrypted: true,
        }
    }
}

impl PdfPageRenderer for MockPdfRenderer {
    fn page_count(&self, _pdf_bytes: &[u8]) -> Result<usize, ExtractionError> {
        if self.encrypted {
            return Err(ExtractionError::PdfEncrypted);
        }
        Ok(self.pages.len())
    }

    fn render_page(&self, _pdf_bytes: &[u8], page_number: usize, _dpi: u32) -> Result<Vec<u8>, ExtractionError> {
        if self.encrypted {
            return Err(ExtractionError::PdfEncrypted);
        }
        self.pages
            .get(page_number)
            .cloned()
            .ok_or_else(|| ExtractionError::PdfRendering {
                page: page_number,
                reason: format!("out of range (mock has {} pages)", self.pages.len()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(kind: VariantKind) -> ImageVariant {
        ImageVariant {
            kind,
            bytes: vec![0u8; 4].into(),
            mime_type: "image/png",
        }
    }

    #[tokio::test]
    async fn mock_returns_configured_response() {
        let mock = MockEngine::new(EngineKind::Gemini, "NIK 3201234567890123")
            .with_field(Field::FullName, "BUDI SANTOSO")
            .with_document_hint(DocumentType::IdentityCard);
        let out = mock.recognize(&image(VariantKind::Original), None).await.unwrap();
        assert_eq!(out.text, "NIK 3201234567890123");
        assert_eq!(out.fields.get(&Field::FullName).map(String::as_str), Some("BUDI SANTOSO"));
        assert_eq!(out.document_hint, Some(DocumentType::IdentityCard));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn mock_variant_text_overrides_default() {
        let mock = MockEngine::new(EngineKind::Tesseract, "")
            .with_variant_text(VariantKind::Binarized, "PASPOR B1234567");
        let gray = mock.recognize(&image(VariantKind::Grayscale), None).await.unwrap();
        let bin = mock.recognize(&image(VariantKind::Binarized), None).await.unwrap();
        assert!(gray.text.is_empty());
        assert_eq!(bin.text, "PASPOR B1234567");
    }

    #[test]
    fn mock_pdf_pages_out_of_range() {
        let mock = MockPdfRenderer::new(vec![vec![1], vec![2]]);
        assert_eq!(mock.page_count(&[]).unwrap(), 2);
        assert_eq!(mock.render_page(&[], 1, 200).unwrap(), vec![2]);
        let err = mock.render_page(&[], 2, 200).unwrap_err();
        assert!(matches!(err, ExtractionError::PdfRendering { page: 2, .. }));
    }

    #[tokio::test]
    async fn mock_failure_counts_call() {
        let mock = MockEngine::new(EngineKind::Ollama, "").failing("boom");
        let counter = mock.call_counter();
        let err = mock.recognize(&image(VariantKind::Original), None).await.unwrap_err();
        assert_eq!(err, ExtractionError::engine(EngineKind::Ollama, "boom"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
