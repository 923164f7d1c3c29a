use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ExtractionError;
use crate::models::{DocumentType, EngineCapability, EngineKind, Field};

/// Which preprocessing transform produced an image variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Original,
    Grayscale,
    ContrastStretched,
    Binarized,
}

/// One candidate image handed to an engine.
#[derive(Debug, Clone)]
pub struct ImageVariant {
    pub kind: VariantKind,
    pub bytes: Arc<[u8]>,
    pub mime_type: &'static str,
}

/// What an engine returns for one image, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub text: String,
    pub fields: BTreeMap<Field, String>,
    pub field_confidence: BTreeMap<Field, f32>,
    pub document_hint: Option<DocumentType>,
    pub confidence: f32,
}

/// Normalized result of one successful engine attempt.
/// Owned by the cache once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub engine: EngineKind,
    pub variant: VariantKind,
    /// Full recognized text.
    pub text: String,
    /// Structured field guesses, when the engine produces them.
    pub fields: BTreeMap<Field, String>,
    pub field_confidence: BTreeMap<Field, f32>,
    pub document_hint: Option<DocumentType>,
    pub confidence: f32,
    pub elapsed_ms: u64,
}

impl ExtractionResult {
    pub fn from_output(
        engine: EngineKind,
        variant: VariantKind,
        output: EngineOutput,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            engine,
            variant,
            text: output.text,
            fields: output.fields,
            field_confidence: output.field_confidence,
            document_hint: output.document_hint,
            confidence: output.confidence.clamp(0.0, 1.0),
            elapsed_ms,
        }
    }

    /// Confidence for one structured field, defaulting to the overall score.
    pub fn confidence_for(&self, field: Field) -> f32 {
        self.field_confidence
            .get(&field)
            .copied()
            .unwrap_or(self.confidence)
    }
}

/// Recognition engine abstraction (allows mocking for tests).
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn capability(&self) -> EngineCapability;

    /// False when credentials or runtime support are missing.
    fn is_configured(&self) -> bool {
        true
    }

    async fn recognize(
        &self,
        image: &ImageVariant,
        hint: Option<DocumentType>,
    ) -> Result<EngineOutput, ExtractionError>;
}

/// Renders pages of a PDF upload to PNG bytes the engines can read.
///
/// Implementations are synchronous; callers run them on the blocking pool.
pub trait PdfPageRenderer: Send + Sync {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError>;

    /// PNG bytes of zero-based `page_number`.
    fn render_page(&self, pdf_bytes: &[u8], page_number: usize, dpi: u32) -> Result<Vec<u8>, ExtractionError>;
}

/// Minimum non-whitespace characters for recognized text to count as usable.
pub const MIN_PLAUSIBLE_CHARS: usize = 10;

pub fn is_plausible_text(text: &str) -> bool {
    text.chars().filter(|c| !c.is_whitespace()).count() >= MIN_PLAUSIBLE_CHARS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_object_safe(_: &dyn RecognitionEngine) {}

    #[test]
    fn engine_trait_is_object_safe() {
        let engine = crate::pipeline::extraction::MockEngine::new(EngineKind::Gemini, "text");
        assert_object_safe(&engine);
    }

    #[test]
    fn plausibility_ignores_whitespace() {
        assert!(!is_plausible_text("   a b c \n d  "));
        assert!(is_plausible_text("NIK 3201234567890123"));
        assert!(!is_plausible_text(""));
    }

    #[test]
    fn field_confidence_falls_back_to_overall() {
        let mut output = EngineOutput {
            text: "x".into(),
            confidence: 0.7,
            ..Default::default()
        };
        output.field_confidence.insert(Field::FullName, 0.95);
        let result =
            ExtractionResult::from_output(EngineKind::Gemini, VariantKind::Original, output, 12);
        assert_eq!(result.confidence_for(Field::FullName), 0.95);
        assert_eq!(result.confidence_for(Field::Address), 0.7);
    }

    #[test]
    fn result_serializes_variant_snake_case() {
        let result = ExtractionResult::from_output(
            EngineKind::Tesseract,
            VariantKind::ContrastStretched,
            EngineOutput::default(),
            0,
        );
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"contrast_stretched\""));
        assert!(json.contains("\"tesseract\""));
    }
}
