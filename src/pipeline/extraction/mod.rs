//! Recognition layer: engine adapters, image preprocessing and the
//! ordered fallback chain that turns document bytes into an `ExtractionResult`.

pub mod types;
pub mod preprocess;
pub mod gemini;
pub mod vision_ocr;
pub mod ocr;
pub mod hybrid;
pub mod fallback;
pub mod mock;
pub mod pdf;

pub use types::*;
pub use preprocess::*;
pub use gemini::GeminiEngine;
pub use vision_ocr::OllamaVisionEngine;
pub use ocr::TesseractEngine;
pub use hybrid::HybridEngine;
pub use fallback::FallbackChain;
pub use mock::{MockEngine, MockPdfRenderer};
#[cfg(feature = "pdf")]
pub use pdf::PdfiumRenderer;

use thiserror::Error;

use crate::models::EngineKind;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("{engine} failed: {reason}")]
    EngineFailure { engine: EngineKind, reason: String },

    #[error("{0} is not configured")]
    NotConfigured(EngineKind),

    #[error("{engine} timed out after {after_ms}ms")]
    Timeout { engine: EngineKind, after_ms: u64 },

    #[error("All recognition engines failed: {}", summarize_attempts(.attempts))]
    AllEnginesExhausted { attempts: Vec<EngineAttempt> },

    #[error("{engine} is over capacity: {reason}")]
    Backpressure { engine: EngineKind, reason: String },

    #[error("Extraction cancelled")]
    Cancelled,

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("PDF page {page} could not be rendered: {reason}")]
    PdfRendering { page: usize, reason: String },

    #[error("PDF is password-protected")]
    PdfEncrypted,
}

impl ExtractionError {
    pub fn engine(engine: EngineKind, reason: impl Into<String>) -> Self {
        Self::EngineFailure {
            engine,
            reason: reason.into(),
        }
    }
}

/// One failed attempt inside an exhausted fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineAttempt {
    pub engine: EngineKind,
    pub error: Box<ExtractionError>,
}

fn summarize_attempts(attempts: &[EngineAttempt]) -> String {
    if attempts.is_empty() {
        return "no engine is configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("[{}] {}", a.engine, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_error_lists_every_attempt() {
        let err = ExtractionError::AllEnginesExhausted {
            attempts: vec![
                EngineAttempt {
                    engine: EngineKind::Gemini,
                    error: Box::new(ExtractionError::engine(EngineKind::Gemini, "HTTP 500")),
                },
                EngineAttempt {
                    engine: EngineKind::Tesseract,
                    error: Box::new(ExtractionError::Timeout {
                        engine: EngineKind::Tesseract,
                        after_ms: 60_000,
                    }),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("[gemini] gemini failed: HTTP 500"), "{msg}");
        assert!(msg.contains("[tesseract] tesseract timed out after 60000ms"), "{msg}");
    }

    #[test]
    fn exhausted_without_attempts_says_nothing_configured() {
        let err = ExtractionError::AllEnginesExhausted { attempts: vec![] };
        assert!(err.to_string().contains("no engine is configured"));
    }
}
