//! Offline Tesseract engine. Runs in-process on a blocking thread.
//! Only recognizes when compiled with the `ocr` feature flag.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::types::{EngineOutput, ImageVariant, RecognitionEngine};
use super::ExtractionError;
use crate::models::{DocumentType, EngineCapability, EngineKind};

/// Indonesian first, English for passport/visa labels.
const DEFAULT_LANGUAGES: &str = "ind+eng";

pub struct TesseractEngine {
    tessdata_dir: Option<PathBuf>,
    languages: String,
}

impl TesseractEngine {
    /// `tessdata_dir` must contain `eng.traineddata`; otherwise the engine is unconfigured.
    pub fn new(tessdata_dir: Option<&Path>) -> Self {
        let tessdata_dir = tessdata_dir
            .filter(|dir| dir.join("eng.traineddata").exists())
            .map(Path::to_path_buf);

        let languages = match &tessdata_dir {
            Some(dir) if dir.join("ind.traineddata").exists() => DEFAULT_LANGUAGES.to_string(),
            Some(dir) => {
                tracing::warn!(
                    tessdata = %dir.display(),
                    "Indonesian traineddata not found, using English only"
                );
                "eng".to_string()
            }
            None => "eng".to_string(),
        };

        Self {
            tessdata_dir,
            languages,
        }
    }

    /// Set language(s) for OCR (e.g., "eng", "ind+eng")
    pub fn with_languages(mut self, langs: &str) -> Self {
        self.languages = langs.to_string();
        self
    }
}

#[async_trait]
impl RecognitionEngine for TesseractEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Tesseract
    }

    fn capability(&self) -> EngineCapability {
        EngineCapability::OfflineText
    }

    fn is_configured(&self) -> bool {
        cfg!(feature = "ocr") && self.tessdata_dir.is_some()
    }

    async fn recognize(
        &self,
        image: &ImageVariant,
        _hint: Option<DocumentType>,
    ) -> Result<EngineOutput, ExtractionError> {
        let tessdata_dir = match (&self.tessdata_dir, cfg!(feature = "ocr")) {
            (Some(dir), true) => dir.clone(),
            _ => return Err(ExtractionError::NotConfigured(EngineKind::Tesseract)),
        };
        let bytes = image.bytes.clone();
        let languages = self.languages.clone();

        let (text, confidence) =
            tokio::task::spawn_blocking(move || run_tesseract(&tessdata_dir, &languages, &bytes))
                .await
                .map_err(|e| ExtractionError::engine(EngineKind::Tesseract, format!("worker panicked: {e}")))??;

        Ok(EngineOutput {
            text,
            confidence,
            ..Default::default()
        })
    }
}

#[cfg(feature = "ocr")]
fn run_tesseract(
    tessdata_dir: &Path,
    languages: &str,
    bytes: &[u8],
) -> Result<(String, f32), ExtractionError> {
    let tessdata_str = tessdata_dir
        .to_str()
        .ok_or_else(|| ExtractionError::engine(EngineKind::Tesseract, "invalid tessdata path"))?;

    let tess = tesseract::Tesseract::new(Some(tessdata_str), Some(languages))
        .map_err(|e| ExtractionError::engine(EngineKind::Tesseract, format!("init: {e:?}")))?;

    let mut tess = tess
        .set_image_from_mem(bytes)
        .map_err(|e| ExtractionError::engine(EngineKind::Tesseract, format!("{e:?}")))?;

    let text = tess
        .get_text()
        .map_err(|e| ExtractionError::engine(EngineKind::Tesseract, format!("{e:?}")))?;

    let confidence = tess.mean_text_conf().max(0) as f32 / 100.0;
    Ok((text, confidence))
}

#[cfg(not(feature = "ocr"))]
fn run_tesseract(
    _tessdata_dir: &Path,
    _languages: &str,
    _bytes: &[u8],
) -> Result<(String, f32), ExtractionError> {
    Err(ExtractionError::NotConfigured(EngineKind::Tesseract))
}
