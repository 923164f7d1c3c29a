//! Hybrid engine: cheap offline recognition first, vision engine only when
//! every offline candidate comes back implausible.

use std::sync::Arc;

use async_trait::async_trait;

use super::preprocess::{variants_for, InputLimits};
use super::types::{is_plausible_text, EngineOutput, ImageVariant, RecognitionEngine};
use super::ExtractionError;
use crate::models::{DocumentType, EngineCapability, EngineKind};
use crate::pipeline::limiter::LimiterRegistry;

pub struct HybridEngine {
    offline: Arc<dyn RecognitionEngine>,
    vision: Arc<dyn RecognitionEngine>,
    input_limits: InputLimits,
    /// Limits of the wrapped engines; each inner call holds that engine's permit.
    limiters: Option<Arc<LimiterRegistry>>,
}

impl HybridEngine {
    pub fn new(
        offline: Arc<dyn RecognitionEngine>,
        vision: Arc<dyn RecognitionEngine>,
        input_limits: InputLimits,
    ) -> Self {
        Self {
            offline,
            vision,
            input_limits,
            limiters: None,
        }
    }

    pub fn with_limiters(mut self, limiters: Arc<LimiterRegistry>) -> Self {
        self.limiters = Some(limiters);
        self
    }

    /// One call to a wrapped engine under that engine's limiter.
    async fn limited(
        &self,
        engine: &dyn RecognitionEngine,
        image: &ImageVariant,
        hint: Option<DocumentType>,
    ) -> Result<EngineOutput, ExtractionError> {
        let _permit = match self.limiters.as_ref().and_then(|l| l.get(engine.kind())) {
            Some(limiter) => Some(limiter.acquire().await?),
            None => None,
        };
        engine.recognize(image, hint).await
    }
}

#[async_trait]
impl RecognitionEngine for HybridEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Hybrid
    }

    /// Receives the raw image; preprocessing for the offline half happens here.
    fn capability(&self) -> EngineCapability {
        EngineCapability::Vision
    }

    fn is_configured(&self) -> bool {
        self.offline.is_configured() && self.vision.is_configured()
    }

    async fn recognize(
        &self,
        image: &ImageVariant,
        hint: Option<DocumentType>,
    ) -> Result<EngineOutput, ExtractionError> {
        if !self.is_configured() {
            return Err(ExtractionError::NotConfigured(EngineKind::Hybrid));
        }

        let candidates = variants_for(EngineCapability::OfflineText, &image.bytes, self.input_limits)?;
        for variant in &candidates {
            match self.limited(self.offline.as_ref(), variant, hint).await {
                Ok(output) if is_plausible_text(&output.text) => {
                    tracing::debug!(variant = ?variant.kind, "Hybrid: offline text accepted");
                    return Ok(output);
                }
                Ok(_) => {
                    tracing::debug!(variant = ?variant.kind, "Hybrid: offline text implausible");
                }
                Err(e) => {
                    tracing::debug!(variant = ?variant.kind, error = %e, "Hybrid: offline attempt failed");
                }
            }
        }

        tracing::info!(
            vision = %self.vision.kind(),
            "Hybrid: offline recognition exhausted, delegating to vision engine"
        );
        match self.limited(self.vision.as_ref(), image, hint).await {
            Ok(output) => Ok(output),
            Err(e @ ExtractionError::Backpressure { .. }) => Err(e),
            Err(e) => Err(ExtractionError::engine(
                EngineKind::Hybrid,
                format!("vision stage: {e}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineLimits, PipelineConfig};
    use crate::pipeline::extraction::{MockEngine, VariantKind};
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;

    const MAX: InputLimits = InputLimits {
        max_bytes: 10 * 1024 * 1024,
        max_dimension: 12_000,
    };

    fn png() -> ImageVariant {
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 200])))
            .write_to(&mut cursor, ImageOutputFormat::Png)
            .unwrap();
        ImageVariant {
            kind: VariantKind::Original,
            bytes: cursor.into_inner().into(),
            mime_type: "image/png",
        }
    }

    #[tokio::test]
    async fn plausible_offline_text_skips_vision() {
        let offline = MockEngine::new(EngineKind::Tesseract, "NIK : 3201234567890123")
            .with_capability(EngineCapability::OfflineText);
        let vision = MockEngine::new(EngineKind::Gemini, "vision text");
        let vision_calls = vision.call_counter();
        let hybrid = HybridEngine::new(Arc::new(offline), Arc::new(vision), MAX);

        let out = hybrid.recognize(&png(), None).await.unwrap();
        assert_eq!(out.text, "NIK : 3201234567890123");
        assert_eq!(vision_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn later_variant_can_rescue_offline() {
        let offline = MockEngine::new(EngineKind::Tesseract, "")
            .with_variant_text(VariantKind::Binarized, "PASPOR NO B1234567");
        let offline_calls = offline.call_counter();
        let vision = MockEngine::new(EngineKind::Gemini, "vision text");
        let hybrid = HybridEngine::new(Arc::new(offline), Arc::new(vision), MAX);

        let out = hybrid.recognize(&png(), None).await.unwrap();
        assert_eq!(out.text, "PASPOR NO B1234567");
        assert_eq!(offline_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn implausible_offline_delegates_to_vision() {
        let offline = MockEngine::new(EngineKind::Tesseract, "~ ~");
        let vision = MockEngine::new(EngineKind::Gemini, "REPUBLIK INDONESIA PASPOR");
        let hybrid = HybridEngine::new(Arc::new(offline), Arc::new(vision), MAX);

        let out = hybrid.recognize(&png(), None).await.unwrap();
        assert_eq!(out.text, "REPUBLIK INDONESIA PASPOR");
    }

    #[tokio::test]
    async fn vision_stage_respects_vision_limits() {
        let mut config = PipelineConfig::default();
        config.limits.insert(
            EngineKind::Gemini,
            EngineLimits {
                max_concurrent: 1,
                queue_depth: 0,
                ..EngineLimits::for_engine(EngineKind::Gemini)
            },
        );
        let limiters = Arc::new(LimiterRegistry::from_config(&config));
        let gemini = limiters.get(EngineKind::Gemini).unwrap();
        let held = gemini.acquire().await.unwrap();

        let offline = MockEngine::new(EngineKind::Tesseract, "~ ~");
        let vision = MockEngine::new(EngineKind::Gemini, "REPUBLIK INDONESIA PASPOR");
        let vision_calls = vision.call_counter();
        let hybrid = HybridEngine::new(Arc::new(offline), Arc::new(vision), MAX)
            .with_limiters(Arc::clone(&limiters));

        let err = hybrid.recognize(&png(), None).await.unwrap_err();
        assert!(
            matches!(err, ExtractionError::Backpressure { engine: EngineKind::Gemini, .. }),
            "{err:?}"
        );
        assert_eq!(vision_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        drop(held);
        let out = hybrid.recognize(&png(), None).await.unwrap();
        assert_eq!(out.text, "REPUBLIK INDONESIA PASPOR");
        assert_eq!(gemini.in_flight(1), 0);
    }

    #[tokio::test]
    async fn unconfigured_half_disables_hybrid() {
        let offline = MockEngine::new(EngineKind::Tesseract, "x").unconfigured();
        let vision = MockEngine::new(EngineKind::Gemini, "y");
        let hybrid = HybridEngine::new(Arc::new(offline), Arc::new(vision), MAX);
        assert!(!hybrid.is_configured());
        let err = hybrid.recognize(&png(), None).await.unwrap_err();
        assert_eq!(err, ExtractionError::NotConfigured(EngineKind::Hybrid));
    }
}
