//! Ordered engine fallback: try each configured engine in priority order
//! until one returns usable output.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Instrument;

use super::preprocess::{variants_for, InputLimits};
use super::types::{is_plausible_text, EngineOutput, ExtractionResult, RecognitionEngine};
use super::{EngineAttempt, ExtractionError};
use crate::config::PipelineConfig;
use crate::models::{DocumentType, EngineKind};
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::limiter::LimiterRegistry;

pub struct FallbackChain {
    engines: Vec<Arc<dyn RecognitionEngine>>,
    limiters: Arc<LimiterRegistry>,
    timeouts: BTreeMap<EngineKind, Duration>,
    fallback_enabled: bool,
    input_limits: InputLimits,
}

impl FallbackChain {
    /// `engines` are tried in the given order.
    pub fn new(
        engines: Vec<Arc<dyn RecognitionEngine>>,
        limiters: Arc<LimiterRegistry>,
        config: &PipelineConfig,
    ) -> Self {
        let timeouts = engines
            .iter()
            .map(|e| (e.kind(), config.limits_for(e.kind()).timeout))
            .collect();
        Self {
            engines,
            limiters,
            timeouts,
            fallback_enabled: config.fallback_enabled,
            input_limits: InputLimits::from_config(config),
        }
    }

    /// Engines in try order, configured or not.
    pub fn order(&self) -> Vec<EngineKind> {
        self.engines.iter().map(|e| e.kind()).collect()
    }

    pub fn configured(&self) -> Vec<EngineKind> {
        self.engines
            .iter()
            .filter(|e| e.is_configured())
            .map(|e| e.kind())
            .collect()
    }

    /// First engine an extraction actually reaches.
    pub fn entry_engine(&self) -> Option<EngineKind> {
        self.engines.iter().find(|e| e.is_configured()).map(|e| e.kind())
    }

    /// Run the chain for one document image.
    ///
    /// Input problems fail immediately with `InvalidInput`; engine problems
    /// are collected into `AllEnginesExhausted` once nothing is left to try.
    pub async fn extract(
        &self,
        bytes: &Arc<[u8]>,
        hint: Option<DocumentType>,
        cancel: &CancelToken,
    ) -> Result<ExtractionResult, ExtractionError> {
        self.input_limits.check(bytes)?;

        let mut attempts = Vec::new();
        for engine in &self.engines {
            let kind = engine.kind();
            if cancel.is_cancelled() {
                return Err(ExtractionError::Cancelled);
            }
            if !engine.is_configured() {
                tracing::debug!(engine = %kind, "Engine not configured, skipping");
                continue;
            }

            let timeout = self
                .timeouts
                .get(&kind)
                .copied()
                .unwrap_or(Duration::from_secs(60));
            let span = tracing::info_span!("engine_attempt", engine = %kind);
            let attempt = tokio::time::timeout(timeout, self.attempt(engine.as_ref(), bytes, hint))
                .instrument(span);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ExtractionError::Cancelled),
                res = attempt => res.unwrap_or(Err(ExtractionError::Timeout {
                    engine: kind,
                    after_ms: timeout.as_millis() as u64,
                })),
            };

            match outcome {
                Ok(result) => {
                    tracing::info!(
                        engine = %kind,
                        variant = ?result.variant,
                        elapsed_ms = result.elapsed_ms,
                        confidence = result.confidence,
                        prior_failures = attempts.len(),
                        "Extraction succeeded"
                    );
                    return Ok(result);
                }
                Err(ExtractionError::Cancelled) => return Err(ExtractionError::Cancelled),
                Err(e) => {
                    tracing::warn!(engine = %kind, error = %e, "Engine attempt failed");
                    attempts.push(EngineAttempt {
                        engine: kind,
                        error: Box::new(e),
                    });
                    if !self.fallback_enabled {
                        break;
                    }
                }
            }
        }

        Err(ExtractionError::AllEnginesExhausted { attempts })
    }

    /// One engine, every variant its capability calls for, stopping at the
    /// first usable output. Each engine call holds its own limiter permit.
    async fn attempt(
        &self,
        engine: &dyn RecognitionEngine,
        bytes: &Arc<[u8]>,
        hint: Option<DocumentType>,
    ) -> Result<ExtractionResult, ExtractionError> {
        let kind = engine.kind();
        let started = Instant::now();
        let variants = variants_for(engine.capability(), bytes, self.input_limits)?;
        let limiter = self.limiters.get(kind);

        let mut last_error = None;
        for variant in &variants {
            let _permit = match &limiter {
                Some(limiter) => Some(limiter.acquire().await?),
                None => None,
            };

            match engine.recognize(variant, hint).await {
                Ok(output) if is_usable(&output) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    return Ok(ExtractionResult::from_output(kind, variant.kind, output, elapsed_ms));
                }
                Ok(output) => {
                    tracing::debug!(
                        engine = %kind,
                        variant = ?variant.kind,
                        chars = output.text.len(),
                        "Output not plausible, trying next variant"
                    );
                    last_error = Some(ExtractionError::engine(
                        kind,
                        format!("no plausible text ({} variant(s) tried)", variants.len()),
                    ));
                }
                Err(e) => {
                    tracing::debug!(engine = %kind, variant = ?variant.kind, error = %e, "Variant failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ExtractionError::engine(kind, "no image variants")))
    }
}

/// Plausible text, or at least one structured field.
fn is_usable(output: &EngineOutput) -> bool {
    is_plausible_text(&output.text) || !output.fields.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineCapability, Field};
    use crate::pipeline::extraction::{MockEngine, VariantKind};
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::Ordering;

    fn png() -> Arc<[u8]> {
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 90])))
            .write_to(&mut cursor, ImageOutputFormat::Png)
            .unwrap();
        cursor.into_inner().into()
    }

    fn chain(engines: Vec<MockEngine>, config: PipelineConfig) -> FallbackChain {
        let limiters = Arc::new(LimiterRegistry::from_config(&config));
        let engines = engines
            .into_iter()
            .map(|e| Arc::new(e) as Arc<dyn RecognitionEngine>)
            .collect();
        FallbackChain::new(engines, limiters, &config)
    }

    const PASSPORT_TEXT: &str = "REPUBLIK INDONESIA PASPOR B1234567";

    #[tokio::test]
    async fn primary_success_skips_rest() {
        let secondary = MockEngine::new(EngineKind::Ollama, PASSPORT_TEXT);
        let secondary_calls = secondary.call_counter();
        let chain = chain(
            vec![MockEngine::new(EngineKind::Gemini, PASSPORT_TEXT), secondary],
            PipelineConfig::default(),
        );

        let result = chain.extract(&png(), None, &CancelToken::new()).await.unwrap();
        assert_eq!(result.engine, EngineKind::Gemini);
        assert_eq!(result.variant, VariantKind::Original);
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_falls_through_to_next_engine() {
        let chain = chain(
            vec![
                MockEngine::new(EngineKind::Gemini, "").failing("HTTP 500"),
                MockEngine::new(EngineKind::Ollama, PASSPORT_TEXT),
            ],
            PipelineConfig::default(),
        );

        let result = chain.extract(&png(), None, &CancelToken::new()).await.unwrap();
        assert_eq!(result.engine, EngineKind::Ollama);
        assert_eq!(result.text, PASSPORT_TEXT);
    }

    #[tokio::test]
    async fn unconfigured_engines_are_skipped() {
        let skipped = MockEngine::new(EngineKind::Gemini, PASSPORT_TEXT).unconfigured();
        let skipped_calls = skipped.call_counter();
        let chain = chain(
            vec![skipped, MockEngine::new(EngineKind::Tesseract, PASSPORT_TEXT)],
            PipelineConfig::default(),
        );
        assert_eq!(chain.configured(), vec![EngineKind::Tesseract]);
        assert_eq!(chain.entry_engine(), Some(EngineKind::Tesseract));

        let result = chain.extract(&png(), None, &CancelToken::new()).await.unwrap();
        assert_eq!(result.engine, EngineKind::Tesseract);
        assert_eq!(skipped_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhaustion_carries_every_attempt() {
        let chain = chain(
            vec![
                MockEngine::new(EngineKind::Gemini, "").failing("quota"),
                MockEngine::new(EngineKind::Ollama, "").failing("connection refused"),
            ],
            PipelineConfig::default(),
        );

        let err = chain.extract(&png(), None, &CancelToken::new()).await.unwrap_err();
        match err {
            ExtractionError::AllEnginesExhausted { attempts } => {
                let engines: Vec<_> = attempts.iter().map(|a| a.engine).collect();
                assert_eq!(engines, vec![EngineKind::Gemini, EngineKind::Ollama]);
                assert_eq!(*attempts[1].error, ExtractionError::engine(EngineKind::Ollama, "connection refused"));
            }
            other => panic!("expected AllEnginesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_fallback_stops_after_first_failure() {
        let secondary = MockEngine::new(EngineKind::Ollama, PASSPORT_TEXT);
        let secondary_calls = secondary.call_counter();
        let config = PipelineConfig {
            fallback_enabled: false,
            ..PipelineConfig::default()
        };
        let chain = chain(
            vec![MockEngine::new(EngineKind::Gemini, "").failing("boom"), secondary],
            config,
        );

        let err = chain.extract(&png(), None, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::AllEnginesExhausted { ref attempts } if attempts.len() == 1));
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_engine_times_out_and_falls_through() {
        let mut config = PipelineConfig::default();
        let mut limits = config.limits_for(EngineKind::Gemini);
        limits.timeout = Duration::from_secs(2);
        config.limits.insert(EngineKind::Gemini, limits);

        let chain = chain(
            vec![
                MockEngine::new(EngineKind::Gemini, PASSPORT_TEXT).with_delay(Duration::from_secs(10)),
                MockEngine::new(EngineKind::Ollama, PASSPORT_TEXT),
            ],
            config,
        );

        let result = chain.extract(&png(), None, &CancelToken::new()).await.unwrap();
        assert_eq!(result.engine, EngineKind::Ollama);
    }

    #[tokio::test]
    async fn offline_engine_tries_variants_until_plausible() {
        let offline = MockEngine::new(EngineKind::Tesseract, "..")
            .with_capability(EngineCapability::OfflineText)
            .with_variant_text(VariantKind::ContrastStretched, PASSPORT_TEXT);
        let calls = offline.call_counter();
        let chain = chain(vec![offline], PipelineConfig::default());

        let result = chain.extract(&png(), None, &CancelToken::new()).await.unwrap();
        assert_eq!(result.variant, VariantKind::ContrastStretched);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn implausible_output_is_a_failed_attempt() {
        let chain = chain(
            vec![MockEngine::new(EngineKind::Gemini, "  ..  ")],
            PipelineConfig::default(),
        );
        let err = chain.extract(&png(), None, &CancelToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no plausible text"), "{err}");
    }

    #[tokio::test]
    async fn structured_fields_count_as_usable() {
        let chain = chain(
            vec![MockEngine::new(EngineKind::Gemini, "").with_field(Field::FullName, "BUDI SANTOSO")],
            PipelineConfig::default(),
        );
        let result = chain.extract(&png(), None, &CancelToken::new()).await.unwrap();
        assert_eq!(result.fields.get(&Field::FullName).map(String::as_str), Some("BUDI SANTOSO"));
    }

    #[tokio::test]
    async fn invalid_input_fails_before_any_engine() {
        let engine = MockEngine::new(EngineKind::Gemini, PASSPORT_TEXT);
        let calls = engine.call_counter();
        let chain = chain(vec![engine], PipelineConfig::default());

        let tiny: Arc<[u8]> = vec![1u8; 10].into();
        let err = chain.extract(&tiny, None, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidInput(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_dimensions_fail_before_any_engine() {
        let engine = MockEngine::new(EngineKind::Gemini, PASSPORT_TEXT);
        let calls = engine.call_counter();
        let config = PipelineConfig {
            max_image_dimension: 32,
            ..PipelineConfig::default()
        };
        let chain = chain(vec![engine], config);

        let err = chain.extract(&png(), None, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::ImageProcessing(_)), "{err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_in_flight_call() {
        let chain = Arc::new(chain(
            vec![MockEngine::new(EngineKind::Gemini, PASSPORT_TEXT).with_delay(Duration::from_secs(30))],
            PipelineConfig::default(),
        ));
        let cancel = CancelToken::new();

        let task = {
            let chain = chain.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { chain.extract(&png(), None, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap().unwrap_err(), ExtractionError::Cancelled);
    }

    #[tokio::test]
    async fn nothing_configured_is_exhausted_with_no_attempts() {
        let chain = chain(
            vec![MockEngine::new(EngineKind::Gemini, PASSPORT_TEXT).unconfigured()],
            PipelineConfig::default(),
        );
        let err = chain.extract(&png(), None, &CancelToken::new()).await.unwrap_err();
        assert_eq!(err, ExtractionError::AllEnginesExhausted { attempts: vec![] });
    }
}
