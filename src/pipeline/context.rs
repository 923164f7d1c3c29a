//! Process-wide pipeline handle.
//!
//! Built once at startup and cloned into every session: the extraction
//! cache, per-engine limiters, fallback chain and worker semaphore are shared
//! by all sessions that run through it.

use std::sync::Arc;

use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

use super::cache::{CacheStats, ExtractionCache};
use super::cancel::CancelToken;
use super::extraction::{
    ExtractionError, FallbackChain, GeminiEngine, HybridEngine, InputLimits, OllamaVisionEngine,
    PdfPageRenderer, RecognitionEngine, TesseractEngine,
};
use super::limiter::LimiterRegistry;
use super::progress::{ProgressEvent, ProgressPublisher};
use super::session::{run_session, JobTable, SessionSummary};
use crate::config::PipelineConfig;
use crate::models::{is_pdf, DocumentType, EngineKind, JobState, RawDocument};

/// One document submitted to a session.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub content: Vec<u8>,
    pub type_hint: Option<DocumentType>,
    pub file_name: Option<String>,
}

impl BatchItem {
    pub fn new(content: impl Into<Vec<u8>>, type_hint: Option<DocumentType>) -> Self {
        Self {
            content: content.into(),
            type_hint,
            file_name: None,
        }
    }

    pub fn named(mut self, file_name: &str) -> Self {
        self.file_name = Some(file_name.to_string());
        self
    }
}

struct ContextInner {
    config: PipelineConfig,
    cache: ExtractionCache,
    limiters: Arc<LimiterRegistry>,
    chain: FallbackChain,
    workers: Arc<Semaphore>,
    pdf: Option<Arc<dyn PdfPageRenderer>>,
}

#[derive(Clone)]
pub struct PipelineContext {
    inner: Arc<ContextInner>,
}

impl PipelineContext {
    /// Context over the given engines. They are tried in the configured
    /// fallback order; engines outside that order are never used.
    pub fn new(config: PipelineConfig, engines: Vec<Arc<dyn RecognitionEngine>>) -> Self {
        let limiters = Arc::new(LimiterRegistry::from_config(&config));
        Self::with_limiters(config, engines, limiters, None)
    }

    /// Like `new`, with PDF uploads rendered page by page through `renderer`.
    pub fn with_pdf_renderer(
        config: PipelineConfig,
        engines: Vec<Arc<dyn RecognitionEngine>>,
        renderer: Arc<dyn PdfPageRenderer>,
    ) -> Self {
        let limiters = Arc::new(LimiterRegistry::from_config(&config));
        Self::with_limiters(config, engines, limiters, Some(renderer))
    }

    fn with_limiters(
        config: PipelineConfig,
        engines: Vec<Arc<dyn RecognitionEngine>>,
        limiters: Arc<LimiterRegistry>,
        pdf: Option<Arc<dyn PdfPageRenderer>>,
    ) -> Self {
        let ordered: Vec<Arc<dyn RecognitionEngine>> = config
            .fallback_order()
            .into_iter()
            .filter_map(|kind| engines.iter().find(|e| e.kind() == kind).cloned())
            .collect();

        let chain = FallbackChain::new(ordered, Arc::clone(&limiters), &config);
        tracing::info!(
            order = ?chain.order(),
            configured = ?chain.configured(),
            fallback_enabled = config.fallback_enabled,
            pdf = pdf.is_some(),
            "Pipeline context ready"
        );

        Self {
            inner: Arc::new(ContextInner {
                cache: ExtractionCache::new(config.cache.clone()),
                workers: Arc::new(Semaphore::new(config.worker_concurrency.max(1))),
                limiters,
                chain,
                config,
                pdf,
            }),
        }
    }

    /// Context with the real engines, configured from credentials in `config`.
    pub fn from_config(config: PipelineConfig) -> Result<Self, ExtractionError> {
        let creds = &config.credentials;
        let gemini: Arc<dyn RecognitionEngine> = Arc::new(GeminiEngine::new(
            creds.gemini_api_key.clone(),
            &creds.gemini_model,
            config.limits_for(EngineKind::Gemini).timeout,
        )?);
        let ollama: Arc<dyn RecognitionEngine> = Arc::new(OllamaVisionEngine::new(
            creds.ollama_url.as_deref(),
            &creds.ollama_model,
            config.limits_for(EngineKind::Ollama).timeout,
        )?);
        let tesseract: Arc<dyn RecognitionEngine> =
            Arc::new(TesseractEngine::new(creds.tessdata_dir.as_deref()));

        let vision = if gemini.is_configured() {
            Arc::clone(&gemini)
        } else {
            Arc::clone(&ollama)
        };
        let limiters = Arc::new(LimiterRegistry::from_config(&config));
        let hybrid: Arc<dyn RecognitionEngine> = Arc::new(
            HybridEngine::new(Arc::clone(&tesseract), vision, InputLimits::from_config(&config))
                .with_limiters(Arc::clone(&limiters)),
        );

        Ok(Self::with_limiters(
            config,
            vec![gemini, ollama, hybrid, tesseract],
            limiters,
            pdf_renderer(),
        ))
    }

    pub fn pdf_renderer(&self) -> Option<&Arc<dyn PdfPageRenderer>> {
        self.inner.pdf.as_ref()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &ExtractionCache {
        &self.inner.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn limiters(&self) -> &LimiterRegistry {
        &self.inner.limiters
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.inner.chain
    }

    pub(crate) fn workers(&self) -> Arc<Semaphore> {
        Arc::clone(&self.inner.workers)
    }

    /// Drop cached results, zero cache counters and refill rate limits.
    pub async fn reset(&self) {
        self.inner.cache.reset();
        self.inner.limiters.reset().await;
        tracing::debug!("Pipeline context reset");
    }

    /// Submit a batch. Jobs start immediately; the returned handle streams
    /// progress and yields the summary once every job is terminal.
    pub fn start_session(&self, batch: Vec<BatchItem>) -> Result<SessionHandle, ExtractionError> {
        let max = self.inner.config.max_files_per_session;
        if batch.len() > max {
            return Err(ExtractionError::InvalidInput(format!(
                "{} documents exceed the limit of {max} per session",
                batch.len()
            )));
        }

        let session_id = Uuid::new_v4();
        let documents: Vec<RawDocument> = batch
            .into_iter()
            .flat_map(|item| self.documents_for(item, session_id))
            .collect();

        let table = JobTable::new(documents.len());
        let (publisher, events) = ProgressPublisher::new(session_id, documents.len());
        let publisher = Arc::new(publisher);
        let cancel = CancelToken::new();
        let task = tokio::spawn(run_session(
            self.clone(),
            session_id,
            documents,
            table.clone(),
            Arc::clone(&publisher),
            cancel.clone(),
        ));

        Ok(SessionHandle {
            session_id,
            events,
            table,
            publisher,
            cancel,
            task,
        })
    }
}

impl PipelineContext {
    /// One document per image upload; one per page for a PDF.
    ///
    /// A PDF whose pages cannot be counted becomes a single page-0 document,
    /// so the job reports the rendering error.
    fn documents_for(&self, item: BatchItem, session_id: Uuid) -> Vec<RawDocument> {
        if !is_pdf(&item.content) {
            let doc = RawDocument::new(item.content, item.type_hint, session_id);
            return vec![match &item.file_name {
                Some(name) => doc.with_file_name(name),
                None => doc,
            }];
        }

        let pdf: Arc<[u8]> = item.content.into();
        let max_pages = self.inner.config.max_pdf_pages.max(1);
        let pages = match self.inner.pdf.as_ref().map(|r| r.page_count(&pdf)) {
            Some(Ok(0)) | None => 1,
            Some(Ok(count)) if count > max_pages => {
                tracing::warn!(pages = count, max_pages, "PDF truncated to page limit");
                max_pages
            }
            Some(Ok(count)) => count,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "PDF page count failed");
                1
            }
        };

        (0..pages)
            .map(|page| {
                let doc = RawDocument::pdf_page(Arc::clone(&pdf), page, item.type_hint, session_id);
                match &item.file_name {
                    Some(name) => doc.with_file_name(&format!("{name}_page{}", page + 1)),
                    None => doc,
                }
            })
            .collect()
    }
}

/// PDFium when built with the `pdf` feature and the library loads.
fn pdf_renderer() -> Option<Arc<dyn PdfPageRenderer>> {
    #[cfg(feature = "pdf")]
    {
        match super::extraction::PdfiumRenderer::new() {
            Ok(renderer) => return Some(Arc::new(renderer)),
            Err(e) => tracing::warn!(error = %e, "PDF input disabled"),
        }
    }
    None
}

/// Handle to a running session.
pub struct SessionHandle {
    pub session_id: Uuid,
    /// Receiver subscribed before the first job started.
    pub events: broadcast::Receiver<ProgressEvent>,
    table: JobTable,
    publisher: Arc<ProgressPublisher>,
    cancel: CancelToken,
    task: JoinHandle<SessionSummary>,
}

impl SessionHandle {
    /// Receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.publisher.subscribe()
    }

    /// Current state of every job, in submission order.
    pub fn jobs(&self) -> Vec<(Uuid, JobState)> {
        self.table.snapshot()
    }

    /// Stop dispatching new jobs and abandon in-flight engine calls.
    pub fn cancel(&self) {
        tracing::info!(session_id = %self.session_id, "Session cancel requested");
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<SessionSummary, JoinError> {
        self.task.await
    }
}
