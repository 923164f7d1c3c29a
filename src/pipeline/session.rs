//! One processing session: a batch of documents run as parallel jobs,
//! joined at a barrier, then merged into canonical profiles.
//!
//! ```text
//! documents ──► job tasks (worker semaphore) ──► JoinSet barrier ──► merge ──► summary
//!                   │ cache ─► fallback chain ─► parse ─► clean ─► validate
//!                   └─► JobStarted / JobCompleted events
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::cache::CacheStats;
use super::cancel::CancelToken;
use super::cleaning::clean_record;
use super::context::PipelineContext;
use super::extraction::pdf::RENDER_DPI;
use super::extraction::ExtractionError;
use super::merge::merge;
use super::parsing::parse_extraction;
use super::progress::{ProgressEvent, ProgressPublisher};
use super::validation::validate;
use crate::models::{
    CanonicalProfile, DocumentType, EngineKind, Field, IssueCode, JobState, RawDocument,
    SessionStatus, ValidatedRecord, ValidationIssue,
};

#[derive(Error, Debug, Clone)]
pub enum JobError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("No identity field could be read from the document")]
    NoUsableData,

    #[error("Job cancelled")]
    Cancelled,

    #[error("Job aborted: {0}")]
    Aborted(String),
}

/// Terminal state of one job, in submission order within the summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub file_name: Option<String>,
    pub content_hash: String,
    pub state: JobState,
    pub document_type: Option<DocumentType>,
    pub record_id: Option<Uuid>,
    pub engine: Option<EngineKind>,
    pub cached: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub jobs: Vec<JobOutcome>,
    pub records: Vec<ValidatedRecord>,
    pub profiles: Vec<CanonicalProfile>,
    /// Every record's issues followed by merge conflicts.
    pub issues: Vec<ValidationIssue>,
    pub cache: CacheStats,
    pub elapsed_ms: u64,
}

impl SessionSummary {
    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobOutcome> {
        self.jobs.iter().filter(|j| j.state == JobState::Failed)
    }

    pub fn succeeded(&self) -> usize {
        self.jobs.iter().filter(|j| j.state == JobState::Done).count()
    }
}

/// Session status from job outcomes: failed only when nothing succeeded.
pub fn session_status(jobs: &[JobOutcome]) -> SessionStatus {
    let done = jobs.iter().filter(|j| j.state == JobState::Done).count();
    match (done, jobs.len() - done) {
        (_, 0) => SessionStatus::Completed,
        (0, _) => SessionStatus::Failed,
        _ => SessionStatus::CompletedWithPartialFailures,
    }
}

/// Live job states of one session, shared between its tasks and its handle.
#[derive(Clone)]
pub struct JobTable {
    jobs: Arc<Mutex<Vec<(Uuid, JobState)>>>,
}

impl JobTable {
    /// `count` queued jobs with fresh ids.
    pub fn new(count: usize) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(
                (0..count).map(|_| (Uuid::new_v4(), JobState::Queued)).collect(),
            )),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Uuid, JobState)>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Vec<(Uuid, JobState)> {
        self.lock().clone()
    }

    pub fn state(&self, index: usize) -> Option<JobState> {
        self.lock().get(index).map(|(_, state)| *state)
    }

    fn job_id(&self, index: usize) -> Option<Uuid> {
        self.lock().get(index).map(|(id, _)| *id)
    }

    /// Terminal states are final.
    fn set(&self, index: usize, state: JobState) {
        if let Some(entry) = self.lock().get_mut(index) {
            if !entry.1.is_terminal() {
                entry.1 = state;
            }
        }
    }
}

struct JobSuccess {
    record: ValidatedRecord,
    engine: EngineKind,
    cached: bool,
}

// ═══════════════════════════════════════════════════════════
// Session
// ═══════════════════════════════════════════════════════════

pub(crate) async fn run_session(
    ctx: PipelineContext,
    session_id: Uuid,
    documents: Vec<RawDocument>,
    table: JobTable,
    publisher: Arc<ProgressPublisher>,
    cancel: CancelToken,
) -> SessionSummary {
    let span = tracing::info_span!("session", session_id = %session_id, jobs = documents.len());
    async move {
        let started = Instant::now();
        tracing::info!("Session started");

        let mut outcomes: Vec<JobOutcome> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| JobOutcome {
                job_id: table.job_id(index).unwrap_or_else(Uuid::new_v4),
                file_name: doc.file_name.clone(),
                content_hash: doc.content_hash.clone(),
                state: JobState::Queued,
                document_type: None,
                record_id: None,
                engine: None,
                cached: false,
                error: None,
                elapsed_ms: 0,
            })
            .collect();

        let mut jobs = JoinSet::new();
        let mut task_index = HashMap::new();
        for (index, doc) in documents.into_iter().enumerate() {
            let job_id = outcomes[index].job_id;
            let ctx = ctx.clone();
            let table = table.clone();
            let publisher = Arc::clone(&publisher);
            let cancel = cancel.clone();
            let span = tracing::info_span!("job", job_id = %job_id);
            let handle = jobs.spawn(
                async move {
                    let started = Instant::now();
                    let result = run_job(&ctx, &table, &publisher, index, job_id, &doc, &cancel).await;
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    (index, result, elapsed_ms)
                }
                .instrument(span),
            );
            task_index.insert(handle.id(), index);
        }

        // Barrier: every job reaches a terminal state before merging.
        let mut records = Vec::new();
        while let Some(joined) = jobs.join_next_with_id().await {
            let (index, result, elapsed_ms) = match joined {
                Ok((_, done)) => done,
                Err(e) => {
                    tracing::error!(error = %e, "Job task aborted");
                    let Some(index) = task_index.get(&e.id()).copied() else {
                        continue;
                    };
                    let reason = if e.is_cancelled() {
                        "job task aborted".to_string()
                    } else {
                        "job task panicked".to_string()
                    };
                    (index, Err(JobError::Aborted(reason)), 0)
                }
            };
            let outcome = &mut outcomes[index];
            outcome.elapsed_ms = elapsed_ms;
            match result {
                Ok(success) => {
                    outcome.state = JobState::Done;
                    outcome.document_type = Some(success.record.record.document_type);
                    outcome.record_id = Some(success.record.record.record_id);
                    outcome.engine = Some(success.engine);
                    outcome.cached = success.cached;
                    table.set(index, JobState::Done);
                    publisher.publish(ProgressEvent::JobCompleted {
                        session_id,
                        job_id: outcome.job_id,
                        status: JobState::Done,
                        document_type: outcome.document_type,
                        partial_fields: Some(field_values(&success.record)),
                        error: None,
                        cached: success.cached,
                        elapsed_ms,
                    });
                    records.push(success.record);
                }
                Err(e) => {
                    tracing::warn!(job_id = %outcome.job_id, error = %e, "Job failed");
                    outcome.state = JobState::Failed;
                    outcome.error = Some(e.to_string());
                    table.set(index, JobState::Failed);
                    publisher.publish(ProgressEvent::JobCompleted {
                        session_id,
                        job_id: outcome.job_id,
                        status: JobState::Failed,
                        document_type: None,
                        partial_fields: None,
                        error: outcome.error.clone(),
                        cached: false,
                        elapsed_ms,
                    });
                }
            }
        }

        for (index, outcome) in outcomes.iter_mut().enumerate().filter(|(_, o)| !o.state.is_terminal()) {
            outcome.state = JobState::Failed;
            outcome.error = Some("job task lost".to_string());
            table.set(index, JobState::Failed);
        }

        // Submission order keeps profile input deterministic for callers.
        records.sort_by_key(|r| {
            outcomes
                .iter()
                .position(|o| o.record_id == Some(r.record.record_id))
                .unwrap_or(usize::MAX)
        });

        let profiles = merge(&records, &ctx.config().merge);
        let mut issues: Vec<ValidationIssue> = records.iter().flat_map(|r| r.issues.iter().cloned()).collect();
        issues.extend(
            profiles
                .iter()
                .flat_map(|p| p.issues.iter())
                .filter(|i| i.code == IssueCode::MergeConflict)
                .cloned(),
        );

        let summary = SessionSummary {
            session_id,
            status: session_status(&outcomes),
            jobs: outcomes,
            records,
            profiles,
            issues,
            cache: ctx.cache().stats(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            status = %summary.status,
            succeeded = summary.succeeded(),
            failed = summary.failed_jobs().count(),
            profiles = summary.profiles.len(),
            elapsed_ms = summary.elapsed_ms,
            "Session complete"
        );
        publisher.publish(ProgressEvent::SessionComplete {
            summary: Box::new(summary.clone()),
        });
        summary
    }
    .instrument(span)
    .await
}

// ═══════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════

async fn run_job(
    ctx: &PipelineContext,
    table: &JobTable,
    publisher: &ProgressPublisher,
    index: usize,
    job_id: Uuid,
    doc: &RawDocument,
    cancel: &CancelToken,
) -> Result<JobSuccess, JobError> {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(JobError::Cancelled),
        permit = ctx.workers().acquire_owned() => permit.map_err(|_| JobError::Cancelled)?,
    };

    table.set(index, JobState::Processing);

    publisher.publish(ProgressEvent::JobStarted {
        session_id: publisher.session_id(),
        job_id,
        file_name: doc.file_name.clone(),
    });

    let cache = ctx.cache();
    // The key is fixed before any engine runs, so an engine-scoped key names
    // the chain's entry engine rather than whichever engine produced the text.
    let scope = ctx.chain().entry_engine().unwrap_or(ctx.config().primary_engine);
    let key = cache.key_for(&doc.content_hash, scope);
    let mut computed = false;
    let extracted = cache
        .get_or_extract(key, || {
            computed = true;
            async move {
                let image = document_image(ctx, doc).await?;
                ctx.chain().extract(&image, doc.type_hint, cancel).await
            }
        })
        .await;
    let result = match extracted {
        Ok(result) => result,
        Err(ExtractionError::Cancelled) => return Err(JobError::Cancelled),
        Err(e) => return Err(e.into()),
    };
    if !computed {
        tracing::debug!(hash = %doc.content_hash, "Extraction served from cache");
    }

    let record = clean_record(parse_extraction(&result, doc.type_hint, job_id, &doc.content_hash));
    if !record.has_identity() {
        return Err(JobError::NoUsableData);
    }
    let record = validate(record);

    tracing::info!(
        engine = %result.engine,
        document_type = %record.record.document_type,
        issues = record.issues.len(),
        cached = !computed,
        "Job done"
    );
    Ok(JobSuccess {
        engine: result.engine,
        cached: !computed,
        record,
    })
}

/// Bytes the engines see: the upload itself, or its rendered PDF page.
async fn document_image(ctx: &PipelineContext, doc: &RawDocument) -> Result<Arc<[u8]>, ExtractionError> {
    let Some(page) = doc.page else {
        return Ok(Arc::clone(&doc.content));
    };
    let renderer = ctx.pdf_renderer().cloned().ok_or_else(|| {
        ExtractionError::InvalidInput("PDF input needs a page renderer (build with the `pdf` feature)".into())
    })?;

    let pdf = Arc::clone(&doc.content);
    let png = tokio::task::spawn_blocking(move || renderer.render_page(&pdf, page, RENDER_DPI))
        .await
        .map_err(|e| ExtractionError::PdfRendering {
            page,
            reason: format!("render task failed: {e}"),
        })??;
    tracing::debug!(page, bytes = png.len(), "Rendered PDF page");
    Ok(png.into())
}

fn field_values(record: &ValidatedRecord) -> BTreeMap<Field, String> {
    record
        .record
        .fields
        .iter()
        .map(|(field, value)| (*field, value.value.clone()))
        .collect()
}
