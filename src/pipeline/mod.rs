//! Document pipeline: recognition, parsing, cleaning, validation and
//! cross-document identity merging, run per session over a shared context.

pub mod extraction;
pub mod cancel;
pub mod limiter;
pub mod cache;
pub mod parsing;
pub mod cleaning;
pub mod validation;
pub mod merge;
pub mod progress;
pub mod session;
pub mod context;

pub use cache::{CacheStats, ExtractionCache};
pub use cancel::CancelToken;
pub use context::{BatchItem, PipelineContext, SessionHandle};
pub use extraction::{ExtractionError, RecognitionEngine};
pub use progress::ProgressEvent;
pub use session::{JobError, JobOutcome, SessionSummary};
