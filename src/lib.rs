pub mod config;
pub mod models;
pub mod pipeline;

pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{BatchItem, PipelineContext, ProgressEvent, SessionHandle, SessionSummary};

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` overrides the default
/// filter; a second call is a no-op.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();

    if installed.is_ok() {
        tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);
    }
}
