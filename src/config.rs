use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::EngineKind;

/// Application-level constants
pub const APP_NAME: &str = "idextract";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "idextract=info"
}

/// Default Gemini model when `GEMINI_MODEL` is unset.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Default Ollama vision model when `OLLAMA_VISION_MODEL` is unset.
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2-vision";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Unknown recognition engine: '{0}'")]
    UnknownEngine(String),
}

// ═══════════════════════════════════════════════════════════
// Configuration types
// ═══════════════════════════════════════════════════════════

/// Per-engine concurrency and rate limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineLimits {
    /// Simultaneous in-flight calls.
    pub max_concurrent: usize,
    /// Token-bucket ceiling (requests per minute).
    pub requests_per_minute: u32,
    /// Callers allowed to wait for a concurrency slot before `Backpressure`.
    pub queue_depth: usize,
    /// Longest a caller waits for a rate-limit token.
    pub max_wait: Duration,
    /// Bound on a single engine attempt.
    pub timeout: Duration,
}

impl EngineLimits {
    pub fn for_engine(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Gemini => Self {
                max_concurrent: 10,
                requests_per_minute: 60,
                queue_depth: 50,
                max_wait: Duration::from_secs(30),
                timeout: Duration::from_secs(60),
            },
            EngineKind::Ollama => Self {
                max_concurrent: 2,
                requests_per_minute: 120,
                queue_depth: 50,
                max_wait: Duration::from_secs(60),
                timeout: Duration::from_secs(300),
            },
            EngineKind::Tesseract => Self {
                max_concurrent: 4,
                requests_per_minute: 600,
                queue_depth: 100,
                max_wait: Duration::from_secs(30),
                timeout: Duration::from_secs(60),
            },
            EngineKind::Hybrid => Self {
                max_concurrent: 4,
                requests_per_minute: 120,
                queue_depth: 50,
                max_wait: Duration::from_secs(30),
                timeout: Duration::from_secs(120),
            },
        }
    }
}

/// Credentials and endpoints. Absence of a credential disables that engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineCredentials {
    #[serde(skip_serializing)]
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub ollama_url: Option<String>,
    pub ollama_model: String,
    pub tessdata_dir: Option<PathBuf>,
}

/// Fuzzy identity merge tuning. Calibration is a product decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Composite similarity at or above which two records are unioned.
    pub cutoff: f32,
    /// Weight of token-based name similarity.
    pub name_weight: f32,
    /// Weight of date-of-birth equality.
    pub dob_weight: f32,
    /// Values at or above this confidence raise a conflict when they disagree.
    pub high_confidence: f32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            cutoff: 0.8,
            name_weight: 0.7,
            dob_weight: 0.3,
            high_confidence: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    /// `None` disables time-based expiry.
    pub ttl: Option<Duration>,
    /// Key entries by (content hash, entry engine of the fallback chain)
    /// rather than content hash alone.
    pub scope_by_engine: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl: Some(Duration::from_secs(3600)),
            scope_by_engine: false,
        }
    }
}

/// Full pipeline configuration, constructed once and handed to `PipelineContext`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub primary_engine: EngineKind,
    pub fallback_enabled: bool,
    pub limits: BTreeMap<EngineKind, EngineLimits>,
    pub credentials: EngineCredentials,
    pub merge: MergeConfig,
    pub cache: CacheConfig,
    /// Global bound on concurrently processed documents.
    pub worker_concurrency: usize,
    pub max_file_bytes: usize,
    /// Longest decoded image side accepted, in pixels.
    pub max_image_dimension: u32,
    pub max_files_per_session: usize,
    /// Pages of one PDF upload extracted as documents; later pages are ignored.
    pub max_pdf_pages: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            primary_engine: EngineKind::Gemini,
            fallback_enabled: true,
            limits: EngineKind::ALL
                .iter()
                .map(|k| (*k, EngineLimits::for_engine(*k)))
                .collect(),
            credentials: EngineCredentials {
                gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
                ollama_model: DEFAULT_OLLAMA_MODEL.to_string(),
                ..Default::default()
            },
            merge: MergeConfig::default(),
            cache: CacheConfig::default(),
            worker_concurrency: 15,
            max_file_bytes: 10 * 1024 * 1024,
            max_image_dimension: 12_000,
            max_files_per_session: 50,
            max_pdf_pages: 20,
        }
    }
}

impl PipelineConfig {
    /// Build from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("OCR_PRIMARY_ENGINE") {
            config.primary_engine = v
                .to_lowercase()
                .parse()
                .map_err(|_| ConfigError::UnknownEngine(v.clone()))?;
        }
        if let Some(v) = get("OCR_FALLBACK_ENABLED") {
            config.fallback_enabled = parse_bool("OCR_FALLBACK_ENABLED", &v)?;
        }

        config.credentials.gemini_api_key = get("GEMINI_API_KEY");
        if let Some(v) = get("GEMINI_MODEL") {
            config.credentials.gemini_model = v;
        }
        config.credentials.ollama_url = get("OLLAMA_URL");
        if let Some(v) = get("OLLAMA_VISION_MODEL") {
            config.credentials.ollama_model = v;
        }
        config.credentials.tessdata_dir = get("TESSDATA_PREFIX").map(PathBuf::from);

        for kind in EngineKind::ALL {
            let prefix = kind.as_str().to_uppercase();
            let limits = config
                .limits
                .entry(kind)
                .or_insert_with(|| EngineLimits::for_engine(kind));
            if let Some(v) = get(&format!("{prefix}_CONCURRENCY")) {
                limits.max_concurrent = parse_num(&format!("{prefix}_CONCURRENCY"), &v)?;
            }
            if let Some(v) = get(&format!("{prefix}_RPM")) {
                limits.requests_per_minute = parse_num(&format!("{prefix}_RPM"), &v)?;
            }
            if let Some(v) = get(&format!("{prefix}_QUEUE_DEPTH")) {
                limits.queue_depth = parse_num(&format!("{prefix}_QUEUE_DEPTH"), &v)?;
            }
            if let Some(v) = get(&format!("{prefix}_TIMEOUT_SECS")) {
                limits.timeout = Duration::from_secs(parse_num(&format!("{prefix}_TIMEOUT_SECS"), &v)?);
            }
        }

        if let Some(v) = get("MERGE_SIMILARITY_CUTOFF") {
            config.merge.cutoff = parse_unit("MERGE_SIMILARITY_CUTOFF", &v)?;
        }
        if let Some(v) = get("MERGE_NAME_WEIGHT") {
            config.merge.name_weight = parse_unit("MERGE_NAME_WEIGHT", &v)?;
        }
        if let Some(v) = get("MERGE_DOB_WEIGHT") {
            config.merge.dob_weight = parse_unit("MERGE_DOB_WEIGHT", &v)?;
        }

        if let Some(v) = get("CACHE_CAPACITY") {
            config.cache.capacity = parse_num("CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = get("CACHE_TTL_SECS") {
            let secs: u64 = parse_num("CACHE_TTL_SECS", &v)?;
            config.cache.ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(v) = get("CACHE_SCOPE_BY_ENGINE") {
            config.cache.scope_by_engine = parse_bool("CACHE_SCOPE_BY_ENGINE", &v)?;
        }

        if let Some(v) = get("WORKER_CONCURRENCY") {
            config.worker_concurrency = parse_num("WORKER_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("MAX_FILE_BYTES") {
            config.max_file_bytes = parse_num("MAX_FILE_BYTES", &v)?;
        }
        if let Some(v) = get("MAX_IMAGE_DIMENSION") {
            config.max_image_dimension = parse_num("MAX_IMAGE_DIMENSION", &v)?;
        }
        if let Some(v) = get("MAX_FILES_PER_SESSION") {
            config.max_files_per_session = parse_num("MAX_FILES_PER_SESSION", &v)?;
        }
        if let Some(v) = get("MAX_PDF_PAGES") {
            config.max_pdf_pages = parse_num("MAX_PDF_PAGES", &v)?;
        }

        Ok(config)
    }

    /// Limits for one engine, falling back to its built-in defaults.
    pub fn limits_for(&self, kind: EngineKind) -> EngineLimits {
        self.limits
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| EngineLimits::for_engine(kind))
    }

    /// Primary engine first, then the remaining engines in default order.
    pub fn fallback_order(&self) -> Vec<EngineKind> {
        let mut order = vec![self.primary_engine];
        if self.fallback_enabled {
            order.extend(
                EngineKind::ALL
                    .iter()
                    .copied()
                    .filter(|k| *k != self.primary_engine),
            );
        }
        order
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_unit(key: &str, value: &str) -> Result<f32, ConfigError> {
    let v: f32 = parse_num(key, value)?;
    if (0.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(invalid(key, value))
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
