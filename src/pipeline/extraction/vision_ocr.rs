//! Ollama vision engine: transcribes document images through a local
//! vision model via `/api/chat`.
//!
//! The model is asked to append a classification tag (`[IDENTITY_CARD]`,
//! `[PASSPORT]`, `[VISA]`) which becomes the document-type hint.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::types::{EngineOutput, ImageVariant, RecognitionEngine};
use super::ExtractionError;
use crate::models::{DocumentType, EngineCapability, EngineKind};

// ──────────────────────────────────────────────
// Constants
// ──────────────────────────────────────────────

const TAGS: [(&str, DocumentType); 3] = [
    ("[IDENTITY_CARD]", DocumentType::IdentityCard),
    ("[PASSPORT]", DocumentType::Passport),
    ("[VISA]", DocumentType::Visa),
];

const UNKNOWN_TAG: &str = "[UNKNOWN]";

const SYSTEM_PROMPT: &str = "\
You are a text extractor for identity documents. Transcribe ALL visible text \
exactly as printed, one printed line per output line. Copy machine-readable \
zone lines character for character, keeping every '<'.";

const USER_PROMPT: &str = "\
Transcribe every line of text in this document image. \
At the very end, on a new line, write exactly [IDENTITY_CARD], [PASSPORT] or [VISA] \
for the document kind, or [UNKNOWN] if you cannot tell.";

// ──────────────────────────────────────────────
// Wire types
// ──────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

// ──────────────────────────────────────────────
// OllamaVisionEngine
// ──────────────────────────────────────────────

/// Vision engine backed by a local Ollama instance.
/// Unconfigured when no base URL is supplied.
pub struct OllamaVisionEngine {
    client: reqwest::Client,
    base_url: Option<String>,
    model_name: String,
}

impl OllamaVisionEngine {
    pub fn new(base_url: Option<&str>, model_name: &str, timeout: Duration) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractionError::engine(EngineKind::Ollama, format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            model_name: model_name.to_string(),
        })
    }

    async fn chat(&self, base_url: &str, image_b64: String) -> Result<String, ExtractionError> {
        let url = format!("{base_url}/api/chat");
        let body = ChatRequest {
            model: &self.model_name,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                    images: vec![],
                },
                ChatMessage {
                    role: "user",
                    content: USER_PROMPT,
                    images: vec![image_b64],
                },
            ],
            stream: false,
            options: ChatOptions { temperature: 0.1 },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_connect() {
                    format!("Ollama not reachable at {base_url}")
                } else if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    e.to_string()
                };
                ExtractionError::engine(EngineKind::Ollama, reason)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::engine(
                EngineKind::Ollama,
                format!("HTTP {}: {body}", status.as_u16()),
            ));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            ExtractionError::engine(EngineKind::Ollama, format!("response parsing: {e}"))
        })?;
        Ok(parsed.message.content)
    }
}

#[async_trait]
impl RecognitionEngine for OllamaVisionEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Ollama
    }

    fn capability(&self) -> EngineCapability {
        EngineCapability::Vision
    }

    fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    async fn recognize(
        &self,
        image: &ImageVariant,
        _hint: Option<DocumentType>,
    ) -> Result<EngineOutput, ExtractionError> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or(ExtractionError::NotConfigured(EngineKind::Ollama))?;
        let start = std::time::Instant::now();

        let image_b64 = base64::engine::general_purpose::STANDARD.encode(&*image.bytes);
        let raw_response = self.chat(base_url, image_b64).await?;

        let (text, document_hint) = parse_classification_tag(&raw_response);
        let confidence = compute_heuristic_confidence(&text);

        tracing::info!(
            model = %self.model_name,
            elapsed_ms = %start.elapsed().as_millis(),
            text_len = text.len(),
            confidence,
            document_hint = ?document_hint,
            "Vision OCR extraction complete"
        );

        Ok(EngineOutput {
            text,
            confidence,
            document_hint,
            ..Default::default()
        })
    }
}

// ──────────────────────────────────────────────
// Classification tag parsing
// ──────────────────────────────────────────────

/// Strip the trailing classification tag and map it to a document type.
/// No tag (or `[UNKNOWN]`) leaves classification to the parsers.
fn parse_classification_tag(response: &str) -> (String, Option<DocumentType>) {
    let trimmed = response.trim();

    for (tag, doc_type) in TAGS {
        if let Some(text) = trimmed.strip_suffix(tag) {
            return (text.trim().to_string(), Some(doc_type));
        }
    }
    if let Some(text) = trimmed.strip_suffix(UNKNOWN_TAG) {
        return (text.trim().to_string(), None);
    }
    (trimmed.to_string(), None)
}

// ──────────────────────────────────────────────
// Confidence heuristic
// ──────────────────────────────────────────────

/// Heuristic confidence for free-text vision output.
///
/// Vision models give no per-word confidence, so estimate from the output:
///
/// 1. **Text length** (primary signal):
///    - 0 chars → 0.0 (extraction failed)
///    - 1-49 chars → 0.2
///    - 50-199 chars → 0.4 (a typical card)
///    - 200-499 chars → 0.6
///    - 500+ chars → 0.8
///
/// 2. **Identity markers** (bonus):
///    - machine-readable line (`<<`) → +0.1
///    - labelled field (`NIK`, `Nama`, `Passport No`) → +0.05
///
/// Capped at 0.95 (never claim certainty for heuristic scoring).
pub fn compute_heuristic_confidence(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }

    let len = text.len();

    let base: f32 = if len < 50 {
        0.2
    } else if len < 200 {
        0.4
    } else if len < 500 {
        0.6
    } else {
        0.8
    };

    let upper = text.to_uppercase();
    let has_mrz = text.lines().any(|l| l.contains("<<"));
    let has_labels = ["NIK", "NAMA", "PASSPORT NO", "PASPOR"]
        .iter()
        .any(|label| upper.contains(label));

    let bonus: f32 = if has_mrz { 0.1 } else { 0.0 } + if has_labels { 0.05 } else { 0.0 };

    (base + bonus).min(0.95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::VariantKind;

    // ── parse_classification_tag ──

    #[test]
    fn parse_passport_tag() {
        let (text, hint) = parse_classification_tag("REPUBLIK INDONESIA\nP<IDN...\n[PASSPORT]");
        assert_eq!(hint, Some(DocumentType::Passport));
        assert_eq!(text, "REPUBLIK INDONESIA\nP<IDN...");
    }

    #[test]
    fn parse_identity_card_tag() {
        let (text, hint) = parse_classification_tag("NIK : 3201\n[IDENTITY_CARD]");
        assert_eq!(hint, Some(DocumentType::IdentityCard));
        assert_eq!(text, "NIK : 3201");
    }

    #[test]
    fn parse_unknown_tag_gives_no_hint() {
        let (text, hint) = parse_classification_tag("blurry\n[UNKNOWN]");
        assert_eq!(hint, None);
        assert_eq!(text, "blurry");
    }

    #[test]
    fn parse_no_tag() {
        let (text, hint) = parse_classification_tag("Just some text without a tag");
        assert_eq!(hint, None);
        assert_eq!(text, "Just some text without a tag");
    }

    #[test]
    fn parse_tag_with_trailing_whitespace() {
        let (text, hint) = parse_classification_tag("Visa No: AB1234  \n  [VISA]  ");
        assert_eq!(hint, Some(DocumentType::Visa));
        assert_eq!(text, "Visa No: AB1234");
    }

    // ── compute_heuristic_confidence ──

    #[test]
    fn confidence_empty_text_is_zero() {
        assert_eq!(compute_heuristic_confidence(""), 0.0);
    }

    #[test]
    fn confidence_short_text_is_low() {
        let c = compute_heuristic_confidence("Hello");
        assert!((c - 0.2).abs() < f32::EPSILON, "Short text: {c}");
    }

    #[test]
    fn confidence_moderate_text() {
        let text = "x".repeat(100);
        let c = compute_heuristic_confidence(&text);
        assert!((c - 0.4).abs() < f32::EPSILON, "100 chars: {c}");
    }

    #[test]
    fn confidence_with_identity_markers() {
        let text = format!(
            "PASPOR\nP<IDNSANTOSO<<BUDI<<<<<<<<<<<<<<<<<<<<<<<<<<<\n{}",
            "x".repeat(500)
        );
        let c = compute_heuristic_confidence(&text);
        assert!(c <= 0.95, "Should be capped: {c}");
        assert!(c > 0.9, "Markers should add bonus: {c}");
    }

    // ── engine ──

    #[tokio::test]
    async fn missing_url_is_not_configured() {
        let engine = OllamaVisionEngine::new(None, "llava", Duration::from_secs(1)).unwrap();
        assert!(!engine.is_configured());
        let image = ImageVariant {
            kind: VariantKind::Original,
            bytes: vec![0u8; 4].into(),
            mime_type: "image/png",
        };
        let err = engine.recognize(&image, None).await.unwrap_err();
        assert_eq!(err, ExtractionError::NotConfigured(EngineKind::Ollama));
    }

    #[test]
    fn request_places_image_on_user_message_only() {
        let body = ChatRequest {
            model: "llava",
            messages: vec![
                ChatMessage { role: "system", content: SYSTEM_PROMPT, images: vec![] },
                ChatMessage { role: "user", content: USER_PROMPT, images: vec!["AAAA".into()] },
            ],
            stream: false,
            options: ChatOptions { temperature: 0.1 },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json["messages"][0].get("images").is_none());
        assert_eq!(json["messages"][1]["images"][0], "AAAA");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn prompt_lists_every_tag() {
        for (tag, _) in TAGS {
            assert!(USER_PROMPT.contains(tag), "missing {tag}");
        }
        assert!(USER_PROMPT.contains(UNKNOWN_TAG));
    }
}
