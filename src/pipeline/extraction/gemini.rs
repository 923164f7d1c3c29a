//! Gemini vision engine: one `generateContent` call per image, asking for
//! structured identity fields as JSON alongside the raw visible text.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::types::{EngineOutput, ImageVariant, RecognitionEngine};
use super::ExtractionError;
use crate::models::{DocumentType, EngineCapability, EngineKind, Field};

// ──────────────────────────────────────────────
// Constants
// ──────────────────────────────────────────────

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Retries on HTTP 429 / 5xx within a single attempt.
const MAX_RETRIES: u32 = 2;

/// Gemini reports no per-field scores; structured answers get this.
const STRUCTURED_CONFIDENCE: f32 = 0.85;

const EXTRACT_PROMPT: &str = "\
You are an OCR specialist for Indonesian identity documents (KTP identity card, passport, visa).
Read the image and return ONLY a JSON object with these keys:
{
  \"document_type\": \"identity_card\" | \"passport\" | \"visa\",
  \"raw_text\": \"every visible line of text, including machine-readable lines, separated by \\n\",
  \"full_name\": \"\", \"national_id\": \"\", \"passport_number\": \"\", \"visa_number\": \"\",
  \"place_of_birth\": \"\", \"date_of_birth\": \"DD-MM-YYYY\", \"sex\": \"\", \"nationality\": \"\",
  \"address\": \"\", \"province\": \"\", \"regency\": \"\", \"district\": \"\", \"village\": \"\",
  \"issue_date\": \"DD-MM-YYYY\", \"expiry_date\": \"DD-MM-YYYY\", \"issuing_office\": \"\",
  \"rt_rw\": \"\", \"religion\": \"\",
  \"marital_status\": \"BELUM KAWIN\" | \"KAWIN\" | \"CERAI HIDUP\" | \"CERAI MATI\",
  \"occupation\": \"\", \"education\": \"\", \"father_name\": \"\",
  \"phone_number\": \"\", \"visa_issuer\": \"embassy or issuing post of a visa\"
}
On an identity card, nationality is WNI or WNA as printed.
Use an empty string for anything not visible. No markdown, no commentary.";

// ──────────────────────────────────────────────
// Wire types
// ──────────────────────────────────────────────

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    Image { inline_data: InlineData<'a> },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

/// JSON object the prompt asks for. Missing keys default to empty.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StructuredDocument {
    document_type: String,
    raw_text: String,
    full_name: String,
    national_id: String,
    passport_number: String,
    visa_number: String,
    place_of_birth: String,
    date_of_birth: String,
    sex: String,
    nationality: String,
    address: String,
    province: String,
    regency: String,
    district: String,
    village: String,
    issue_date: String,
    expiry_date: String,
    issuing_office: String,
    rt_rw: String,
    religion: String,
    marital_status: String,
    occupation: String,
    education: String,
    father_name: String,
    phone_number: String,
    /// Some answers split landline and mobile numbers.
    mobile_number: String,
    visa_issuer: String,
}

// ──────────────────────────────────────────────
// GeminiEngine
// ──────────────────────────────────────────────

pub struct GeminiEngine {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    retry_base: Duration,
}

impl GeminiEngine {
    pub fn new(api_key: Option<String>, model: &str, timeout: Duration) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractionError::engine(EngineKind::Gemini, format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model: model.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            retry_base: Duration::from_secs(2),
        })
    }

    /// Point at a different API root (proxies, local test servers).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// First retry delay; doubles on each further retry.
    pub fn with_retry_base(mut self, delay: Duration) -> Self {
        self.retry_base = delay;
        self
    }

    fn endpoint(&self, api_key: &str) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, api_key
        )
    }

    async fn call(&self, api_key: &str, body: &GenerateRequest<'_>) -> Result<String, ExtractionError> {
        let url = self.endpoint(api_key);
        let mut attempt = 0;

        loop {
            let response = self
                .client
                .post(&url)
                .json(body)
                .send()
                .await
                .map_err(|e| {
                    let reason = if e.is_connect() {
                        "connection failed".to_string()
                    } else if e.is_timeout() {
                        "request timed out".to_string()
                    } else {
                        e.to_string()
                    };
                    ExtractionError::engine(EngineKind::Gemini, reason)
                })?;

            let status = response.status();
            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && attempt < MAX_RETRIES {
                attempt += 1;
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                let delay = self.retry_base * 2u32.pow(attempt - 1) + jitter;
                tracing::warn!(
                    status = status.as_u16(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Gemini returned retryable status"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ExtractionError::engine(
                    EngineKind::Gemini,
                    format!("HTTP {}: {}", status.as_u16(), truncate(&body, 200)),
                ));
            }

            let parsed: GenerateResponse = response.json().await.map_err(|e| {
                ExtractionError::engine(EngineKind::Gemini, format!("response parsing: {e}"))
            })?;
            return response_text(&parsed).ok_or_else(|| {
                ExtractionError::engine(EngineKind::Gemini, "response contained no candidates")
            });
        }
    }
}

#[async_trait]
impl RecognitionEngine for GeminiEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Gemini
    }

    fn capability(&self) -> EngineCapability {
        EngineCapability::Vision
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn recognize(
        &self,
        image: &ImageVariant,
        _hint: Option<DocumentType>,
    ) -> Result<EngineOutput, ExtractionError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ExtractionError::NotConfigured(EngineKind::Gemini))?;

        let start = std::time::Instant::now();
        let body = build_request(image);
        let text = self.call(api_key, &body).await?;
        let output = parse_structured(&text)
            .map(structured_to_output)
            .map_err(|reason| ExtractionError::engine(EngineKind::Gemini, reason))?;

        tracing::info!(
            model = %self.model,
            elapsed_ms = %start.elapsed().as_millis(),
            fields = output.fields.len(),
            text_len = output.text.len(),
            "Gemini extraction complete"
        );
        Ok(output)
    }
}

// ──────────────────────────────────────────────
// Request / response helpers
// ──────────────────────────────────────────────

fn build_request(image: &ImageVariant) -> GenerateRequest<'_> {
    let data = base64::engine::general_purpose::STANDARD.encode(&*image.bytes);
    GenerateRequest {
        contents: vec![Content {
            parts: vec![
                Part::Text { text: EXTRACT_PROMPT },
                Part::Image {
                    inline_data: InlineData {
                        mime_type: image.mime_type,
                        data,
                    },
                },
            ],
        }],
        generation_config: GenerationConfig {
            temperature: 0.1,
            max_output_tokens: 4096,
            response_mime_type: "application/json",
        },
    }
}

/// `candidates[0].content.parts[0].text`
fn response_text(response: &GenerateResponse) -> Option<String> {
    response
        .candidates
        .first()
        .and_then(|c| c.content.parts.first())
        .map(|p| p.text.clone())
}

/// Parse the model's JSON, tolerating a fenced ```json block around it.
fn parse_structured(text: &str) -> Result<StructuredDocument, String> {
    if let Ok(doc) = serde_json::from_str::<StructuredDocument>(text.trim()) {
        return Ok(doc);
    }
    let fenced = extract_fenced_json(text)
        .ok_or_else(|| format!("response is not JSON: {}", truncate(text, 200)))?;
    serde_json::from_str(fenced).map_err(|e| format!("fenced JSON invalid: {e}"))
}

fn extract_fenced_json(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn structured_to_output(doc: StructuredDocument) -> EngineOutput {
    let document_hint = parse_document_type(&doc.document_type);
    let phone = if doc.phone_number.trim().is_empty() {
        doc.mobile_number
    } else {
        doc.phone_number
    };
    let pairs = [
        (Field::FullName, doc.full_name),
        (Field::NationalId, doc.national_id),
        (Field::PassportNumber, doc.passport_number),
        (Field::VisaNumber, doc.visa_number),
        (Field::PlaceOfBirth, doc.place_of_birth),
        (Field::DateOfBirth, doc.date_of_birth),
        (Field::Sex, doc.sex),
        (Field::Nationality, doc.nationality),
        (Field::Address, doc.address),
        (Field::Province, doc.province),
        (Field::Regency, doc.regency),
        (Field::District, doc.district),
        (Field::Village, doc.village),
        (Field::IssueDate, doc.issue_date),
        (Field::ExpiryDate, doc.expiry_date),
        (Field::IssuingOffice, doc.issuing_office),
        (Field::RtRw, doc.rt_rw),
        (Field::Religion, doc.religion),
        (Field::MaritalStatus, doc.marital_status),
        (Field::Occupation, doc.occupation),
        (Field::Education, doc.education),
        (Field::FatherName, doc.father_name),
        (Field::VisaIssuer, doc.visa_issuer),
        (Field::PhoneNumber, phone),
    ];

    let fields: BTreeMap<Field, String> = pairs
        .into_iter()
        .map(|(f, v)| (f, v.trim().to_string()))
        .filter(|(_, v)| !v.is_empty())
        .collect();
    let field_confidence = fields.keys().map(|f| (*f, STRUCTURED_CONFIDENCE)).collect();
    let confidence = if fields.is_empty() { 0.3 } else { STRUCTURED_CONFIDENCE };

    EngineOutput {
        text: doc.raw_text,
        fields,
        field_confidence,
        document_hint,
        confidence,
    }
}

/// Accepts canonical names and the Indonesian labels the model sometimes echoes.
pub fn parse_document_type(raw: &str) -> Option<DocumentType> {
    match raw.trim().to_lowercase().as_str() {
        "identity_card" | "ktp" | "id_card" => Some(DocumentType::IdentityCard),
        "passport" | "paspor" => Some(DocumentType::Passport),
        "visa" => Some(DocumentType::Visa),
        _ => None,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
