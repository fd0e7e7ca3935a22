//! Gemini-style enrichment client: bilingual translation with a defensive
//! retry ladder and an explicit model-fallback session.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod prompts;

pub const CRATE_NAME: &str = "rjp-enrich";

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
/// Fallback ladder: quota exhaustion on the first attempt advances to the
/// next entry.
pub const DEFAULT_MODELS: &[&str] = &["gemini-2.5-pro", "gemini-3-flash"];
const CALL_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ATTEMPTS: usize = 6;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("api call timed out")]
    Timeout,
    #[error("model output is not valid json: {preview}")]
    MalformedJson { preview: String },
    #[error("quota exhausted for model {model}")]
    QuotaExhausted { model: String },
    #[error("api permission denied: {0}")]
    Permission(String),
    #[error("api authentication failed: {0}")]
    Auth(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("user location is not supported by the api")]
    RegionUnsupported,
    #[error("network error: {0}")]
    Network(String),
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("model returned empty content")]
    EmptyContent,
    #[error("all models in the fallback ladder are exhausted")]
    ModelsExhausted,
}

impl EnrichError {
    /// Errors that end the whole batch rather than one record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EnrichError::RegionUnsupported)
    }

    /// Errors that fail the record immediately, with no further attempts on
    /// any model.
    fn fails_record_now(&self) -> bool {
        matches!(
            self,
            EnrichError::Permission(_)
                | EnrichError::Auth(_)
                | EnrichError::ModelNotFound(_)
                | EnrichError::RegionUnsupported
        )
    }
}

/// Map an HTTP failure from the API into the retry taxonomy. The status code
/// wins; the body text catches gateways that mislabel their responses.
fn classify_api_failure(status: u16, message: &str) -> EnrichError {
    let lower = message.to_lowercase();
    if lower.contains("user location is not supported") {
        return EnrichError::RegionUnsupported;
    }
    match status {
        429 => EnrichError::QuotaExhausted {
            model: String::new(),
        },
        403 => EnrichError::Permission(message.to_string()),
        401 => EnrichError::Auth(message.to_string()),
        404 => EnrichError::ModelNotFound(message.to_string()),
        _ => {
            if lower.contains("quota") || lower.contains("rate") {
                EnrichError::QuotaExhausted {
                    model: String::new(),
                }
            } else if lower.contains("permission") || lower.contains("forbidden") {
                EnrichError::Permission(message.to_string())
            } else if lower.contains("unauthorized") || lower.contains("api_key") {
                EnrichError::Auth(message.to_string())
            } else if lower.contains("not found") {
                EnrichError::ModelNotFound(message.to_string())
            } else if lower.contains("timeout") {
                EnrichError::Timeout
            } else if lower.contains("network") || lower.contains("connection") {
                EnrichError::Network(message.to_string())
            } else {
                EnrichError::Api {
                    status,
                    message: message.to_string(),
                }
            }
        }
    }
}

/// Backoff before the next attempt for a failed one, or `None` when this
/// class has used up its sleeping retries and the loop just moves on.
fn retry_delay(error: &EnrichError, attempt: usize) -> Option<Duration> {
    match error {
        EnrichError::Timeout | EnrichError::MalformedJson { .. } => {
            (attempt < 3).then(|| Duration::from_secs(2))
        }
        EnrichError::QuotaExhausted { .. } => {
            Some(Duration::from_secs(u64::min(60, 5 * (attempt as u64 + 1))))
        }
        EnrichError::Network(_) => {
            (attempt < 4).then(|| Duration::from_secs(u64::min(30, 3 * (attempt as u64 + 1))))
        }
        EnrichError::Api { .. } | EnrichError::EmptyContent => {
            (attempt < 2).then(|| Duration::from_secs(1))
        }
        _ => None,
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize, Default)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

/// Thin REST client for a Gemini-style `generateContent` endpoint. Each call
/// carries its own deadline; there is no ambient alarm.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, EnrichError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, EnrichError> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|err| EnrichError::Network(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// One raw generation call. Returns the text of the first candidate.
    pub async fn generate_text(&self, model: &str, prompt: &str) -> Result<String, EnrichError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let body = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
        };

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    EnrichError::Timeout
                } else {
                    EnrichError::Network(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let mut error = classify_api_failure(status.as_u16(), &message);
            if let EnrichError::QuotaExhausted { model: m } = &mut error {
                *m = model.to_string();
            }
            return Err(error);
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| EnrichError::Network(err.to_string()))?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| c.content.parts)
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.text)
            .collect::<String>();

        if text.trim().is_empty() {
            return Err(EnrichError::EmptyContent);
        }
        debug!(model, bytes = text.len(), "generation call succeeded");
        Ok(text)
    }
}

/// Bilingual payload produced for a remote posting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTranslation {
    #[serde(default)]
    pub title_chinese: String,
    #[serde(default)]
    pub title_english: String,
    #[serde(default)]
    pub tags_chinese: Vec<String>,
    #[serde(default)]
    pub tags_english: Vec<String>,
    #[serde(default)]
    pub description_chinese: String,
    #[serde(default)]
    pub description_english: String,
}

/// Result of a successful enrichment call. An empty JSON object from the
/// model is a success meaning "this posting is not remote".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichOutcome {
    Translated(JobTranslation),
    NotRemote,
}

/// Strips ```json ... ``` or ``` ... ``` fences from model output.
fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or_else(|| stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or_else(|| stripped.trim_start())
    } else {
        text
    }
}

/// Fallback extraction for chatty output: the outermost `{ ... }` span.
fn extract_outer_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end >= start).then(|| &text[start..=end])
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Parse model output into an outcome. Tries the stripped text first, then
/// the outermost-braces extraction before giving up.
pub fn parse_outcome(raw: &str) -> Result<EnrichOutcome, EnrichError> {
    let content = strip_code_fences(raw);
    let value: serde_json::Value = match serde_json::from_str(content) {
        Ok(value) => value,
        Err(_) => {
            let extracted = extract_outer_json(content).ok_or_else(|| EnrichError::MalformedJson {
                preview: preview(content),
            })?;
            serde_json::from_str(extracted).map_err(|_| EnrichError::MalformedJson {
                preview: preview(content),
            })?
        }
    };

    match &value {
        serde_json::Value::Object(map) if map.is_empty() => Ok(EnrichOutcome::NotRemote),
        serde_json::Value::Object(_) => {
            let translation: JobTranslation =
                serde_json::from_value(value).map_err(|_| EnrichError::MalformedJson {
                    preview: preview(content),
                })?;
            Ok(EnrichOutcome::Translated(translation))
        }
        _ => Err(EnrichError::MalformedJson {
            preview: preview(content),
        }),
    }
}

fn has_forbidden_tag(tags: &[String]) -> bool {
    tags.iter().any(|tag| {
        let lower = tag.trim().to_lowercase();
        !lower.is_empty()
            && prompts::FORBIDDEN_TAG_SUBSTRINGS
                .iter()
                .any(|sub| lower.contains(sub))
    })
}

fn tags_len_ok(tags: &[String]) -> bool {
    (5..=7).contains(&tags.len())
}

/// Check the tag constraints the prompt imposes: 5-7 items per language and
/// no remote-marker tags.
pub fn translation_satisfies_constraints(translation: &JobTranslation) -> bool {
    tags_len_ok(&translation.tags_chinese)
        && tags_len_ok(&translation.tags_english)
        && !has_forbidden_tag(&translation.tags_chinese)
        && !has_forbidden_tag(&translation.tags_english)
}

/// Mutable enrichment state for one batch run. The model index survives
/// across records: once a model's quota is gone the batch stays on the
/// fallback for the rest of the run.
pub struct EnrichmentSession {
    client: GeminiClient,
    models: Vec<String>,
    model_index: usize,
}

impl EnrichmentSession {
    pub fn new(client: GeminiClient, models: Vec<String>) -> Self {
        let models = if models.is_empty() {
            DEFAULT_MODELS.iter().map(|m| m.to_string()).collect()
        } else {
            models
        };
        Self {
            client,
            models,
            model_index: 0,
        }
    }

    pub fn current_model(&self) -> Option<&str> {
        self.models.get(self.model_index).map(String::as_str)
    }

    /// Run the full attempt ladder against one model. Quota exhaustion on
    /// the first attempt escapes immediately so the caller can switch
    /// models; later quota hits are treated as transient rate limits.
    async fn attempt_model(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<EnrichOutcome, EnrichError> {
        let mut last_error = EnrichError::EmptyContent;

        for attempt in 0..MAX_ATTEMPTS {
            let result = match self.client.generate_text(model, prompt).await {
                Ok(raw) => parse_outcome(&raw),
                Err(err) => Err(err),
            };

            let error = match result {
                Ok(outcome) => return Ok(outcome),
                Err(error) => error,
            };

            if let EnrichError::QuotaExhausted { .. } = &error {
                if attempt == 0 {
                    return Err(error);
                }
            }
            if error.fails_record_now() {
                return Err(error);
            }

            if let Some(delay) = retry_delay(&error, attempt) {
                warn!(
                    model,
                    attempt = attempt + 1,
                    error = %error,
                    delay_secs = delay.as_secs(),
                    "enrichment attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            } else {
                warn!(model, attempt = attempt + 1, error = %error, "enrichment attempt failed");
            }
            last_error = error;
        }

        Err(last_error)
    }

    /// Enrich one posting. Walks the model ladder on quota exhaustion and
    /// re-prompts once when the tag constraints are violated.
    pub async fn enrich_job(
        &mut self,
        title: &str,
        description: &str,
        remote_check: bool,
    ) -> Result<EnrichOutcome, EnrichError> {
        let prompt = prompts::build_job_prompt(title, description, remote_check);

        loop {
            let model = match self.current_model() {
                Some(model) => model.to_string(),
                None => return Err(EnrichError::ModelsExhausted),
            };

            let outcome = match self.attempt_model(&model, &prompt).await {
                Ok(outcome) => outcome,
                Err(EnrichError::QuotaExhausted { .. }) => {
                    self.model_index += 1;
                    match self.current_model() {
                        Some(next) => {
                            info!(from = %model, to = next, "quota exhausted, switching model");
                            continue;
                        }
                        None => return Err(EnrichError::ModelsExhausted),
                    }
                }
                Err(error) => return Err(error),
            };

            let translation = match outcome {
                EnrichOutcome::NotRemote => return Ok(EnrichOutcome::NotRemote),
                EnrichOutcome::Translated(translation) => translation,
            };

            if translation_satisfies_constraints(&translation) {
                return Ok(EnrichOutcome::Translated(translation));
            }

            // One corrective re-prompt on the same model; keep the original
            // answer when the correction does not improve on it.
            warn!(model = %model, "tag constraints violated, sending corrective re-prompt");
            let corrective = format!("{}\n{}", prompts::CORRECTION_PREAMBLE, prompt);
            return match self.attempt_model(&model, &corrective).await {
                Ok(EnrichOutcome::Translated(corrected)) => {
                    Ok(EnrichOutcome::Translated(corrected))
                }
                _ => Ok(EnrichOutcome::Translated(translation)),
            };
        }
    }
}
