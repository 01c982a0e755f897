//! Extraction oracle: reads a run date and distance off a tracker screenshot.
//!
//! The production oracle sends the image to an OCR service, asks an
//! OpenAI-compatible chat model to pick the run date and distance out of the
//! recognised text, and falls back to pattern matching over the raw OCR text.

use std::env;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use quest_core::RunData;
use quest_storage::{FetchError, HttpClientConfig, RetryingClient};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub mod parse;

pub use parse::extract_run_data;

pub const CRATE_NAME: &str = "quest-oracle";

const EXTRACTION_PROMPT: &str = "Ты получаешь распознанный текст скриншота из беговного трекера. \
Найди дату пробежки и пройденную дистанцию. Ответь ровно двумя строками:\n\
date: dd.mm.yyyy\n\
distance: NN.NN км\n\
Если значение не найдено, напиши `not found` вместо него.";

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("reading screenshot {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ocr call failed: {0}")]
    Ocr(#[source] FetchError),
}

/// Turns a stored screenshot into run data. Fields the oracle cannot read come
/// back as the `"not found"` sentinel; `Err` is reserved for calls that failed.
#[async_trait]
pub trait ExtractionOracle: Send + Sync {
    async fn extract(&self, image_path: &Path) -> Result<RunData, OracleError>;
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub ocr_url: String,
    pub ocr_api_key: Option<String>,
    pub llm_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub http_timeout: Duration,
}

impl OracleConfig {
    pub fn from_env() -> Self {
        Self {
            ocr_url: env::var("OCR_URL").unwrap_or_else(|_| "http://localhost:8866/ocr".to_string()),
            ocr_api_key: env::var("OCR_API_KEY").ok().filter(|v| !v.is_empty()),
            llm_url: env::var("LLM_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string()),
            llm_api_key: env::var("LLM_API_KEY").ok().filter(|v| !v.is_empty()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            http_timeout: Duration::from_secs(
                env::var("HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "ParsedResults")]
    parsed_results: Vec<OcrParsedResult>,
}

#[derive(Debug, Deserialize)]
struct OcrParsedResult {
    #[serde(default, rename = "ParsedText")]
    parsed_text: String,
}

impl OcrResponse {
    fn into_text(self) -> String {
        match self.text {
            Some(text) => text,
            None => self
                .parsed_results
                .into_iter()
                .map(|r| r.parsed_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OCR service + chat-model oracle.
#[derive(Debug, Clone)]
pub struct OcrLlmOracle {
    http: RetryingClient,
    config: OracleConfig,
}

impl OcrLlmOracle {
    pub fn new(config: OracleConfig) -> anyhow::Result<Self> {
        let http = RetryingClient::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(format!("run-quest-oracle/{}", env!("CARGO_PKG_VERSION"))),
            ..HttpClientConfig::default()
        })?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(OracleConfig::from_env())
    }

    async fn recognise_text(&self, image: &[u8]) -> Result<String, OracleError> {
        let body = json!({ "image": STANDARD.encode(image), "language": "rus" });
        let response = self
            .http
            .send("ocr", |client| {
                let request = client.post(&self.config.ocr_url).json(&body);
                match &self.config.ocr_api_key {
                    Some(key) => request.bearer_auth(key),
                    None => request,
                }
            })
            .await
            .map_err(OracleError::Ocr)?;
        let parsed: OcrResponse = response.json().map_err(OracleError::Ocr)?;
        Ok(parsed.into_text())
    }

    async fn ask_model(&self, ocr_text: &str) -> Result<String, FetchError> {
        let body = json!({
            "model": self.config.llm_model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": EXTRACTION_PROMPT },
                { "role": "user", "content": ocr_text },
            ],
        });
        let response = self
            .http
            .send("llm", |client| {
                let request = client.post(&self.config.llm_url).json(&body);
                match &self.config.llm_api_key {
                    Some(key) => request.bearer_auth(key),
                    None => request,
                }
            })
            .await?;
        let completion: ChatCompletion = response.json()?;
        Ok(completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl ExtractionOracle for OcrLlmOracle {
    async fn extract(&self, image_path: &Path) -> Result<RunData, OracleError> {
        let span = info_span!("oracle_extract", path = %image_path.display());
        self.extract_inner(image_path).instrument(span).await
    }
}

impl OcrLlmOracle {
    async fn extract_inner(&self, image_path: &Path) -> Result<RunData, OracleError> {
        let image = tokio::fs::read(image_path)
            .await
            .map_err(|source| OracleError::Image {
                path: image_path.display().to_string(),
                source,
            })?;

        let ocr_text = self.recognise_text(&image).await?;
        if ocr_text.trim().is_empty() {
            debug!("ocr returned no text");
            return Ok(RunData::not_found());
        }

        let answer = match self.ask_model(&ocr_text).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(error = %err, "llm call failed; falling back to ocr text");
                String::new()
            }
        };

        let data = extract_run_data(&answer, &ocr_text, Utc::now().date_naive());
        debug!(date = %data.date, distance = %data.distance, "extraction finished");
        Ok(data)
    }
}
