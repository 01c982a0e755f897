//! Session client for the race registration site: form login with an optional
//! one-time-code step, then the participant CSV export.

use std::env;
use std::io;
use std::time::Duration;

use anyhow::{anyhow, Context};
use quest_core::ParticipantImport;
use quest_storage::{
    BackoffPolicy, FetchError, HttpClientConfig, ImportSummary, QuestDb, RetryingClient,
};
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "quest-registration";

const LOGIN_PATH: &str = "/login";
const OTP_PATH: &str = "/login/otp";
const EXPORT_PATH: &str = "/admin/participants/export.csv";
const CSRF_SELECTOR: &str = "input[name=_csrf]";
const OTP_INPUT_SELECTOR: &str = "input[name=code]";
const PASSWORD_INPUT_SELECTOR: &str = "input[name=password]";

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("{0} is not set")]
    NotConfigured(&'static str),
    #[error("no csrf token on the {page} page")]
    MissingCsrf { page: &'static str },
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: &'static str, message: String },
    #[error("login rejected by the registration site")]
    InvalidCredentials,
    #[error("not logged in to the registration site")]
    NotLoggedIn,
    #[error("one-time code must be 4 to 8 digits")]
    MalformedOtp,
    #[error("one-time code rejected by the registration site")]
    OtpRejected,
    #[error("no one-time code step is pending")]
    NoPendingOtp,
    #[error("participant export is not valid CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Client(#[from] anyhow::Error),
}

pub type RegistrationResult<T> = Result<T, RegistrationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    LoggedIn,
    OtpRequired,
}

#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub timeout: Duration,
}

impl RegistrationConfig {
    pub fn from_env() -> RegistrationResult<Self> {
        let required = |key: &'static str| {
            env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or(RegistrationError::NotConfigured(key))
        };
        Ok(Self {
            base_url: required("REGISTRATION_BASE_URL")?,
            email: required("REGISTRATION_EMAIL")?,
            password: required("REGISTRATION_PASSWORD")?,
            timeout: Duration::from_secs(
                env::var("HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
        })
    }
}

/// What a page returned by the site asks for next.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SitePage {
    LoginForm,
    OtpForm { csrf: String },
    Authenticated,
}

pub struct RegistrationClient {
    http: RetryingClient,
    base_url: String,
    /// CSRF token of the one-time-code form, set while a code is awaited.
    pending_otp: Mutex<Option<String>>,
}

impl RegistrationClient {
    pub fn new(config: &RegistrationConfig) -> RegistrationResult<Self> {
        let http = RetryingClient::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(format!("{CRATE_NAME}/{}", env!("CARGO_PKG_VERSION"))),
            cookie_store: true,
            backoff: BackoffPolicy::default(),
        })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            pending_otp: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn login(&self, email: &str, password: &str) -> RegistrationResult<LoginOutcome> {
        let login_url = self.url(LOGIN_PATH);
        let form_page = self
            .http
            .send("registration_login_form", |client| client.get(&login_url))
            .await?;
        let csrf = scrape_csrf(&form_page.text())?.ok_or(RegistrationError::MissingCsrf { page: "login" })?;

        let form = [("email", email), ("password", password), ("_csrf", csrf.as_str())];
        let response = self
            .http
            .send("registration_login", |client| client.post(&login_url).form(&form))
            .await?;

        match classify_page(&response.text())? {
            SitePage::Authenticated => {
                info!(base_url = %self.base_url, "registration site session established");
                Ok(LoginOutcome::LoggedIn)
            }
            SitePage::OtpForm { csrf } => {
                *self.pending_otp.lock().await = Some(csrf);
                info!(base_url = %self.base_url, "registration site asks for a one-time code");
                Ok(LoginOutcome::OtpRequired)
            }
            SitePage::LoginForm => Err(RegistrationError::InvalidCredentials),
        }
    }

    /// Completes the second factor. The code is validated before anything is sent.
    pub async fn submit_otp(&self, code: &str) -> RegistrationResult<()> {
        let code = validate_otp(code)?;
        let csrf = self
            .pending_otp
            .lock()
            .await
            .take()
            .ok_or(RegistrationError::NoPendingOtp)?;

        let otp_url = self.url(OTP_PATH);
        let form = [("code", code), ("_csrf", csrf.as_str())];
        let response = self
            .http
            .send("registration_otp", |client| client.post(&otp_url).form(&form))
            .await?;

        match classify_page(&response.text())? {
            SitePage::Authenticated => Ok(()),
            SitePage::OtpForm { csrf } => {
                *self.pending_otp.lock().await = Some(csrf);
                warn!("one-time code rejected");
                Err(RegistrationError::OtpRejected)
            }
            SitePage::LoginForm => Err(RegistrationError::NotLoggedIn),
        }
    }

    pub async fn export_participants(&self) -> RegistrationResult<Vec<ParticipantImport>> {
        let export_url = self.url(EXPORT_PATH);
        let response = self
            .http
            .send("registration_export", |client| client.get(&export_url))
            .await?;
        // An expired session redirects to the login form instead of the file.
        if response.body.trim_ascii_start().starts_with(b"<") {
            return Err(RegistrationError::NotLoggedIn);
        }
        let rows = parse_participants_csv(response.body.as_slice())?;
        info!(rows = rows.len(), "registration export downloaded");
        Ok(rows)
    }
}

/// Logs in (with `otp` when the site asks for one), downloads the export and
/// imports it. Existing participants are left untouched.
pub async fn sync_participants(
    client: &RegistrationClient,
    config: &RegistrationConfig,
    db: &QuestDb,
    otp: Option<&str>,
) -> anyhow::Result<ImportSummary> {
    if client.login(&config.email, &config.password).await? == LoginOutcome::OtpRequired {
        let code = otp.ok_or_else(|| anyhow!("registration site asks for a one-time code"))?;
        client.submit_otp(code).await?;
    }
    let rows = client.export_participants().await?;
    let summary = db
        .import_participants(&rows)
        .await
        .context("importing registration export")?;
    info!(
        inserted = summary.inserted,
        skipped = summary.skipped,
        "registration sync complete"
    );
    Ok(summary)
}

pub fn validate_otp(code: &str) -> RegistrationResult<&str> {
    let code = code.trim();
    if (4..=8).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_digit()) {
        Ok(code)
    } else {
        Err(RegistrationError::MalformedOtp)
    }
}

fn selector(raw: &'static str) -> RegistrationResult<Selector> {
    Selector::parse(raw).map_err(|e| RegistrationError::Selector {
        selector: raw,
        message: e.to_string(),
    })
}

fn scrape_csrf(html: &str) -> RegistrationResult<Option<String>> {
    let document = Html::parse_document(html);
    let sel = selector(CSRF_SELECTOR)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr("value"))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string))
}

fn classify_page(html: &str) -> RegistrationResult<SitePage> {
    let document = Html::parse_document(html);
    if document.select(&selector(OTP_INPUT_SELECTOR)?).next().is_some() {
        let csrf = scrape_csrf(html)?.ok_or(RegistrationError::MissingCsrf { page: "otp" })?;
        return Ok(SitePage::OtpForm { csrf });
    }
    if document.select(&selector(PASSWORD_INPUT_SELECTOR)?).next().is_some() {
        return Ok(SitePage::LoginForm);
    }
    Ok(SitePage::Authenticated)
}

#[derive(Debug, Deserialize)]
struct ExportRow {
    #[serde(alias = "id", alias = "registration_id")]
    external_id: String,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default, alias = "surname")]
    last_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(alias = "stage", alias = "track")]
    stage_id: i64,
}

/// Reads a participant CSV (registration export or a hand-made import file).
/// Rows without an id are skipped; stage validation is left to the import.
pub fn parse_participants_csv<R: io::Read>(reader: R) -> RegistrationResult<Vec<ParticipantImport>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut rows = Vec::new();
    for record in reader.deserialize::<ExportRow>() {
        let row = record?;
        if row.external_id.is_empty() {
            continue;
        }
        rows.push(ParticipantImport {
            external_id: row.external_id,
            first_name: non_empty(row.first_name),
            last_name: non_empty(row.last_name),
            email: non_empty(row.email),
            phone: non_empty(row.phone),
            stage_id: row.stage_id,
        });
    }
    Ok(rows)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
