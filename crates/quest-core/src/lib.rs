//! Core domain model for the run quest: participants, chat identities, verification
//! records, promo codes and the per-user quest session.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod catalog;

pub use catalog::{check_template, fill, render, CommonMessages, HintExhaustion, StageCatalog, StageConfig};

pub const CRATE_NAME: &str = "quest-core";

/// Sentinel the extraction oracle uses for a field it could not read.
pub const NOT_FOUND: &str = "not found";

/// Number of narrative stages a participant can walk through.
pub const STAGE_COUNT: u8 = 4;

/// Participant track that runs all stages back to back.
pub const CHAINED_TRACK: i64 = 5;

/// Date format used for run dates everywhere in the quest (`26.11.2025`).
pub const RUN_DATE_FORMAT: &str = "%d.%m.%Y";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "moderator" => Some(Role::Moderator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    /// Moderators and admins may decide escalated verifications.
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Moderator | Role::Admin)
    }
}

/// Externally pre-registered event entrant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub external_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub stage_id: i64,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    pub fn is_chained(&self) -> bool {
        self.stage_id == CHAINED_TRACK
    }

    pub fn display_name(&self) -> String {
        let parts = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if parts.is_empty() {
            self.external_id.clone()
        } else {
            parts.join(" ")
        }
    }
}

/// Row shape of a bulk participant import (CSV file or registration site export).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantImport {
    pub external_id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    pub stage_id: i64,
}

/// Chat identity, optionally linked to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestUser {
    pub telegram_id: i64,
    pub participant_id: Option<i64>,
    pub username: Option<String>,
    pub role: Role,
    pub current_stage: u8,
    pub stage_completed: [bool; STAGE_COUNT as usize],
}

impl QuestUser {
    pub fn is_stage_completed(&self, stage: u8) -> bool {
        stage_index(stage)
            .map(|idx| self.stage_completed[idx])
            .unwrap_or(false)
    }

    pub fn completed_count(&self) -> usize {
        self.stage_completed.iter().filter(|done| **done).count()
    }

    pub fn label(&self) -> String {
        match &self.username {
            Some(name) => format!("@{name} ({})", self.telegram_id),
            None => self.telegram_id.to_string(),
        }
    }
}

/// Zero-based index of a stage number, `None` outside `1..=4`.
pub fn stage_index(stage: u8) -> Option<usize> {
    (1..=STAGE_COUNT)
        .contains(&stage)
        .then(|| usize::from(stage - 1))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationSource {
    Oracle,
    Moderator,
}

impl VerificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationSource::Oracle => "oracle",
            VerificationSource::Moderator => "moderator",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("moderator") {
            VerificationSource::Moderator
        } else {
            VerificationSource::Oracle
        }
    }
}

/// Latest extraction or moderator outcome for a user. Overwritten on every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub telegram_id: i64,
    pub distance: String,
    pub run_date: String,
    pub passed_date_check: bool,
    pub source: VerificationSource,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub telegram_id: i64,
    pub stage: u8,
    pub address: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromoStatus {
    Active,
    Used,
    Expired,
}

impl PromoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromoStatus::Active => "active",
            PromoStatus::Used => "used",
            PromoStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(PromoStatus::Active),
            "used" => Some(PromoStatus::Used),
            "expired" => Some(PromoStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoCode {
    pub code: String,
    pub status: PromoStatus,
    pub used_by: Option<i64>,
    pub used_at: Option<DateTime<Utc>>,
}

/// Outcome of a promo claim. Exhaustion is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoClaim {
    Claimed(String),
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaffleEntrant {
    pub telegram_id: i64,
    pub raffle_id: String,
    pub joined_at: DateTime<Utc>,
}

/// One-time personalized deep link handed to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantLink {
    pub participant_id: i64,
    pub token: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub claimed_by: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailCampaign {
    pub id: i64,
    pub name: String,
    pub subject: String,
    pub body_template: String,
    pub send_after: DateTime<Utc>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

/// Structured run data read from a tracker screenshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunData {
    pub date: String,
    pub distance: String,
}

impl RunData {
    pub fn new(date: impl Into<String>, distance: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            distance: distance.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(NOT_FOUND, NOT_FOUND)
    }

    /// Both fields must be present and differ from the not-found sentinel.
    pub fn is_usable(&self) -> bool {
        is_found(&self.date) && is_found(&self.distance)
    }
}

fn is_found(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && !value.eq_ignore_ascii_case(NOT_FOUND)
}

pub fn parse_run_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), RUN_DATE_FORMAT).ok()
}

pub fn format_run_date(date: NaiveDate) -> String {
    date.format(RUN_DATE_FORMAT).to_string()
}

/// `run_date >= cutoff`; unparseable dates never pass.
pub fn passes_date_check(run_date: &str, cutoff: NaiveDate) -> bool {
    parse_run_date(run_date).is_some_and(|date| date >= cutoff)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestPhase {
    AwaitingPhoto,
    AwaitingModeratorDecision,
    AwaitingRiddleAnswer,
    AwaitingAddress,
}

/// Per-user session blob; lives for one stage traversal (or one chained run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestSession {
    pub stage: u8,
    pub phase: QuestPhase,
    #[serde(default)]
    pub recognition_attempts: u32,
    #[serde(default)]
    pub attempts_left: u32,
    #[serde(default)]
    pub hint_shown: bool,
    #[serde(default)]
    pub is_chained_participant: bool,
    #[serde(default)]
    pub last_image_path: Option<String>,
}

impl QuestSession {
    pub fn start(stage: u8, is_chained_participant: bool) -> Self {
        Self {
            stage,
            phase: QuestPhase::AwaitingPhoto,
            recognition_attempts: 0,
            attempts_left: 0,
            hint_shown: false,
            is_chained_participant,
            last_image_path: None,
        }
    }

    pub fn enter_riddle(&mut self, attempts: u32) {
        self.phase = QuestPhase::AwaitingRiddleAnswer;
        self.attempts_left = attempts;
        self.hint_shown = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cutoff() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 25).unwrap()
    }

    #[test]
    fn run_data_with_sentinel_is_unusable() {
        assert!(RunData::new("26.11.2025", "10.01 км").is_usable());
        assert!(!RunData::new("26.11.2025", NOT_FOUND).is_usable());
        assert!(!RunData::new("Not Found", "5 км").is_usable());
        assert!(!RunData::new("", "5 км").is_usable());
        assert!(!RunData::not_found().is_usable());
    }

    #[test]
    fn date_check_is_inclusive_of_cutoff() {
        assert!(passes_date_check("25.11.2025", cutoff()));
        assert!(passes_date_check("26.11.2025", cutoff()));
        assert!(!passes_date_check("24.11.2025", cutoff()));
        assert!(!passes_date_check("yesterday", cutoff()));
    }

    #[test]
    fn role_parsing_and_staff() {
        assert_eq!(Role::parse(" Moderator "), Some(Role::Moderator));
        assert_eq!(Role::parse("root"), None);
        assert!(Role::Admin.is_staff());
        assert!(!Role::User.is_staff());
    }

    #[test]
    fn stage_index_bounds() {
        assert_eq!(stage_index(1), Some(0));
        assert_eq!(stage_index(4), Some(3));
        assert_eq!(stage_index(0), None);
        assert_eq!(stage_index(5), None);
    }

    #[test]
    fn session_blob_tolerates_missing_counters() {
        let session: QuestSession =
            serde_json::from_str(r#"{"stage":3,"phase":"awaiting_photo"}"#).unwrap();
        assert_eq!(session, QuestSession::start(3, false));
    }
}
