//! Per-user quest progression engine.
//!
//! The engine is transport-agnostic: the bot adapter turns chat updates into
//! [`Inbound`] events and delivers the returned [`Outbound`] effects in order.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use quest_storage::StorageError;
use thiserror::Error;

pub mod admin;
pub mod engine;
pub mod session;

pub use admin::AdminCommand;
pub use engine::QuestEngine;
pub use session::{InMemorySessionStore, SessionStore};

pub const CRATE_NAME: &str = "quest-engine";

pub const APPROVE_LABEL: &str = "✅ Одобрить";
pub const REJECT_LABEL: &str = "❌ Отклонить";

/// The chat identity an event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub telegram_id: i64,
    pub username: Option<String>,
}

impl Actor {
    pub fn new(telegram_id: i64) -> Self {
        Self {
            telegram_id,
            username: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Photo { bytes: Vec<u8>, extension: String },
    /// Any other attachment (document, sticker, voice, ...).
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, action: CallbackAction) -> Self {
        Self {
            label: label.into(),
            data: action.to_data(),
        }
    }
}

/// A message previously sent by the bot, addressed for editing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text {
        chat_id: i64,
        text: String,
        buttons: Vec<Button>,
    },
    Photo {
        chat_id: i64,
        path: PathBuf,
        caption: String,
        buttons: Vec<Button>,
    },
    /// `asset` is either an URL or a file name under the media directory.
    Video {
        chat_id: i64,
        asset: String,
        caption: Option<String>,
    },
    Document {
        chat_id: i64,
        file_name: String,
        bytes: Vec<u8>,
        caption: Option<String>,
    },
    /// Replace the text (or caption) of an earlier message and drop its buttons.
    Edit { message: MessageRef, text: String },
    /// Callback-query answer shown to the actor as an alert.
    Alert { text: String },
}

impl Outbound {
    pub fn text(chat_id: i64, text: impl Into<String>) -> Self {
        Outbound::Text {
            chat_id,
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn alert(text: impl Into<String>) -> Self {
        Outbound::Alert { text: text.into() }
    }

    pub fn chat_id(&self) -> Option<i64> {
        match self {
            Outbound::Text { chat_id, .. }
            | Outbound::Photo { chat_id, .. }
            | Outbound::Video { chat_id, .. }
            | Outbound::Document { chat_id, .. } => Some(*chat_id),
            Outbound::Edit { message, .. } => Some(message.chat_id),
            Outbound::Alert { .. } => None,
        }
    }
}

/// Inline button payloads. Moderator actions carry the target user, not the moderator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    StartQuest,
    Approve(i64),
    Reject(i64),
}

impl CallbackAction {
    pub fn to_data(&self) -> String {
        match self {
            CallbackAction::StartQuest => "quest:start".to_string(),
            CallbackAction::Approve(target) => format!("mod:approve:{target}"),
            CallbackAction::Reject(target) => format!("mod:reject:{target}"),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        if data == "quest:start" {
            return Some(CallbackAction::StartQuest);
        }
        let (verb, target) = data.strip_prefix("mod:")?.split_once(':')?;
        let target = target.parse().ok()?;
        match verb {
            "approve" => Some(CallbackAction::Approve(target)),
            "reject" => Some(CallbackAction::Reject(target)),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("storing screenshot: {0:#}")]
    Screenshot(anyhow::Error),
    #[error("building export: {0:#}")]
    Export(anyhow::Error),
    #[error("stage {0} is missing from the catalog")]
    UnknownStage(u8),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub screenshots_dir: PathBuf,
    pub oracle_timeout: Duration,
    pub admin_ids: HashSet<i64>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            screenshots_dir: env::var("SCREENSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/screenshots")),
            oracle_timeout: Duration::from_secs(
                env::var("ORACLE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            admin_ids: parse_admin_ids(&env::var("ADMIN_IDS").unwrap_or_default()),
        }
    }
}

/// Comma or whitespace separated telegram ids; junk entries are ignored.
pub fn parse_admin_ids(raw: &str) -> HashSet<i64> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_payloads_round_trip_target() {
        assert_eq!(CallbackAction::parse("mod:approve:42"), Some(CallbackAction::Approve(42)));
        assert_eq!(CallbackAction::parse("mod:reject:-7"), Some(CallbackAction::Reject(-7)));
        assert_eq!(CallbackAction::parse("quest:start"), Some(CallbackAction::StartQuest));
        assert_eq!(CallbackAction::parse("mod:ban:1"), None);
        assert_eq!(CallbackAction::parse("mod:approve:x"), None);
        assert_eq!(CallbackAction::Reject(9).to_data(), "mod:reject:9");
    }

    #[test]
    fn admin_ids_tolerate_spacing_and_junk() {
        let ids = parse_admin_ids("1, 2,,x 3");
        assert_eq!(ids, HashSet::from([1, 2, 3]));
        assert!(parse_admin_ids("").is_empty());
    }
}
