//! Stage catalog: riddles, narrative texts, media assets and quest-wide policy,
//! loaded from YAML.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use minijinja::Environment;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{parse_run_date, STAGE_COUNT};

const EMBEDDED_CATALOG: &str = include_str!("../quest.yaml");

/// What happens when the single post-hint attempt is also wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HintExhaustion {
    /// Show the hint again and grant one more attempt.
    #[default]
    RepeatHint,
    /// Drop the session; the user has to start the stage over.
    ResetStage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageCatalog {
    #[serde(deserialize_with = "deserialize_run_date")]
    pub date_cutoff: NaiveDate,
    #[serde(default = "default_riddle_attempts")]
    pub riddle_attempts: u32,
    #[serde(default = "default_recognition_attempts")]
    pub recognition_attempts: u32,
    #[serde(default = "default_min_address_chars")]
    pub min_address_chars: usize,
    #[serde(default)]
    pub after_hint_exhausted: HintExhaustion,
    #[serde(default = "default_true")]
    pub accept_answer_while_pending: bool,
    pub moderator_placeholder_distance: String,
    pub messages: CommonMessages,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommonMessages {
    pub welcome: String,
    pub start_button: String,
    pub link_claimed_by_other: String,
    pub not_linked: String,
    pub no_active_stage: String,
    pub stage_already_completed: String,
    pub quest_finished: String,
    pub photo_only: String,
    pub photo_retry: String,
    pub photo_failed: String,
    pub escalated: String,
    pub waiting_for_moderator: String,
    pub already_submitted: String,
    pub moderator_notification: String,
    pub moderator_approved_note: String,
    pub moderator_rejected_note: String,
    pub moderator_already_handled: String,
    pub not_authorized: String,
    pub rejected: String,
    pub wrong_answer: String,
    pub hint: String,
    pub riddle_reset: String,
    pub address_too_short: String,
    pub promo_claimed: String,
    pub promo_exhausted: String,
    pub chain_finished: String,
    pub raffle_joined: String,
    pub raffle_already_joined: String,
    pub generic_error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub stage: u8,
    pub title: String,
    pub intro_text: String,
    pub photo_prompt: String,
    pub riddle_prompt: String,
    pub riddle_answer: String,
    pub hint_text: String,
    pub riddle_solved_text: String,
    pub closing_text: String,
    #[serde(default)]
    pub relic_text: Option<String>,
    #[serde(default)]
    pub intro_video: Option<String>,
    #[serde(default)]
    pub final_video: Option<String>,
    #[serde(default)]
    pub final_link: Option<String>,
    #[serde(default = "default_true")]
    pub moderator_escalation: bool,
}

impl StageConfig {
    /// Trimmed, case-insensitive comparison with the stage answer.
    pub fn is_correct_answer(&self, text: &str) -> bool {
        text.trim().to_lowercase() == self.riddle_answer.trim().to_lowercase()
    }
}

fn default_riddle_attempts() -> u32 {
    3
}

fn default_recognition_attempts() -> u32 {
    3
}

fn default_min_address_chars() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn deserialize_run_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_run_date(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid date {raw:?}, expected dd.mm.yyyy")))
}

impl StageCatalog {
    /// Catalog shipped with the binary.
    pub fn embedded() -> Result<Self> {
        Self::from_yaml_str(EMBEDDED_CATALOG).context("parsing embedded quest.yaml")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Reads `QUEST_CATALOG_PATH` when set, the embedded catalog otherwise.
    pub fn from_env() -> Result<Self> {
        match std::env::var("QUEST_CATALOG_PATH") {
            Ok(path) if !path.trim().is_empty() => Self::load(path.trim()),
            _ => Self::embedded(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let catalog: StageCatalog = serde_yaml::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn stage(&self, stage: u8) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    fn validate(&self) -> Result<()> {
        for stage in 1..=STAGE_COUNT {
            let count = self.stages.iter().filter(|s| s.stage == stage).count();
            if count != 1 {
                bail!("stage {stage} must be defined exactly once, found {count}");
            }
        }
        if let Some(extra) = self.stages.iter().find(|s| s.stage == 0 || s.stage > STAGE_COUNT) {
            bail!("unknown stage number {}", extra.stage);
        }
        if self.riddle_attempts == 0 || self.recognition_attempts == 0 {
            bail!("riddle_attempts and recognition_attempts must be positive");
        }
        let messages = serde_json::to_value(&self.messages).context("inspecting messages")?;
        if let Some(fields) = messages.as_object() {
            for (key, text) in fields {
                if let Some(text) = text.as_str() {
                    check_template(text).with_context(|| format!("message '{key}'"))?;
                }
            }
        }
        Ok(())
    }
}

fn environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env
}

/// Compiles a `{{ name }}` template without rendering it.
pub fn check_template(template: &str) -> Result<()> {
    environment()
        .template_from_str(template)
        .map(|_| ())
        .map_err(|err| anyhow::anyhow!("template parse error: {err}"))
}

/// Renders `{{ name }}` placeholders. Substituted values are never expanded again.
pub fn render(template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut env = environment();
    env.add_template("text", template)
        .map_err(|err| anyhow::anyhow!("template parse error: {err}"))?;
    let context: BTreeMap<&str, &str> = vars.iter().copied().collect();
    env.get_template("text")
        .and_then(|tmpl| tmpl.render(context))
        .map_err(|err| anyhow::anyhow!("template render error: {err}"))
}

/// [`render`] for catalog texts, which are checked at load; an ad-hoc template
/// that fails to render comes back as written.
pub fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    render(template, vars).unwrap_or_else(|_| template.to_string())
}
