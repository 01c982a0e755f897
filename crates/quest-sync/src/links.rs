use anyhow::{Context, Result};
use quest_storage::QuestDb;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkPassSummary {
    pub created: usize,
    /// Participants linked by a concurrent pass between scan and insert.
    pub raced: usize,
}

/// Deep link that opens the bot with `/start <token>`.
pub fn quest_link(bot_username: &str, token: &str) -> String {
    format!("https://t.me/{}?start={token}", bot_username.trim_start_matches('@'))
}

#[derive(Debug, Clone)]
pub struct LinkGenerator {
    db: QuestDb,
    bot_username: String,
}

impl LinkGenerator {
    pub fn new(db: QuestDb, bot_username: &str) -> Self {
        Self {
            db,
            bot_username: bot_username.to_string(),
        }
    }

    pub async fn run_once(&self) -> Result<LinkPassSummary> {
        let pending = self
            .db
            .participants_without_link()
            .await
            .context("listing participants without a link")?;

        let mut summary = LinkPassSummary::default();
        for participant in pending {
            let token = Uuid::new_v4().simple().to_string();
            let url = quest_link(&self.bot_username, &token);
            let inserted = self
                .db
                .insert_link(participant.id, &token, &url)
                .await
                .with_context(|| format!("linking participant {}", participant.external_id))?;
            if inserted {
                summary.created += 1;
            } else {
                debug!(participant = participant.id, "participant linked concurrently");
                summary.raced += 1;
            }
        }
        Ok(summary)
    }
}
