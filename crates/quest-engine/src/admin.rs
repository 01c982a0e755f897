//! Staff commands issued from chat. Everything here requires the admin role.

use std::fmt::Write as _;

use quest_core::{fill, Role, STAGE_COUNT};
use quest_storage::{export_csv, ExportKind};
use tracing::info;

use crate::engine::{EngineResult, QuestEngine};
use crate::{Actor, EngineError, Outbound};

/// Stage media keys an admin may override.
pub const ASSET_KEYS: [&str; 3] = ["intro_video", "final_video", "final_link"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    DefineStage { id: i64, name: String },
    SetAsset { stage: u8, key: String, value: String },
    /// Promo file content, one code per line.
    LoadPromos { content: String },
    ExpirePromos,
    Export(ExportKind),
    ResetUser { telegram_id: i64 },
    SetRole { telegram_id: i64, role: Role },
    Reassign { external_id: String, stage_id: i64 },
    Stats,
}

impl AdminCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::DefineStage { .. } => "defstage",
            AdminCommand::SetAsset { .. } => "setasset",
            AdminCommand::LoadPromos { .. } => "loadpromos",
            AdminCommand::ExpirePromos => "expirepromos",
            AdminCommand::Export(_) => "export",
            AdminCommand::ResetUser { .. } => "reset",
            AdminCommand::SetRole { .. } => "setrole",
            AdminCommand::Reassign { .. } => "reassign",
            AdminCommand::Stats => "stats",
        }
    }
}

impl QuestEngine {
    pub async fn run_admin(&self, actor: &Actor, command: AdminCommand) -> Vec<Outbound> {
        self.guarded(actor, "admin", self.run_admin_inner(actor, command))
            .await
    }

    async fn run_admin_inner(&self, actor: &Actor, command: AdminCommand) -> EngineResult<Vec<Outbound>> {
        let user = self.ensure_actor(actor).await?;
        let chat = actor.telegram_id;
        if user.role != Role::Admin {
            return Ok(vec![Outbound::text(chat, "Команда доступна только администраторам.")]);
        }
        info!(admin = chat, command = command.name(), "admin command");

        let reply = match command {
            AdminCommand::DefineStage { id, name } => {
                self.db.upsert_stage_definition(id, name.trim()).await?;
                format!("Этап {id} назван «{}».", name.trim())
            }
            AdminCommand::SetAsset { stage, key, value } => {
                if !ASSET_KEYS.contains(&key.as_str()) {
                    format!("Неизвестный ключ {key}. Допустимо: {}.", ASSET_KEYS.join(", "))
                } else if !(1..=STAGE_COUNT).contains(&stage) {
                    format!("Этап должен быть от 1 до {STAGE_COUNT}.")
                } else {
                    self.db.set_stage_asset(stage, &key, value.trim()).await?;
                    format!("Этап {stage}: {key} = {}", value.trim())
                }
            }
            AdminCommand::LoadPromos { content } => {
                let loaded = self.db.load_promo_codes(content.lines()).await?;
                format!("Загружено новых промокодов: {loaded}.")
            }
            AdminCommand::ExpirePromos => {
                let expired = self.db.expire_unclaimed_codes().await?;
                format!("Помечено истёкшими: {expired}.")
            }
            AdminCommand::Export(kind) => {
                let bytes = export_csv(&self.db, kind).await.map_err(EngineError::Export)?;
                return Ok(vec![Outbound::Document {
                    chat_id: chat,
                    file_name: kind.file_name(),
                    bytes,
                    caption: Some(format!("Выгрузка: {kind}")),
                }]);
            }
            AdminCommand::ResetUser { telegram_id } => {
                let found = self.db.reset_user_progress(telegram_id).await?;
                self.sessions.clear(telegram_id).await?;
                if found {
                    format!("Прогресс пользователя {telegram_id} сброшен.")
                } else {
                    format!("Пользователь {telegram_id} не найден.")
                }
            }
            AdminCommand::SetRole { telegram_id, role } => {
                if self.db.set_role(telegram_id, role).await? {
                    format!("Пользователь {telegram_id} теперь {}.", role.as_str())
                } else {
                    format!("Пользователь {telegram_id} не найден.")
                }
            }
            AdminCommand::Reassign { external_id, stage_id } => {
                if self.db.reassign_participant_stage(&external_id, stage_id).await? {
                    format!("Участник {external_id} переведён на трек {stage_id}.")
                } else {
                    format!("Участник {external_id} не найден.")
                }
            }
            AdminCommand::Stats => self.stats_text().await?,
        };

        Ok(vec![Outbound::text(chat, reply)])
    }

    async fn stats_text(&self) -> EngineResult<String> {
        let stats = self.db.stats().await?;
        let stages = self.db.list_stage_definitions().await?;
        let mut text = String::new();
        let _ = writeln!(text, "Участников: {}", stats.participants);
        let _ = writeln!(text, "Пользователей: {} (привязано {})", stats.users, stats.linked_users);
        for (idx, done) in stats.stage_completions.iter().enumerate() {
            let stage = idx as i64 + 1;
            let name = stages
                .iter()
                .find(|s| s.id == stage)
                .map(|s| s.name.as_str())
                .or_else(|| self.catalog.stage(stage as u8).map(|c| c.title.as_str()))
                .unwrap_or("");
            let _ = writeln!(text, "Этап {stage} {name}: {done}");
        }
        let _ = writeln!(text, "Прошли все этапы подряд: {}", stats.chained_finishers);
        let _ = writeln!(text, "Адресов: {}", stats.addresses);
        let _ = write!(
            text,
            "Промокоды: активных {}, выдано {}, истекло {}",
            stats.promos.active, stats.promos.used, stats.promos.expired
        );
        Ok(text)
    }

    /// `/raffle <id>`: opt-in marker, idempotent per (user, raffle).
    pub async fn join_raffle(&self, actor: &Actor, raffle_id: &str) -> Vec<Outbound> {
        self.guarded(actor, "raffle", async {
            self.ensure_actor(actor).await?;
            let raffle_id = raffle_id.trim();
            let messages = &self.catalog.messages;
            let joined = self.db.join_raffle(actor.telegram_id, raffle_id).await?;
            let template = if joined {
                &messages.raffle_joined
            } else {
                &messages.raffle_already_joined
            };
            Ok::<_, EngineError>(vec![Outbound::text(
                actor.telegram_id,
                fill(template, &[("raffle", raffle_id)]),
            )])
        })
        .await
    }
}
