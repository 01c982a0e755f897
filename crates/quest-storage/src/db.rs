use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use quest_core::{
    stage_index, Address, MailCampaign, Participant, ParticipantImport, ParticipantLink,
    PromoClaim, PromoCode, PromoStatus, QuestSession, QuestUser, RaffleEntrant, Role,
    StageDefinition, VerificationRecord, VerificationSource, CHAINED_TRACK, STAGE_COUNT,
};
use serde::Serialize;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] MigrateError),
    #[error("session blob is not valid JSON: {0}")]
    Session(#[from] serde_json::Error),
    #[error("stored row is inconsistent: {0}")]
    Corrupt(String),
    #[error("invalid input: {0}")]
    Invalid(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkClaim {
    Linked(Participant),
    AlreadyClaimed,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PromoCounts {
    pub active: i64,
    pub used: i64,
    pub expired: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuestStats {
    pub participants: i64,
    pub users: i64,
    pub linked_users: i64,
    pub stage_completions: [i64; STAGE_COUNT as usize],
    pub chained_finishers: i64,
    pub addresses: i64,
    pub promos: PromoCounts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailRecipient {
    pub participant: Participant,
    pub email: String,
    pub quest_link: String,
}

/// Row-level persistence facade over the quest SQLite database.
#[derive(Debug, Clone)]
pub struct QuestDb {
    pool: SqlitePool,
}

impl QuestDb {
    /// Opens (creating if needed) the database at `url` and applies migrations.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!(url, "quest database ready");
        Ok(db)
    }

    /// Single-connection in-memory database; every pooled connection would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> StorageResult<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Creates the chat identity on first contact. `role` only applies to new rows;
    /// an existing username is kept when the update carries none.
    pub async fn ensure_user(
        &self,
        telegram_id: i64,
        username: Option<&str>,
        role: Role,
    ) -> StorageResult<QuestUser> {
        sqlx::query(
            r#"
            INSERT INTO users (telegram_id, username, role, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(telegram_id) DO UPDATE
               SET username = COALESCE(excluded.username, users.username)
            "#,
        )
        .bind(telegram_id)
        .bind(username)
        .bind(role.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_user(telegram_id)
            .await?
            .ok_or_else(|| StorageError::Corrupt(format!("user {telegram_id} vanished after upsert")))
    }

    pub async fn get_user(&self, telegram_id: i64) -> StorageResult<Option<QuestUser>> {
        let row = sqlx::query(&format!("{USER_COLUMNS} WHERE telegram_id = ?"))
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn set_role(&self, telegram_id: i64, role: Role) -> StorageResult<bool> {
        let result = sqlx::query("UPDATE users SET role = ? WHERE telegram_id = ?")
            .bind(role.as_str())
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Moderators and admins, the recipients of escalated verifications.
    pub async fn list_staff(&self) -> StorageResult<Vec<QuestUser>> {
        let rows = sqlx::query(&format!(
            "{USER_COLUMNS} WHERE role IN ('moderator', 'admin') ORDER BY telegram_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    /// Bulk insert; an `external_id` that already exists is never overwritten.
    pub async fn import_participants(
        &self,
        rows: &[ParticipantImport],
    ) -> StorageResult<ImportSummary> {
        if let Some(bad) = rows
            .iter()
            .find(|row| !(1..=CHAINED_TRACK).contains(&row.stage_id) || row.external_id.trim().is_empty())
        {
            return Err(StorageError::Invalid(format!(
                "participant '{}' has stage_id {} (expected 1..={CHAINED_TRACK}) or an empty id",
                bad.external_id, bad.stage_id
            )));
        }

        let now = Utc::now();
        let mut summary = ImportSummary::default();
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO participants (external_id, first_name, last_name, email, phone, stage_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(external_id) DO NOTHING
                "#,
            )
            .bind(row.external_id.trim())
            .bind(row.first_name.as_deref())
            .bind(row.last_name.as_deref())
            .bind(row.email.as_deref())
            .bind(row.phone.as_deref())
            .bind(row.stage_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                summary.inserted += 1;
            } else {
                summary.skipped += 1;
            }
        }
        tx.commit().await?;

        debug!(inserted = summary.inserted, skipped = summary.skipped, "participants imported");
        Ok(summary)
    }

    pub async fn participant(&self, id: i64) -> StorageResult<Option<Participant>> {
        let row = sqlx::query(&format!("{PARTICIPANT_COLUMNS} WHERE p.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    pub async fn participant_for_user(&self, telegram_id: i64) -> StorageResult<Option<Participant>> {
        let row = sqlx::query(&format!(
            "{PARTICIPANT_COLUMNS} JOIN users u ON u.participant_id = p.id WHERE u.telegram_id = ?"
        ))
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    pub async fn reassign_participant_stage(
        &self,
        external_id: &str,
        stage_id: i64,
    ) -> StorageResult<bool> {
        if !(1..=CHAINED_TRACK).contains(&stage_id) {
            return Err(StorageError::Invalid(format!(
                "stage_id {stage_id} is outside 1..={CHAINED_TRACK}"
            )));
        }
        let result = sqlx::query("UPDATE participants SET stage_id = ? WHERE external_id = ?")
            .bind(stage_id)
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_participants(&self) -> StorageResult<Vec<Participant>> {
        let rows = sqlx::query(&format!("{PARTICIPANT_COLUMNS} ORDER BY p.id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(participant_from_row).collect()
    }

    pub async fn participants_without_link(&self) -> StorageResult<Vec<Participant>> {
        let rows = sqlx::query(&format!(
            r#"{PARTICIPANT_COLUMNS}
             WHERE NOT EXISTS (SELECT 1 FROM participant_links l WHERE l.participant_id = p.id)
             ORDER BY p.id"#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(participant_from_row).collect()
    }

    /// `INSERT OR IGNORE`: a concurrent pass that already linked the participant wins.
    pub async fn insert_link(&self, participant_id: i64, token: &str, url: &str) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO participant_links (participant_id, token, url, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(participant_id)
        .bind(token)
        .bind(url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn link_for_participant(&self, participant_id: i64) -> StorageResult<Option<ParticipantLink>> {
        let row = sqlx::query(
            r#"
            SELECT participant_id, token, url, created_at, claimed_by
              FROM participant_links
             WHERE participant_id = ?
            "#,
        )
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(link_from_row).transpose()
    }

    /// Binds the chat identity to the participant behind `token`. A token is
    /// good for one chat identity only; re-claiming by the same identity is a no-op.
    pub async fn claim_link(&self, token: &str, telegram_id: i64) -> StorageResult<LinkClaim> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT participant_id, claimed_by FROM participant_links WHERE token = ?")
            .bind(token)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(LinkClaim::Unknown);
        };
        let participant_id: i64 = row.try_get("participant_id")?;
        let claimed_by: Option<i64> = row.try_get("claimed_by")?;

        match claimed_by {
            Some(owner) if owner != telegram_id => return Ok(LinkClaim::AlreadyClaimed),
            Some(_) => {}
            None => {
                let result = sqlx::query(
                    "UPDATE participant_links SET claimed_by = ? WHERE token = ? AND claimed_by IS NULL",
                )
                .bind(telegram_id)
                .bind(token)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Ok(LinkClaim::AlreadyClaimed);
                }
            }
        }

        sqlx::query("UPDATE users SET participant_id = ? WHERE telegram_id = ?")
            .bind(participant_id)
            .bind(telegram_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.participant(participant_id)
            .await?
            .map(LinkClaim::Linked)
            .ok_or_else(|| StorageError::Corrupt(format!("link points at missing participant {participant_id}")))
    }

    pub async fn upsert_stage_definition(&self, id: i64, name: &str) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO stages (id, name) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts missing stage rows without touching names an admin already edited.
    pub async fn seed_stage_definitions(&self, stages: &[StageDefinition]) -> StorageResult<()> {
        for stage in stages {
            sqlx::query("INSERT OR IGNORE INTO stages (id, name) VALUES (?, ?)")
                .bind(stage.id)
                .bind(&stage.name)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn list_stage_definitions(&self) -> StorageResult<Vec<StageDefinition>> {
        let rows = sqlx::query("SELECT id, name FROM stages ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StorageResult<StageDefinition> {
                Ok(StageDefinition {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    pub async fn set_stage_asset(&self, stage: u8, key: &str, value: &str) -> StorageResult<()> {
        checked_stage(stage)?;
        sqlx::query(
            r#"
            INSERT INTO stage_assets (stage_id, asset_key, value) VALUES (?, ?, ?)
            ON CONFLICT(stage_id, asset_key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(i64::from(stage))
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stage_asset(&self, stage: u8, key: &str) -> StorageResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM stage_assets WHERE stage_id = ? AND asset_key = ?")
            .bind(i64::from(stage))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Sets `stage_N_completed`; returns whether the flag flipped on this call.
    pub async fn mark_stage_completed(&self, telegram_id: i64, stage: u8) -> StorageResult<bool> {
        checked_stage(stage)?;
        let sql = format!(
            "UPDATE users SET stage_{stage}_completed = 1 WHERE telegram_id = ? AND stage_{stage}_completed = 0"
        );
        let result = sqlx::query(&sql).bind(telegram_id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves `current_stage` forward; never backwards.
    pub async fn advance_current_stage(&self, telegram_id: i64, stage: u8) -> StorageResult<bool> {
        checked_stage(stage)?;
        let result = sqlx::query(
            "UPDATE users SET current_stage = ? WHERE telegram_id = ? AND current_stage < ?",
        )
        .bind(i64::from(stage))
        .bind(telegram_id)
        .bind(i64::from(stage))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The one sanctioned rollback: clears completion flags, stage pointer and session.
    pub async fn reset_user_progress(&self, telegram_id: i64) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE users
               SET current_stage = 1,
                   stage_1_completed = 0,
                   stage_2_completed = 0,
                   stage_3_completed = 0,
                   stage_4_completed = 0
             WHERE telegram_id = ?
            "#,
        )
        .bind(telegram_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM sessions WHERE telegram_id = ?")
            .bind(telegram_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn upsert_verification(&self, record: &VerificationRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO verifications (telegram_id, distance, run_date, passed_date_check, source, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(telegram_id) DO UPDATE
               SET distance = excluded.distance,
                   run_date = excluded.run_date,
                   passed_date_check = excluded.passed_date_check,
                   source = excluded.source,
                   updated_at = excluded.updated_at
            "#,
        )
        .bind(record.telegram_id)
        .bind(&record.distance)
        .bind(&record.run_date)
        .bind(record.passed_date_check)
        .bind(record.source.as_str())
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_verification(&self, telegram_id: i64) -> StorageResult<Option<VerificationRecord>> {
        let row = sqlx::query(
            r#"
            SELECT telegram_id, distance, run_date, passed_date_check, source, updated_at
              FROM verifications
             WHERE telegram_id = ?
            "#,
        )
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> StorageResult<VerificationRecord> {
            let source: String = row.try_get("source")?;
            Ok(VerificationRecord {
                telegram_id: row.try_get("telegram_id")?,
                distance: row.try_get("distance")?,
                run_date: row.try_get("run_date")?,
                passed_date_check: row.try_get("passed_date_check")?,
                source: VerificationSource::parse(&source),
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    /// One address per (user, stage); resubmission replaces the previous text.
    pub async fn upsert_address(&self, telegram_id: i64, stage: u8, address: &str) -> StorageResult<()> {
        checked_stage(stage)?;
        sqlx::query(
            r#"
            INSERT INTO addresses (telegram_id, stage, address, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(telegram_id, stage) DO UPDATE
               SET address = excluded.address,
                   updated_at = excluded.updated_at
            "#,
        )
        .bind(telegram_id)
        .bind(i64::from(stage))
        .bind(address)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn addresses_for_user(&self, telegram_id: i64) -> StorageResult<Vec<Address>> {
        let rows = sqlx::query(
            "SELECT telegram_id, stage, address, updated_at FROM addresses WHERE telegram_id = ? ORDER BY stage",
        )
        .bind(telegram_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(address_from_row).collect()
    }

    pub async fn list_addresses(&self) -> StorageResult<Vec<Address>> {
        let rows = sqlx::query(
            "SELECT telegram_id, stage, address, updated_at FROM addresses ORDER BY telegram_id, stage",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(address_from_row).collect()
    }

    /// Loads codes as `active`; blank lines and codes already present are skipped.
    pub async fn load_promo_codes<'a, I>(&self, codes: I) -> StorageResult<u64>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;
        for code in codes.into_iter().map(str::trim).filter(|c| !c.is_empty()) {
            let result = sqlx::query("INSERT OR IGNORE INTO promo_codes (code, status) VALUES (?, 'active')")
                .bind(code)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Hands out at most one code per user. The conditional update is the arbiter
    /// between concurrent claimers; losing a race moves on to the next candidate.
    pub async fn claim_promo_code(&self, telegram_id: i64) -> StorageResult<PromoClaim> {
        let held: Option<String> = sqlx::query_scalar("SELECT code FROM promo_codes WHERE used_by = ? LIMIT 1")
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(code) = held {
            return Ok(PromoClaim::Claimed(code));
        }

        loop {
            let candidate: Option<String> = sqlx::query_scalar(
                "SELECT code FROM promo_codes WHERE status = 'active' AND used_by IS NULL ORDER BY rowid LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;
            let Some(code) = candidate else {
                return Ok(PromoClaim::Exhausted);
            };

            let result = sqlx::query(
                r#"
                UPDATE promo_codes
                   SET status = 'used', used_by = ?, used_at = ?
                 WHERE code = ? AND status = 'active' AND used_by IS NULL
                "#,
            )
            .bind(telegram_id)
            .bind(Utc::now())
            .bind(&code)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(PromoClaim::Claimed(code));
            }
            debug!(%code, "promo code taken concurrently; trying next");
        }
    }

    /// The only path to `expired`.
    pub async fn expire_unclaimed_codes(&self) -> StorageResult<u64> {
        let result = sqlx::query("UPDATE promo_codes SET status = 'expired' WHERE status = 'active' AND used_by IS NULL")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_promo_codes(&self) -> StorageResult<Vec<PromoCode>> {
        let rows = sqlx::query("SELECT code, status, used_by, used_at FROM promo_codes ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StorageResult<PromoCode> {
                let status: String = row.try_get("status")?;
                Ok(PromoCode {
                    code: row.try_get("code")?,
                    status: PromoStatus::parse(&status)
                        .ok_or_else(|| StorageError::Corrupt(format!("promo status '{status}'")))?,
                    used_by: row.try_get("used_by")?,
                    used_at: row.try_get("used_at")?,
                })
            })
            .collect()
    }

    pub async fn promo_counts(&self) -> StorageResult<PromoCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM promo_codes GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = PromoCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match PromoStatus::parse(&status) {
                Some(PromoStatus::Active) => counts.active = n,
                Some(PromoStatus::Used) => counts.used = n,
                Some(PromoStatus::Expired) => counts.expired = n,
                None => return Err(StorageError::Corrupt(format!("promo status '{status}'"))),
            }
        }
        Ok(counts)
    }

    pub async fn join_raffle(&self, telegram_id: i64, raffle_id: &str) -> StorageResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO raffle_entrants (telegram_id, raffle_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(telegram_id)
        .bind(raffle_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn raffle_entrants(&self, raffle_id: &str) -> StorageResult<Vec<RaffleEntrant>> {
        let rows = sqlx::query(
            "SELECT telegram_id, raffle_id, joined_at FROM raffle_entrants WHERE raffle_id = ? ORDER BY joined_at",
        )
        .bind(raffle_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StorageResult<RaffleEntrant> {
                Ok(RaffleEntrant {
                    telegram_id: row.try_get("telegram_id")?,
                    raffle_id: row.try_get("raffle_id")?,
                    joined_at: row.try_get("joined_at")?,
                })
            })
            .collect()
    }

    pub async fn load_session(&self, telegram_id: i64) -> StorageResult<Option<QuestSession>> {
        let blob: Option<String> = sqlx::query_scalar("SELECT state_json FROM sessions WHERE telegram_id = ?")
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await?;
        blob.map(|json| serde_json::from_str(&json).map_err(StorageError::from))
            .transpose()
    }

    pub async fn save_session(&self, telegram_id: i64, session: &QuestSession) -> StorageResult<()> {
        let json = serde_json::to_string(session)?;
        sqlx::query(
            r#"
            INSERT INTO sessions (telegram_id, state_json, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(telegram_id) DO UPDATE
               SET state_json = excluded.state_json,
                   updated_at = excluded.updated_at
            "#,
        )
        .bind(telegram_id)
        .bind(json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_session(&self, telegram_id: i64) -> StorageResult<()> {
        sqlx::query("DELETE FROM sessions WHERE telegram_id = ?")
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_campaign(
        &self,
        name: &str,
        subject: &str,
        body_template: &str,
        send_after: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO mail_campaigns (name, subject, body_template, send_after)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(subject)
        .bind(body_template)
        .bind(send_after)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn due_campaigns(&self, now: DateTime<Utc>) -> StorageResult<Vec<MailCampaign>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, subject, body_template, send_after, last_sent_at
              FROM mail_campaigns
             WHERE send_after <= ?
             ORDER BY id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StorageResult<MailCampaign> {
                Ok(MailCampaign {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    subject: row.try_get("subject")?,
                    body_template: row.try_get("body_template")?,
                    send_after: row.try_get("send_after")?,
                    last_sent_at: row.try_get("last_sent_at")?,
                })
            })
            .collect()
    }

    /// Linked participants with an email who have not received `campaign_id` yet.
    pub async fn pending_recipients(&self, campaign_id: i64) -> StorageResult<Vec<MailRecipient>> {
        let rows = sqlx::query(&format!(
            r#"{PARTICIPANT_COLUMNS_WITH_LINK}
             WHERE p.email IS NOT NULL AND TRIM(p.email) <> ''
               AND NOT EXISTS (
                   SELECT 1 FROM mail_deliveries d
                    WHERE d.campaign_id = ? AND d.participant_id = p.id
               )
             ORDER BY p.id"#
        ))
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StorageResult<MailRecipient> {
                let participant = participant_from_row(row)?;
                let quest_link: String = row.try_get("link_url")?;
                let email = participant.email.clone().unwrap_or_default();
                Ok(MailRecipient {
                    participant,
                    email,
                    quest_link,
                })
            })
            .collect()
    }

    pub async fn record_delivery(&self, campaign_id: i64, participant_id: i64) -> StorageResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO mail_deliveries (campaign_id, participant_id, sent_at) VALUES (?, ?, ?)",
        )
        .bind(campaign_id)
        .bind(participant_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_campaign(&self, campaign_id: i64, sent_at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE mail_campaigns SET last_sent_at = ? WHERE id = ?")
            .bind(sent_at)
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> StorageResult<QuestStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM participants) AS participants,
                (SELECT COUNT(*) FROM users) AS users,
                (SELECT COUNT(*) FROM users WHERE participant_id IS NOT NULL) AS linked_users,
                (SELECT COUNT(*) FROM users WHERE stage_1_completed = 1) AS stage_1,
                (SELECT COUNT(*) FROM users WHERE stage_2_completed = 1) AS stage_2,
                (SELECT COUNT(*) FROM users WHERE stage_3_completed = 1) AS stage_3,
                (SELECT COUNT(*) FROM users WHERE stage_4_completed = 1) AS stage_4,
                (SELECT COUNT(*) FROM users u JOIN participants p ON p.id = u.participant_id
                  WHERE p.stage_id = 5 AND u.stage_4_completed = 1) AS chained_finishers,
                (SELECT COUNT(*) FROM addresses) AS addresses
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QuestStats {
            participants: row.try_get("participants")?,
            users: row.try_get("users")?,
            linked_users: row.try_get("linked_users")?,
            stage_completions: [
                row.try_get("stage_1")?,
                row.try_get("stage_2")?,
                row.try_get("stage_3")?,
                row.try_get("stage_4")?,
            ],
            chained_finishers: row.try_get("chained_finishers")?,
            addresses: row.try_get("addresses")?,
            promos: self.promo_counts().await?,
        })
    }
}

const USER_COLUMNS: &str = r#"
    SELECT telegram_id, participant_id, username, role, current_stage,
           stage_1_completed, stage_2_completed, stage_3_completed, stage_4_completed
      FROM users"#;

const PARTICIPANT_COLUMNS: &str = r#"
    SELECT p.id, p.external_id, p.first_name, p.last_name, p.email, p.phone, p.stage_id, p.created_at
      FROM participants p"#;

const PARTICIPANT_COLUMNS_WITH_LINK: &str = r#"
    SELECT p.id, p.external_id, p.first_name, p.last_name, p.email, p.phone, p.stage_id, p.created_at,
           l.url AS link_url
      FROM participants p
      JOIN participant_links l ON l.participant_id = p.id"#;

fn checked_stage(stage: u8) -> StorageResult<()> {
    stage_index(stage)
        .map(|_| ())
        .ok_or_else(|| StorageError::Invalid(format!("stage {stage} is outside 1..={STAGE_COUNT}")))
}

fn stage_from_column(value: i64) -> StorageResult<u8> {
    u8::try_from(value)
        .ok()
        .filter(|stage| stage_index(*stage).is_some())
        .ok_or_else(|| StorageError::Corrupt(format!("stage value {value}")))
}

fn user_from_row(row: &SqliteRow) -> StorageResult<QuestUser> {
    let role: String = row.try_get("role")?;
    let current_stage: i64 = row.try_get("current_stage")?;
    Ok(QuestUser {
        telegram_id: row.try_get("telegram_id")?,
        participant_id: row.try_get("participant_id")?,
        username: row.try_get("username")?,
        role: Role::parse(&role).ok_or_else(|| StorageError::Corrupt(format!("role '{role}'")))?,
        current_stage: stage_from_column(current_stage)?,
        stage_completed: [
            row.try_get("stage_1_completed")?,
            row.try_get("stage_2_completed")?,
            row.try_get("stage_3_completed")?,
            row.try_get("stage_4_completed")?,
        ],
    })
}

fn participant_from_row(row: &SqliteRow) -> StorageResult<Participant> {
    Ok(Participant {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        stage_id: row.try_get("stage_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn link_from_row(row: &SqliteRow) -> StorageResult<ParticipantLink> {
    Ok(ParticipantLink {
        participant_id: row.try_get("participant_id")?,
        token: row.try_get("token")?,
        url: row.try_get("url")?,
        created_at: row.try_get("created_at")?,
        claimed_by: row.try_get("claimed_by")?,
    })
}

fn address_from_row(row: &SqliteRow) -> StorageResult<Address> {
    let stage: i64 = row.try_get("stage")?;
    Ok(Address {
        telegram_id: row.try_get("telegram_id")?,
        stage: stage_from_column(stage)?,
        address: row.try_get("address")?,
        updated_at: row.try_get("updated_at")?,
    })
}
