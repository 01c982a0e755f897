use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::db::QuestDb;

/// CSV exports available to admins over chat, HTTP and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Participants,
    Addresses,
    Promos,
}

impl ExportKind {
    pub const ALL: [ExportKind; 3] = [
        ExportKind::Participants,
        ExportKind::Addresses,
        ExportKind::Promos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportKind::Participants => "participants",
            ExportKind::Addresses => "addresses",
            ExportKind::Promos => "promos",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.csv", self.as_str())
    }
}

impl fmt::Display for ExportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "participants" => Ok(ExportKind::Participants),
            "addresses" => Ok(ExportKind::Addresses),
            "promos" | "promo_codes" => Ok(ExportKind::Promos),
            other => bail!("unknown export '{other}' (expected participants, addresses or promos)"),
        }
    }
}

#[derive(Serialize)]
struct ParticipantRow<'a> {
    id: i64,
    external_id: &'a str,
    first_name: &'a str,
    last_name: &'a str,
    email: &'a str,
    phone: &'a str,
    stage_id: i64,
    created_at: String,
}

#[derive(Serialize)]
struct AddressRow<'a> {
    telegram_id: i64,
    stage: u8,
    address: &'a str,
    updated_at: String,
}

#[derive(Serialize)]
struct PromoRow<'a> {
    code: &'a str,
    status: &'a str,
    used_by: Option<i64>,
    used_at: String,
}

/// Renders one export as CSV bytes with a header row.
pub async fn export_csv(db: &QuestDb, kind: ExportKind) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    match kind {
        ExportKind::Participants => {
            let participants = db.list_participants().await.context("loading participants")?;
            for p in &participants {
                writer.serialize(ParticipantRow {
                    id: p.id,
                    external_id: &p.external_id,
                    first_name: p.first_name.as_deref().unwrap_or_default(),
                    last_name: p.last_name.as_deref().unwrap_or_default(),
                    email: p.email.as_deref().unwrap_or_default(),
                    phone: p.phone.as_deref().unwrap_or_default(),
                    stage_id: p.stage_id,
                    created_at: p.created_at.to_rfc3339(),
                })?;
            }
        }
        ExportKind::Addresses => {
            let addresses = db.list_addresses().await.context("loading addresses")?;
            for a in &addresses {
                writer.serialize(AddressRow {
                    telegram_id: a.telegram_id,
                    stage: a.stage,
                    address: &a.address,
                    updated_at: a.updated_at.to_rfc3339(),
                })?;
            }
        }
        ExportKind::Promos => {
            let codes = db.list_promo_codes().await.context("loading promo codes")?;
            for c in &codes {
                writer.serialize(PromoRow {
                    code: &c.code,
                    status: c.status.as_str(),
                    used_by: c.used_by,
                    used_at: c.used_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                })?;
            }
        }
    }

    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing {kind} export: {}", err.error()))
}
