//! Background loops: personal link generation and mail campaign dispatch.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub mod links;
pub mod mail;

pub use links::{quest_link, LinkGenerator, LinkPassSummary};
pub use mail::{
    render_template, transport_from_config, HttpMailRelay, LogOnlyMailer, MailConfig,
    MailDispatcher, MailPassSummary, MailTransport, OutgoingMail,
};

pub const CRATE_NAME: &str = "quest-sync";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub link_interval: Duration,
    pub mail_interval: Duration,
    pub bot_username: String,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env::var("SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            link_interval: minutes_from_env("LINK_INTERVAL_MINUTES"),
            mail_interval: minutes_from_env("MAIL_INTERVAL_MINUTES"),
            bot_username: env::var("BOT_USERNAME").unwrap_or_else(|_| "run_quest_bot".to_string()),
        }
    }
}

fn minutes_from_env(key: &str) -> Duration {
    let minutes = env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|m| *m > 0)
        .unwrap_or(5);
    Duration::from_secs(minutes * 60)
}

/// Registers both loops on a fresh scheduler. The caller starts it and shuts it
/// down; `None` when scheduling is disabled.
pub async fn build_scheduler(
    config: &SchedulerConfig,
    links: LinkGenerator,
    mail: MailDispatcher,
) -> Result<Option<JobScheduler>> {
    if !config.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let links = Arc::new(links);
    let link_job = Job::new_repeated_async(config.link_interval, move |_uuid, _l| {
        let links = Arc::clone(&links);
        Box::pin(async move {
            match links.run_once().await {
                Ok(summary) if summary.created > 0 => {
                    info!(created = summary.created, raced = summary.raced, "personal links generated")
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "link generation pass failed"),
            }
        })
    })
    .context("creating link generation job")?;
    sched.add(link_job).await.context("adding link generation job")?;

    let mail = Arc::new(mail);
    let mail_job = Job::new_repeated_async(config.mail_interval, move |_uuid, _l| {
        let mail = Arc::clone(&mail);
        Box::pin(async move {
            match mail.run_once(Utc::now()).await {
                Ok(summary) if summary.sent + summary.failed > 0 => info!(
                    campaigns = summary.campaigns,
                    sent = summary.sent,
                    failed = summary.failed,
                    "mail dispatch pass finished"
                ),
                Ok(_) => {}
                Err(err) => error!(error = %err, "mail dispatch pass failed"),
            }
        })
    })
    .context("creating mail dispatch job")?;
    sched.add(mail_job).await.context("adding mail dispatch job")?;

    info!(
        link_interval_secs = config.link_interval.as_secs(),
        mail_interval_secs = config.mail_interval.as_secs(),
        "scheduler jobs registered"
    );
    Ok(Some(sched))
}
