//! Mail campaigns: template rendering, delivery bookkeeping and transports.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minijinja::{context, Environment};
use quest_storage::{HttpClientConfig, MailRecipient, QuestDb, RetryingClient};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, mail: &OutgoingMail) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub relay_url: Option<String>,
    pub relay_token: Option<String>,
    pub from: String,
    pub timeout: Duration,
}

impl MailConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            relay_url: non_empty("MAIL_RELAY_URL"),
            relay_token: non_empty("MAIL_RELAY_TOKEN"),
            from: non_empty("MAIL_FROM").unwrap_or_else(|| "quest@localhost".to_string()),
            timeout: Duration::from_secs(
                env::var("HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

/// Relay when configured, otherwise mail is only logged.
pub fn transport_from_config(config: &MailConfig) -> Result<Arc<dyn MailTransport>> {
    match &config.relay_url {
        Some(url) => Ok(Arc::new(HttpMailRelay::new(
            url,
            config.relay_token.clone(),
            config.timeout,
        )?)),
        None => {
            warn!("MAIL_RELAY_URL is not set; campaign mail will only be logged");
            Ok(Arc::new(LogOnlyMailer))
        }
    }
}

/// JSON POST of [`OutgoingMail`] to an HTTP mail relay, bearer-authenticated.
pub struct HttpMailRelay {
    http: RetryingClient,
    url: String,
    token: Option<String>,
}

impl HttpMailRelay {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = RetryingClient::new(HttpClientConfig {
            timeout,
            ..HttpClientConfig::default()
        })?;
        Ok(Self {
            http,
            url: url.to_string(),
            token,
        })
    }
}

#[async_trait]
impl MailTransport for HttpMailRelay {
    fn name(&self) -> &'static str {
        "http-relay"
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        self.http
            .send("mail_relay", |client| {
                let request = client.post(&self.url).json(mail);
                match &self.token {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            })
            .await
            .with_context(|| format!("relaying mail to {}", mail.to))?;
        Ok(())
    }
}

pub struct LogOnlyMailer;

#[async_trait]
impl MailTransport for LogOnlyMailer {
    fn name(&self) -> &'static str {
        "log-only"
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        info!(to = %mail.to, subject = %mail.subject, "mail logged, not sent");
        Ok(())
    }
}

/// Fills `{{first_name}}`, `{{last_name}}` and `{{quest_link}}`.
pub fn render_template(template: &str, recipient: &MailRecipient) -> Result<String> {
    let participant = &recipient.participant;
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_template("mail", template)
        .map_err(|err| anyhow!("mail template parse error: {err}"))?;
    let tmpl = env
        .get_template("mail")
        .map_err(|err| anyhow!("mail template load error: {err}"))?;
    tmpl.render(context! {
        first_name => participant.first_name.as_deref().unwrap_or_default(),
        last_name => participant.last_name.as_deref().unwrap_or_default(),
        quest_link => recipient.quest_link.as_str(),
    })
    .map_err(|err| anyhow!("mail template render error: {err}"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailPassSummary {
    pub campaigns: usize,
    pub sent: usize,
    pub failed: usize,
}

pub struct MailDispatcher {
    db: QuestDb,
    transport: Arc<dyn MailTransport>,
    from: String,
}

impl MailDispatcher {
    pub fn new(db: QuestDb, transport: Arc<dyn MailTransport>, from: &str) -> Self {
        Self {
            db,
            transport,
            from: from.to_string(),
        }
    }

    /// One pass over campaigns due at `now`. A failed send leaves the recipient
    /// pending for the next pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MailPassSummary> {
        let campaigns = self.db.due_campaigns(now).await.context("loading due campaigns")?;
        let mut summary = MailPassSummary::default();

        for campaign in campaigns {
            let recipients = self
                .db
                .pending_recipients(campaign.id)
                .await
                .with_context(|| format!("loading recipients of campaign {}", campaign.name))?;
            if recipients.is_empty() {
                continue;
            }
            summary.campaigns += 1;

            let mut delivered = 0;
            for recipient in &recipients {
                let rendered = render_template(&campaign.subject, recipient).and_then(|subject| {
                    Ok((subject, render_template(&campaign.body_template, recipient)?))
                });
                let (subject, body) = match rendered {
                    Ok(parts) => parts,
                    Err(err) => {
                        error!(campaign = %campaign.name, error = %err, "campaign template does not render");
                        summary.failed += recipients.len() - delivered;
                        break;
                    }
                };
                let mail = OutgoingMail {
                    from: self.from.clone(),
                    to: recipient.email.clone(),
                    subject,
                    body,
                };
                match self.transport.send(&mail).await {
                    Ok(()) => {
                        self.db
                            .record_delivery(campaign.id, recipient.participant.id)
                            .await
                            .context("recording mail delivery")?;
                        delivered += 1;
                    }
                    Err(err) => {
                        warn!(
                            campaign = %campaign.name,
                            participant = recipient.participant.id,
                            transport = self.transport.name(),
                            error = %err,
                            "mail delivery failed"
                        );
                        summary.failed += 1;
                    }
                }
            }

            if delivered > 0 {
                self.db
                    .touch_campaign(campaign.id, now)
                    .await
                    .context("updating campaign last_sent_at")?;
            }
            summary.sent += delivered;
        }
        Ok(summary)
    }
}
