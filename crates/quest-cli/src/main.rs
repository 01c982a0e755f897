use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use quest_bot::BotConfig;
use quest_core::{Role, StageCatalog, StageDefinition};
use quest_engine::{EngineConfig, QuestEngine, SessionStore};
use quest_oracle::OcrLlmOracle;
use quest_registration::{parse_participants_csv, RegistrationClient, RegistrationConfig};
use quest_storage::{export_csv, ExportKind, QuestDb, ScreenshotStore, StorageConfig};
use quest_sync::{
    build_scheduler, transport_from_config, LinkGenerator, MailConfig, MailDispatcher,
    SchedulerConfig,
};
use quest_web::WebConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "quest-cli")]
#[command(about = "Run Quest bot, schedulers and admin tooling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Telegram bot, background schedulers and the admin web surface.
    Run,
    Migrate,
    /// Bulk-import participants from a CSV file.
    ImportParticipants { csv: PathBuf },
    /// Load promo codes, one per line.
    LoadPromos { file: PathBuf },
    /// One link generation pass.
    GenerateLinks,
    /// One mail dispatch pass.
    DispatchMail,
    AddCampaign {
        #[arg(long)]
        name: String,
        #[arg(long)]
        subject: String,
        /// Body template with {{first_name}}, {{last_name}} and {{quest_link}}.
        #[arg(long)]
        body_file: PathBuf,
        /// RFC 3339 timestamp; defaults to now.
        #[arg(long)]
        send_after: Option<String>,
    },
    /// Pull the participant export from the registration site.
    SyncRegistrations {
        #[arg(long)]
        otp: Option<String>,
    },
    Export {
        kind: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    ResetUser { telegram_id: i64 },
    SetRole { telegram_id: i64, role: String },
    /// Admin web surface only.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("quest=info,teloxide=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let db = StorageConfig::from_env().connect().await?;
    let catalog = Arc::new(StageCatalog::from_env()?);
    seed_stages(&db, &catalog).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(db, catalog).await?,
        Commands::Migrate => println!("migrations applied"),
        Commands::ImportParticipants { csv } => {
            let file = std::fs::File::open(&csv).with_context(|| format!("opening {}", csv.display()))?;
            let rows = parse_participants_csv(file).with_context(|| format!("parsing {}", csv.display()))?;
            let summary = db.import_participants(&rows).await?;
            println!("imported: inserted={} skipped={}", summary.inserted, summary.skipped);
        }
        Commands::LoadPromos { file } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let loaded = db.load_promo_codes(content.lines()).await?;
            println!("promo codes loaded: {loaded}");
        }
        Commands::GenerateLinks => {
            let config = SchedulerConfig::from_env();
            let summary = LinkGenerator::new(db, &config.bot_username).run_once().await?;
            println!("links created: {} (raced {})", summary.created, summary.raced);
        }
        Commands::DispatchMail => {
            let summary = mail_dispatcher(db)?.run_once(Utc::now()).await?;
            println!(
                "mail: campaigns={} sent={} failed={}",
                summary.campaigns, summary.sent, summary.failed
            );
        }
        Commands::AddCampaign {
            name,
            subject,
            body_file,
            send_after,
        } => {
            let body = tokio::fs::read_to_string(&body_file)
                .await
                .with_context(|| format!("reading {}", body_file.display()))?;
            quest_core::check_template(&subject).context("campaign subject")?;
            quest_core::check_template(&body).context("campaign body")?;
            let send_after = match send_after {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("parsing --send-after {raw}"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            let id = db.create_campaign(&name, &subject, &body, send_after).await?;
            println!("campaign {id} scheduled for {send_after}");
        }
        Commands::SyncRegistrations { otp } => {
            let config = RegistrationConfig::from_env()?;
            let client = RegistrationClient::new(&config)?;
            let summary =
                quest_registration::sync_participants(&client, &config, &db, otp.as_deref()).await?;
            println!("registrations: inserted={} skipped={}", summary.inserted, summary.skipped);
        }
        Commands::Export { kind, out } => {
            let kind: ExportKind = kind.parse()?;
            let bytes = export_csv(&db, kind).await?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, &bytes)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("{kind} exported to {}", path.display());
                }
                None => print!("{}", String::from_utf8_lossy(&bytes)),
            }
        }
        Commands::ResetUser { telegram_id } => {
            if db.reset_user_progress(telegram_id).await? {
                println!("progress of {telegram_id} reset");
            } else {
                bail!("user {telegram_id} not found");
            }
        }
        Commands::SetRole { telegram_id, role } => {
            let Some(role) = Role::parse(&role) else {
                bail!("unknown role '{role}' (expected user, moderator or admin)");
            };
            db.ensure_user(telegram_id, None, role).await?;
            db.set_role(telegram_id, role).await?;
            println!("{telegram_id} is now {}", role.as_str());
        }
        Commands::Serve => quest_web::serve(WebConfig::from_env(), db, catalog).await?,
    }

    Ok(())
}

async fn seed_stages(db: &QuestDb, catalog: &StageCatalog) -> Result<()> {
    let definitions: Vec<StageDefinition> = catalog
        .stages
        .iter()
        .map(|s| StageDefinition {
            id: i64::from(s.stage),
            name: s.title.clone(),
        })
        .collect();
    db.seed_stage_definitions(&definitions)
        .await
        .context("seeding stage definitions")
}

fn mail_dispatcher(db: QuestDb) -> Result<MailDispatcher> {
    let config = MailConfig::from_env();
    let transport = transport_from_config(&config)?;
    Ok(MailDispatcher::new(db, transport, &config.from))
}

async fn run(db: QuestDb, catalog: Arc<StageCatalog>) -> Result<()> {
    let bot_config = BotConfig::from_env()?;
    let engine_config = EngineConfig::from_env();
    let oracle = Arc::new(OcrLlmOracle::from_env()?);
    let sessions: Arc<dyn SessionStore> = Arc::new(db.clone());
    let engine = QuestEngine::new(
        db.clone(),
        sessions,
        oracle,
        ScreenshotStore::new(&engine_config.screenshots_dir),
        Arc::clone(&catalog),
    )
    .with_oracle_timeout(engine_config.oracle_timeout)
    .with_admin_ids(engine_config.admin_ids);

    let scheduler_config = SchedulerConfig::from_env();
    let links = LinkGenerator::new(db.clone(), &scheduler_config.bot_username);
    let mut scheduler = build_scheduler(&scheduler_config, links, mail_dispatcher(db.clone())?).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let web = tokio::spawn(quest_web::serve(WebConfig::from_env(), db, catalog));

    info!("run quest starting");
    let outcome = quest_bot::run(bot_config, engine).await;

    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    web.abort();
    info!("run quest stopped");
    outcome
}
