//! Telegram transport for the quest engine.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use quest_engine::{Actor, AdminCommand, Inbound, MessageRef, Outbound, QuestEngine};
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{FileMeta, User};
use teloxide::utils::command::BotCommands;
use thiserror::Error;
use tracing::{info, warn};

pub mod commands;
pub mod deliver;

pub use commands::{admin_command, Command};
pub use deliver::{deliver_all, resolve_asset, AssetSource};

pub const CRATE_NAME: &str = "quest-bot";

/// Telegram serves photos as JPEG.
const PHOTO_EXTENSION: &str = "jpg";

#[derive(Debug, Error)]
pub enum BotError {
    #[error("telegram request failed: {0}")]
    Telegram(#[from] teloxide::RequestError),
    #[error("telegram file download failed: {0}")]
    Download(#[from] teloxide::DownloadError),
}

type HandlerResult = Result<(), BotError>;

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub token: String,
    pub media_dir: PathBuf,
}

impl BotConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            token: env::var("BOT_TOKEN").context("BOT_TOKEN is not set")?,
            media_dir: env::var("MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("media")),
        })
    }
}

struct BotState {
    engine: QuestEngine,
    media_dir: PathBuf,
}

fn actor_of(user: &User) -> Actor {
    let actor = Actor::new(user.id.0 as i64);
    match &user.username {
        Some(username) => actor.with_username(username.clone()),
        None => actor,
    }
}

/// Runs the long-polling dispatcher until ctrl-c.
pub async fn run(config: BotConfig, engine: QuestEngine) -> Result<()> {
    let bot = Bot::new(&config.token);
    if let Err(err) = bot.set_my_commands(Command::bot_commands()).await {
        warn!(error = %err, "could not publish the command list");
    }

    let state = Arc::new(BotState {
        engine,
        media_dir: config.media_dir,
    });

    let message_handler = Update::filter_message()
        .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
        .branch(dptree::endpoint(handle_message));
    let callback_handler = Update::filter_callback_query().endpoint(handle_callback);
    let handler = dptree::entry()
        .branch(message_handler)
        .branch(callback_handler);

    info!("telegram dispatcher starting");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
    info!("telegram dispatcher stopped");
    Ok(())
}

async fn handle_command(
    bot: Bot,
    state: Arc<BotState>,
    msg: Message,
    command: Command,
) -> HandlerResult {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let actor = actor_of(user);
    let chat = actor.telegram_id;
    let engine = &state.engine;

    let effects = match &command {
        Command::Start(token) => engine.start(&actor, Some(token.as_str())).await,
        Command::Quest => engine.begin_quest(&actor).await,
        Command::Help => vec![Outbound::text(chat, Command::descriptions().to_string())],
        Command::Raffle(raffle_id) if raffle_id.trim().is_empty() => {
            vec![Outbound::text(chat, "Использование: /raffle <id>")]
        }
        Command::Raffle(raffle_id) => engine.join_raffle(&actor, raffle_id).await,
        admin => match admin_command(admin) {
            Some(Ok(cmd)) => engine.run_admin(&actor, cmd).await,
            Some(Err(usage)) => vec![Outbound::text(chat, usage)],
            None => Vec::new(),
        },
    };

    deliver_all(&bot, &state.media_dir, effects, false).await;
    Ok(())
}

async fn handle_message(bot: Bot, state: Arc<BotState>, msg: Message) -> HandlerResult {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let actor = actor_of(user);

    if let Some(document) = msg.document() {
        if commands::is_load_promos_caption(msg.caption()) {
            let bytes = download(&bot, &document.file).await?;
            let content = String::from_utf8_lossy(&bytes).into_owned();
            let effects = state
                .engine
                .run_admin(&actor, AdminCommand::LoadPromos { content })
                .await;
            deliver_all(&bot, &state.media_dir, effects, false).await;
            return Ok(());
        }
    }

    let inbound = if let Some(text) = msg.text() {
        Inbound::Text(text.to_string())
    } else if let Some(largest) = msg
        .photo()
        .and_then(|sizes| sizes.iter().max_by_key(|p| p.width * p.height))
    {
        Inbound::Photo {
            bytes: download(&bot, &largest.file).await?,
            extension: PHOTO_EXTENSION.to_string(),
        }
    } else {
        Inbound::Other
    };

    let effects = state.engine.handle_message(&actor, inbound).await;
    deliver_all(&bot, &state.media_dir, effects, false).await;
    Ok(())
}

async fn handle_callback(bot: Bot, state: Arc<BotState>, q: CallbackQuery) -> HandlerResult {
    let actor = actor_of(&q.from);
    let Some(data) = q.data.as_deref() else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };

    let origin = q.regular_message();
    let origin_ref = origin.map(|m| MessageRef {
        chat_id: m.chat.id.0,
        message_id: m.id.0,
    });
    let origin_is_media = origin.is_some_and(|m| m.photo().is_some());

    let effects = state.engine.handle_callback(&actor, data, origin_ref).await;
    let alert = deliver_all(&bot, &state.media_dir, effects, origin_is_media).await;

    let answer = bot.answer_callback_query(q.id.clone());
    match alert {
        Some(text) => answer.text(text).show_alert(true).await?,
        None => answer.await?,
    };
    Ok(())
}

async fn download(bot: &Bot, meta: &FileMeta) -> Result<Vec<u8>, BotError> {
    let file = bot.get_file(meta.id.clone()).await?;
    let mut bytes = Vec::new();
    bot.download_file(&file.path, &mut bytes).await?;
    Ok(bytes)
}
