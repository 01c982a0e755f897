//! Turns engine effects into Telegram requests.

use std::path::{Path, PathBuf};

use quest_engine::{Button, Outbound};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId};
use tracing::warn;

/// Where a video asset comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    Url(reqwest::Url),
    File(PathBuf),
}

pub fn resolve_asset(media_dir: &Path, asset: &str) -> AssetSource {
    let asset = asset.trim();
    if asset.starts_with("http://") || asset.starts_with("https://") {
        if let Ok(url) = asset.parse() {
            return AssetSource::Url(url);
        }
    }
    AssetSource::File(media_dir.join(asset))
}

fn input_file(source: AssetSource) -> InputFile {
    match source {
        AssetSource::Url(url) => InputFile::url(url),
        AssetSource::File(path) => InputFile::file(path),
    }
}

/// One row per two buttons.
pub fn keyboard(buttons: &[Button]) -> Option<InlineKeyboardMarkup> {
    if buttons.is_empty() {
        return None;
    }
    let rows = buttons
        .chunks(2)
        .map(|row| {
            row.iter()
                .map(|b| InlineKeyboardButton::callback(b.label.clone(), b.data.clone()))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    Some(InlineKeyboardMarkup::new(rows))
}

/// Sends effects in order. A failed send is logged and does not stop the rest,
/// so one unreachable moderator cannot block the others. Returns the alert text
/// to attach to the callback answer, if any.
pub async fn deliver_all(
    bot: &Bot,
    media_dir: &Path,
    effects: Vec<Outbound>,
    origin_is_media: bool,
) -> Option<String> {
    let mut alert = None;
    for effect in effects {
        let chat = effect.chat_id();
        let result = match effect {
            Outbound::Alert { text } => {
                alert = Some(text);
                Ok(())
            }
            Outbound::Text {
                chat_id,
                text,
                buttons,
            } => {
                let request = bot.send_message(ChatId(chat_id), text);
                match keyboard(&buttons) {
                    Some(markup) => request.reply_markup(markup).await.map(|_| ()),
                    None => request.await.map(|_| ()),
                }
            }
            Outbound::Photo {
                chat_id,
                path,
                caption,
                buttons,
            } => {
                let request = bot
                    .send_photo(ChatId(chat_id), InputFile::file(path))
                    .caption(caption);
                match keyboard(&buttons) {
                    Some(markup) => request.reply_markup(markup).await.map(|_| ()),
                    None => request.await.map(|_| ()),
                }
            }
            Outbound::Video {
                chat_id,
                asset,
                caption,
            } => {
                let request = bot.send_video(ChatId(chat_id), input_file(resolve_asset(media_dir, &asset)));
                match caption {
                    Some(caption) => request.caption(caption).await.map(|_| ()),
                    None => request.await.map(|_| ()),
                }
            }
            Outbound::Document {
                chat_id,
                file_name,
                bytes,
                caption,
            } => {
                let request =
                    bot.send_document(ChatId(chat_id), InputFile::memory(bytes).file_name(file_name));
                match caption {
                    Some(caption) => request.caption(caption).await.map(|_| ()),
                    None => request.await.map(|_| ()),
                }
            }
            Outbound::Edit { message, text } => {
                let chat_id = ChatId(message.chat_id);
                let message_id = MessageId(message.message_id);
                if origin_is_media {
                    bot.edit_message_caption(chat_id, message_id)
                        .caption(text)
                        .await
                        .map(|_| ())
                } else {
                    bot.edit_message_text(chat_id, message_id, text).await.map(|_| ())
                }
            }
        };

        if let Err(err) = result {
            warn!(chat = ?chat, error = %err, "telegram delivery failed");
        }
    }
    alert
}

#[cfg(test)]
mod tests {
    use super::*;
    use quest_engine::CallbackAction;

    #[test]
    fn urls_are_sent_by_reference_and_names_from_media_dir() {
        let media = Path::new("/srv/media");
        assert_eq!(
            resolve_asset(media, "https://cdn.example.com/intro.mp4"),
            AssetSource::Url("https://cdn.example.com/intro.mp4".parse().unwrap())
        );
        assert_eq!(
            resolve_asset(media, " stage1_intro.mp4 "),
            AssetSource::File(PathBuf::from("/srv/media/stage1_intro.mp4"))
        );
    }

    #[test]
    fn keyboard_pairs_buttons_per_row() {
        assert!(keyboard(&[]).is_none());
        let markup = keyboard(&[
            Button::new("ok", CallbackAction::Approve(1)),
            Button::new("no", CallbackAction::Reject(1)),
            Button::new("go", CallbackAction::StartQuest),
        ])
        .unwrap();
        assert_eq!(markup.inline_keyboard.len(), 2);
        assert_eq!(markup.inline_keyboard[0].len(), 2);
    }
}
