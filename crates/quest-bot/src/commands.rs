use quest_core::Role;
use quest_engine::AdminCommand;
use quest_storage::ExportKind;
use teloxide::utils::command::BotCommands;

#[derive(Debug, Clone, PartialEq, Eq, BotCommands)]
#[command(rename_rule = "lowercase", description = "Команды квеста:")]
pub enum Command {
    #[command(description = "начать или привязать персональную ссылку")]
    Start(String),
    #[command(description = "продолжить квест")]
    Quest,
    #[command(description = "эта справка")]
    Help,
    #[command(description = "участвовать в розыгрыше: /raffle <id>")]
    Raffle(String),
    #[command(description = "(админ) /defstage <id> <название>")]
    DefStage(String),
    #[command(description = "(админ) /setasset <этап> <ключ> <значение>")]
    SetAsset(String),
    #[command(description = "(админ) файл с промокодами с подписью /loadpromos")]
    LoadPromos(String),
    #[command(description = "(админ) пометить невыданные промокоды истёкшими")]
    ExpirePromos,
    #[command(description = "(админ) /export participants|addresses|promos")]
    Export(String),
    #[command(description = "(админ) /reset <telegram_id>")]
    Reset(String),
    #[command(description = "(админ) /setrole <telegram_id> user|moderator|admin")]
    SetRole(String),
    #[command(description = "(админ) /reassign <external_id> <stage_id>")]
    Reassign(String),
    #[command(description = "(админ) статистика")]
    Stats,
}

pub const LOAD_PROMOS_USAGE: &str =
    "Пришлите текстовый файл с промокодами (по одному в строке) с подписью /loadpromos.";

/// Admin arguments parsed into an engine command; `None` for participant
/// commands, `Err(usage)` for malformed arguments.
pub fn admin_command(command: &Command) -> Option<Result<AdminCommand, &'static str>> {
    let parsed = match command {
        Command::Start(_) | Command::Quest | Command::Help | Command::Raffle(_) => return None,
        Command::DefStage(args) => parse_def_stage(args),
        Command::SetAsset(args) => parse_set_asset(args),
        Command::LoadPromos(args) => {
            let codes: Vec<&str> = args.split_whitespace().collect();
            if codes.is_empty() {
                Err(LOAD_PROMOS_USAGE)
            } else {
                Ok(AdminCommand::LoadPromos {
                    content: codes.join("\n"),
                })
            }
        }
        Command::ExpirePromos => Ok(AdminCommand::ExpirePromos),
        Command::Export(args) => args
            .parse::<ExportKind>()
            .map(AdminCommand::Export)
            .map_err(|_| "Использование: /export participants|addresses|promos"),
        Command::Reset(args) => args
            .trim()
            .parse()
            .map(|telegram_id| AdminCommand::ResetUser { telegram_id })
            .map_err(|_| "Использование: /reset <telegram_id>"),
        Command::SetRole(args) => parse_set_role(args),
        Command::Reassign(args) => parse_reassign(args),
        Command::Stats => Ok(AdminCommand::Stats),
    };
    Some(parsed)
}

fn parse_def_stage(args: &str) -> Result<AdminCommand, &'static str> {
    const USAGE: &str = "Использование: /defstage <id> <название>";
    let (id, name) = args.trim().split_once(char::is_whitespace).ok_or(USAGE)?;
    let id = id.parse().map_err(|_| USAGE)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(USAGE);
    }
    Ok(AdminCommand::DefineStage {
        id,
        name: name.to_string(),
    })
}

fn parse_set_asset(args: &str) -> Result<AdminCommand, &'static str> {
    const USAGE: &str = "Использование: /setasset <этап> intro_video|final_video|final_link <значение>";
    let mut parts = args.split_whitespace();
    let (Some(stage), Some(key), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(USAGE);
    };
    if parts.next().is_some() {
        return Err(USAGE);
    }
    Ok(AdminCommand::SetAsset {
        stage: stage.parse().map_err(|_| USAGE)?,
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_set_role(args: &str) -> Result<AdminCommand, &'static str> {
    const USAGE: &str = "Использование: /setrole <telegram_id> user|moderator|admin";
    let mut parts = args.split_whitespace();
    let telegram_id = parts.next().and_then(|v| v.parse().ok()).ok_or(USAGE)?;
    let role = parts.next().and_then(Role::parse).ok_or(USAGE)?;
    Ok(AdminCommand::SetRole { telegram_id, role })
}

fn parse_reassign(args: &str) -> Result<AdminCommand, &'static str> {
    const USAGE: &str = "Использование: /reassign <external_id> <stage_id 1-5>";
    let mut parts = args.split_whitespace();
    let external_id = parts.next().ok_or(USAGE)?;
    let stage_id = parts.next().and_then(|v| v.parse().ok()).ok_or(USAGE)?;
    Ok(AdminCommand::Reassign {
        external_id: external_id.to_string(),
        stage_id,
    })
}

/// Whether a document caption asks for a promo upload.
pub fn is_load_promos_caption(caption: Option<&str>) -> bool {
    caption
        .and_then(|c| c.split_whitespace().next())
        .is_some_and(|first| {
            let first = first.split('@').next().unwrap_or(first);
            first.eq_ignore_ascii_case("/loadpromos")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Command {
        Command::parse(text, "quest_bot").unwrap()
    }

    #[test]
    fn start_carries_the_link_token() {
        assert_eq!(parse("/start abc123"), Command::Start("abc123".to_string()));
        assert_eq!(parse("/start"), Command::Start(String::new()));
        assert_eq!(parse("/quest"), Command::Quest);
    }

    #[test]
    fn participant_commands_are_not_admin_commands() {
        assert!(admin_command(&parse("/raffle finale")).is_none());
        assert!(admin_command(&parse("/help")).is_none());
    }

    #[test]
    fn parses_admin_arguments() {
        assert_eq!(
            admin_command(&parse("/defstage 2 Тень на трассе")),
            Some(Ok(AdminCommand::DefineStage {
                id: 2,
                name: "Тень на трассе".to_string()
            }))
        );
        assert_eq!(
            admin_command(&parse("/setasset 3 final_link https://example.com/3")),
            Some(Ok(AdminCommand::SetAsset {
                stage: 3,
                key: "final_link".to_string(),
                value: "https://example.com/3".to_string()
            }))
        );
        assert_eq!(
            admin_command(&parse("/setrole 42 Moderator")),
            Some(Ok(AdminCommand::SetRole {
                telegram_id: 42,
                role: Role::Moderator
            }))
        );
        assert_eq!(
            admin_command(&parse("/reassign R-7 5")),
            Some(Ok(AdminCommand::Reassign {
                external_id: "R-7".to_string(),
                stage_id: 5
            }))
        );
        assert_eq!(
            admin_command(&parse("/export promo_codes")),
            Some(Ok(AdminCommand::Export(ExportKind::Promos)))
        );
        assert_eq!(
            admin_command(&parse("/loadpromos A1 A2")),
            Some(Ok(AdminCommand::LoadPromos {
                content: "A1\nA2".to_string()
            }))
        );
        assert_eq!(admin_command(&parse("/stats")), Some(Ok(AdminCommand::Stats)));
    }

    #[test]
    fn malformed_admin_arguments_yield_usage() {
        for text in [
            "/defstage two Тень",
            "/defstage 2",
            "/setasset 1 intro_video",
            "/setrole 42 owner",
            "/reassign R-7",
            "/reset someone",
            "/export everything",
            "/loadpromos",
        ] {
            assert!(matches!(admin_command(&parse(text)), Some(Err(_))), "{text}");
        }
    }

    #[test]
    fn recognises_promo_upload_captions() {
        assert!(is_load_promos_caption(Some("/loadpromos")));
        assert!(is_load_promos_caption(Some("/loadpromos@quest_bot batch 2")));
        assert!(!is_load_promos_caption(Some("promo codes")));
        assert!(!is_load_promos_caption(None));
    }
}
