use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quest_core::{
    fill, format_run_date, passes_date_check, HintExhaustion, QuestPhase, QuestSession,
    QuestUser, Role, RunData, StageCatalog, StageConfig, VerificationRecord, VerificationSource,
    PromoClaim, STAGE_COUNT,
};
use quest_oracle::ExtractionOracle;
use quest_storage::{LinkClaim, QuestDb, ScreenshotStore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::session::SessionStore;
use crate::{
    Actor, Button, CallbackAction, EngineError, Inbound, MessageRef, Outbound, APPROVE_LABEL,
    REJECT_LABEL,
};

pub(crate) type EngineResult<T> = Result<T, EngineError>;

/// One parametrized state machine for all four stages.
#[derive(Clone)]
pub struct QuestEngine {
    pub(crate) db: QuestDb,
    pub(crate) sessions: Arc<dyn SessionStore>,
    oracle: Arc<dyn ExtractionOracle>,
    screenshots: ScreenshotStore,
    pub(crate) catalog: Arc<StageCatalog>,
    oracle_timeout: Duration,
    admin_ids: HashSet<i64>,
}

impl QuestEngine {
    pub fn new(
        db: QuestDb,
        sessions: Arc<dyn SessionStore>,
        oracle: Arc<dyn ExtractionOracle>,
        screenshots: ScreenshotStore,
        catalog: Arc<StageCatalog>,
    ) -> Self {
        Self {
            db,
            sessions,
            oracle,
            screenshots,
            catalog,
            oracle_timeout: Duration::from_secs(60),
            admin_ids: HashSet::new(),
        }
    }

    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }

    /// Telegram ids promoted to admin on first contact.
    pub fn with_admin_ids(mut self, admin_ids: HashSet<i64>) -> Self {
        self.admin_ids = admin_ids;
        self
    }

    pub fn db(&self) -> &QuestDb {
        &self.db
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    /// Runs a transition, turning internal failures into the generic apology.
    pub(crate) async fn guarded<F>(&self, actor: &Actor, label: &str, work: F) -> Vec<Outbound>
    where
        F: std::future::Future<Output = EngineResult<Vec<Outbound>>>,
    {
        let span = info_span!("quest", user = actor.telegram_id, op = label);
        match work.instrument(span).await {
            Ok(out) => out,
            Err(err) => {
                error!(user = actor.telegram_id, op = label, error = %err, "quest transition failed");
                vec![Outbound::text(
                    actor.telegram_id,
                    &self.catalog.messages.generic_error,
                )]
            }
        }
    }

    pub(crate) async fn ensure_actor(&self, actor: &Actor) -> EngineResult<QuestUser> {
        let bootstrap_admin = self.admin_ids.contains(&actor.telegram_id);
        let role = if bootstrap_admin { Role::Admin } else { Role::User };
        let mut user = self
            .db
            .ensure_user(actor.telegram_id, actor.username.as_deref(), role)
            .await?;
        if bootstrap_admin && user.role != Role::Admin {
            self.db.set_role(actor.telegram_id, Role::Admin).await?;
            user.role = Role::Admin;
        }
        Ok(user)
    }

    fn stage_config(&self, stage: u8) -> EngineResult<&StageConfig> {
        self.catalog.stage(stage).ok_or(EngineError::UnknownStage(stage))
    }

    /// `/start [token]`: claims a personalized link when present and offers the
    /// quest start button to linked users.
    pub async fn start(&self, actor: &Actor, token: Option<&str>) -> Vec<Outbound> {
        self.guarded(actor, "start", self.start_inner(actor, token)).await
    }

    async fn start_inner(&self, actor: &Actor, token: Option<&str>) -> EngineResult<Vec<Outbound>> {
        self.ensure_actor(actor).await?;
        let messages = &self.catalog.messages;
        let chat = actor.telegram_id;

        let participant = match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) => match self.db.claim_link(token, chat).await? {
                LinkClaim::Linked(participant) => {
                    info!(user = chat, participant = participant.id, "personal link claimed");
                    Some(participant)
                }
                LinkClaim::AlreadyClaimed => {
                    return Ok(vec![Outbound::text(chat, &messages.link_claimed_by_other)])
                }
                LinkClaim::Unknown => None,
            },
            None => self.db.participant_for_user(chat).await?,
        };

        let Some(participant) = participant else {
            return Ok(vec![Outbound::text(chat, &messages.not_linked)]);
        };

        let name = participant.display_name();
        Ok(vec![Outbound::Text {
            chat_id: chat,
            text: fill(&messages.welcome, &[("name", &name)]),
            buttons: vec![Button::new(&messages.start_button, CallbackAction::StartQuest)],
        }])
    }

    /// `/quest` or the start button: resumes an open session or opens the next stage.
    pub async fn begin_quest(&self, actor: &Actor) -> Vec<Outbound> {
        self.guarded(actor, "begin_quest", self.begin_quest_inner(actor)).await
    }

    async fn begin_quest_inner(&self, actor: &Actor) -> EngineResult<Vec<Outbound>> {
        let user = self.ensure_actor(actor).await?;
        let chat = actor.telegram_id;
        let messages = &self.catalog.messages;

        let Some(participant) = self.db.participant_for_user(chat).await? else {
            return Ok(vec![Outbound::text(chat, &messages.not_linked)]);
        };

        if let Some(session) = self.sessions.get(chat).await? {
            return self.resume_prompt(chat, &session);
        }

        let stage = if participant.is_chained() {
            match (1..=STAGE_COUNT).find(|stage| !user.is_stage_completed(*stage)) {
                Some(stage) => stage,
                None => return Ok(vec![Outbound::text(chat, &messages.quest_finished)]),
            }
        } else {
            u8::try_from(participant.stage_id)
                .map_err(|_| EngineError::UnknownStage(u8::MAX))?
        };

        self.advance_to_stage_inner(chat, stage).await
    }

    /// Single entry into a stage, used by the dispatcher and by chaining. Completed
    /// stages are refused without opening a session.
    pub async fn advance_to_stage(&self, actor: &Actor, stage: u8) -> Vec<Outbound> {
        self.guarded(actor, "advance_to_stage", async {
            self.ensure_actor(actor).await?;
            self.advance_to_stage_inner(actor.telegram_id, stage).await
        })
        .await
    }

    async fn advance_to_stage_inner(&self, chat: i64, stage: u8) -> EngineResult<Vec<Outbound>> {
        let cfg = self.stage_config(stage)?;
        let user = self
            .db
            .get_user(chat)
            .await?
            .ok_or_else(|| quest_storage::StorageError::Corrupt(format!("user {chat} missing")))?;

        if user.is_stage_completed(stage) {
            return Ok(vec![Outbound::text(
                chat,
                &self.catalog.messages.stage_already_completed,
            )]);
        }

        let chained = self
            .db
            .participant_for_user(chat)
            .await?
            .is_some_and(|p| p.is_chained());
        if chained {
            self.db.advance_current_stage(chat, stage).await?;
        }

        self.sessions
            .set(chat, &QuestSession::start(stage, chained))
            .await?;
        info!(user = chat, stage, chained, "stage opened");

        let mut out = Vec::new();
        if let Some(asset) = self.asset(stage, "intro_video", cfg.intro_video.as_deref()).await? {
            out.push(Outbound::Video {
                chat_id: chat,
                asset,
                caption: None,
            });
        }
        out.push(Outbound::text(chat, &cfg.intro_text));
        out.push(Outbound::text(chat, &cfg.photo_prompt));
        Ok(out)
    }

    /// Repeats what the current phase is waiting for.
    fn resume_prompt(&self, chat: i64, session: &QuestSession) -> EngineResult<Vec<Outbound>> {
        let cfg = self.stage_config(session.stage)?;
        let text = match session.phase {
            QuestPhase::AwaitingPhoto => &cfg.photo_prompt,
            QuestPhase::AwaitingModeratorDecision => &self.catalog.messages.waiting_for_moderator,
            QuestPhase::AwaitingRiddleAnswer => &cfg.riddle_prompt,
            QuestPhase::AwaitingAddress => &cfg.riddle_solved_text,
        };
        Ok(vec![Outbound::text(chat, text)])
    }

    async fn asset(&self, stage: u8, key: &str, default: Option<&str>) -> EngineResult<Option<String>> {
        let overridden = self.db.stage_asset(stage, key).await?;
        Ok(overridden.or_else(|| default.map(str::to_string)))
    }

    pub async fn handle_message(&self, actor: &Actor, inbound: Inbound) -> Vec<Outbound> {
        self.guarded(actor, "message", self.handle_message_inner(actor, inbound))
            .await
    }

    async fn handle_message_inner(&self, actor: &Actor, inbound: Inbound) -> EngineResult<Vec<Outbound>> {
        self.ensure_actor(actor).await?;
        let chat = actor.telegram_id;

        let session = match self.sessions.get(chat).await? {
            Some(session) => session,
            None => match inbound {
                // A photo without a session starts the user's open stage afresh.
                Inbound::Photo { .. } => match self.implicit_stage(chat).await? {
                    Some(session) => {
                        self.sessions.set(chat, &session).await?;
                        session
                    }
                    None => return self.no_session_reply(chat).await,
                },
                _ => return self.no_session_reply(chat).await,
            },
        };

        match session.phase {
            QuestPhase::AwaitingPhoto => self.on_awaiting_photo(chat, session, inbound).await,
            QuestPhase::AwaitingModeratorDecision => {
                self.on_awaiting_moderator(chat, session, inbound).await
            }
            QuestPhase::AwaitingRiddleAnswer => self.on_awaiting_riddle(chat, session, inbound).await,
            QuestPhase::AwaitingAddress => self.on_awaiting_address(chat, session, inbound).await,
        }
    }

    async fn implicit_stage(&self, chat: i64) -> EngineResult<Option<QuestSession>> {
        let Some(participant) = self.db.participant_for_user(chat).await? else {
            return Ok(None);
        };
        let Some(user) = self.db.get_user(chat).await? else {
            return Ok(None);
        };
        let stage = if participant.is_chained() {
            (1..=STAGE_COUNT).find(|stage| !user.is_stage_completed(*stage))
        } else {
            u8::try_from(participant.stage_id)
                .ok()
                .filter(|stage| !user.is_stage_completed(*stage))
        };
        Ok(stage.map(|stage| QuestSession::start(stage, participant.is_chained())))
    }

    async fn no_session_reply(&self, chat: i64) -> EngineResult<Vec<Outbound>> {
        let messages = &self.catalog.messages;
        let text = if self.db.participant_for_user(chat).await?.is_none() {
            &messages.not_linked
        } else {
            &messages.no_active_stage
        };
        Ok(vec![Outbound::text(chat, text)])
    }

    async fn on_awaiting_photo(
        &self,
        chat: i64,
        mut session: QuestSession,
        inbound: Inbound,
    ) -> EngineResult<Vec<Outbound>> {
        let Inbound::Photo { bytes, extension } = inbound else {
            return Ok(vec![Outbound::text(chat, &self.catalog.messages.photo_only)]);
        };

        let stored = self
            .screenshots
            .store_bytes(Utc::now(), chat, session.stage, &extension, &bytes)
            .await
            .map_err(EngineError::Screenshot)?;
        session.last_image_path = Some(stored.absolute_path.display().to_string());

        match self.run_oracle(&stored.absolute_path).await {
            Some(data) => self.on_recognised(chat, session, data).await,
            None => self.on_recognition_failed(chat, session).await,
        }
    }

    /// Bounded oracle call; errors and timeouts count as failed recognition.
    async fn run_oracle(&self, path: &std::path::Path) -> Option<RunData> {
        match tokio::time::timeout(self.oracle_timeout, self.oracle.extract(path)).await {
            Ok(Ok(data)) if data.is_usable() => Some(data),
            Ok(Ok(data)) => {
                debug!(date = %data.date, distance = %data.distance, "oracle result unusable");
                None
            }
            Ok(Err(err)) => {
                warn!(error = %err, "oracle call failed");
                None
            }
            Err(_) => {
                warn!(timeout_secs = self.oracle_timeout.as_secs(), "oracle call timed out");
                None
            }
        }
    }

    async fn on_recognised(
        &self,
        chat: i64,
        mut session: QuestSession,
        data: RunData,
    ) -> EngineResult<Vec<Outbound>> {
        let cfg = self.stage_config(session.stage)?;
        let record = VerificationRecord {
            telegram_id: chat,
            passed_date_check: passes_date_check(&data.date, self.catalog.date_cutoff),
            distance: data.distance,
            run_date: data.date,
            source: VerificationSource::Oracle,
            updated_at: Utc::now(),
        };
        self.db.upsert_verification(&record).await?;
        info!(
            user = chat,
            stage = session.stage,
            run_date = %record.run_date,
            passed = record.passed_date_check,
            "run verified"
        );

        session.enter_riddle(self.catalog.riddle_attempts);
        self.sessions.set(chat, &session).await?;
        Ok(vec![Outbound::text(chat, &cfg.riddle_prompt)])
    }

    async fn on_recognition_failed(
        &self,
        chat: i64,
        mut session: QuestSession,
    ) -> EngineResult<Vec<Outbound>> {
        let cfg = self.stage_config(session.stage)?;
        let messages = &self.catalog.messages;
        session.recognition_attempts += 1;
        let total = self.catalog.recognition_attempts;

        if !cfg.moderator_escalation {
            self.sessions.set(chat, &session).await?;
            return Ok(vec![Outbound::text(chat, &messages.photo_failed)]);
        }

        if session.recognition_attempts < total {
            self.sessions.set(chat, &session).await?;
            let attempt = session.recognition_attempts.to_string();
            let total = total.to_string();
            return Ok(vec![Outbound::text(
                chat,
                fill(&messages.photo_retry, &[("attempt", &attempt), ("total", &total)]),
            )]);
        }

        let staff = self.db.list_staff().await?;
        if staff.is_empty() {
            warn!(user = chat, "escalation requested but no moderators are registered");
            session.recognition_attempts = 0;
            self.sessions.set(chat, &session).await?;
            return Ok(vec![Outbound::text(chat, &messages.photo_failed)]);
        }

        session.phase = QuestPhase::AwaitingModeratorDecision;
        self.sessions.set(chat, &session).await?;

        let user = self.db.get_user(chat).await?;
        let label = user.map(|u| u.label()).unwrap_or_else(|| chat.to_string());
        let stage = session.stage.to_string();
        let caption = fill(
            &messages.moderator_notification,
            &[("user", &label), ("stage", &stage)],
        );
        let buttons = vec![
            Button::new(APPROVE_LABEL, CallbackAction::Approve(chat)),
            Button::new(REJECT_LABEL, CallbackAction::Reject(chat)),
        ];

        let image = session.last_image_path.clone().map(PathBuf::from);
        let mut out: Vec<Outbound> = staff
            .iter()
            .map(|moderator| match &image {
                Some(path) => Outbound::Photo {
                    chat_id: moderator.telegram_id,
                    path: path.clone(),
                    caption: caption.clone(),
                    buttons: buttons.clone(),
                },
                None => Outbound::Text {
                    chat_id: moderator.telegram_id,
                    text: caption.clone(),
                    buttons: buttons.clone(),
                },
            })
            .collect();
        info!(user = chat, stage = session.stage, moderators = staff.len(), "verification escalated");

        out.push(Outbound::text(chat, &messages.escalated));
        Ok(out)
    }

    async fn on_awaiting_moderator(
        &self,
        chat: i64,
        mut session: QuestSession,
        inbound: Inbound,
    ) -> EngineResult<Vec<Outbound>> {
        let cfg = self.stage_config(session.stage)?;
        let messages = &self.catalog.messages;
        match inbound {
            Inbound::Photo { .. } => Ok(vec![Outbound::text(chat, &messages.already_submitted)]),
            Inbound::Text(text)
                if self.catalog.accept_answer_while_pending && cfg.is_correct_answer(&text) =>
            {
                debug!(user = chat, "riddle answered while awaiting moderator");
                session.phase = QuestPhase::AwaitingAddress;
                self.sessions.set(chat, &session).await?;
                Ok(vec![Outbound::text(chat, &cfg.riddle_solved_text)])
            }
            _ => Ok(vec![Outbound::text(chat, &messages.waiting_for_moderator)]),
        }
    }

    async fn on_awaiting_riddle(
        &self,
        chat: i64,
        mut session: QuestSession,
        inbound: Inbound,
    ) -> EngineResult<Vec<Outbound>> {
        let cfg = self.stage_config(session.stage)?;
        let messages = &self.catalog.messages;
        let Inbound::Text(answer) = inbound else {
            return Ok(vec![Outbound::text(chat, &cfg.riddle_prompt)]);
        };

        if cfg.is_correct_answer(&answer) {
            session.phase = QuestPhase::AwaitingAddress;
            self.sessions.set(chat, &session).await?;
            return Ok(vec![Outbound::text(chat, &cfg.riddle_solved_text)]);
        }

        session.attempts_left = session.attempts_left.saturating_sub(1);
        if session.attempts_left > 0 {
            self.sessions.set(chat, &session).await?;
            let left = session.attempts_left.to_string();
            return Ok(vec![Outbound::text(
                chat,
                fill(&messages.wrong_answer, &[("attempts", &left)]),
            )]);
        }

        let hint = fill(&messages.hint, &[("hint", &cfg.hint_text)]);
        if !session.hint_shown {
            session.hint_shown = true;
            session.attempts_left = 1;
            self.sessions.set(chat, &session).await?;
            return Ok(vec![Outbound::text(chat, hint)]);
        }

        match self.catalog.after_hint_exhausted {
            HintExhaustion::RepeatHint => {
                session.attempts_left = 1;
                self.sessions.set(chat, &session).await?;
                Ok(vec![Outbound::text(chat, hint)])
            }
            HintExhaustion::ResetStage => {
                self.sessions.clear(chat).await?;
                info!(user = chat, stage = session.stage, "riddle budget exhausted; stage reset");
                Ok(vec![Outbound::text(chat, &messages.riddle_reset)])
            }
        }
    }

    async fn on_awaiting_address(
        &self,
        chat: i64,
        session: QuestSession,
        inbound: Inbound,
    ) -> EngineResult<Vec<Outbound>> {
        let cfg = self.stage_config(session.stage)?;
        let messages = &self.catalog.messages;
        let address = match inbound {
            Inbound::Text(text) if text.trim().chars().count() >= self.catalog.min_address_chars => {
                text.trim().to_string()
            }
            _ => return Ok(vec![Outbound::text(chat, &messages.address_too_short)]),
        };

        let stage = session.stage;
        let before = self
            .db
            .get_user(chat)
            .await?
            .ok_or_else(|| quest_storage::StorageError::Corrupt(format!("user {chat} missing")))?;

        self.db.upsert_address(chat, stage, &address).await?;
        let flipped = self.db.mark_stage_completed(chat, stage).await?;
        info!(user = chat, stage, chained = session.is_chained_participant, "stage completed");

        let mut out = Vec::new();

        if session.is_chained_participant {
            if let Some(relic) = &cfg.relic_text {
                out.push(Outbound::text(chat, relic));
            }
            self.sessions.clear(chat).await?;
            if stage < STAGE_COUNT {
                out.extend(self.advance_to_stage_inner(chat, stage + 1).await?);
            } else {
                out.push(Outbound::text(chat, &messages.chain_finished));
            }
            return Ok(out);
        }

        if flipped && before.completed_count() == 0 {
            match self.db.claim_promo_code(chat).await? {
                PromoClaim::Claimed(code) => {
                    info!(user = chat, %code, "promo code issued");
                    out.push(Outbound::text(chat, fill(&messages.promo_claimed, &[("code", &code)])));
                }
                PromoClaim::Exhausted => {
                    warn!(user = chat, "promo pool exhausted");
                    out.push(Outbound::text(chat, &messages.promo_exhausted));
                }
            }
        }

        out.extend(self.closing_narrative(chat, stage, cfg).await?);
        self.sessions.clear(chat).await?;
        Ok(out)
    }

    async fn closing_narrative(
        &self,
        chat: i64,
        stage: u8,
        cfg: &StageConfig,
    ) -> EngineResult<Vec<Outbound>> {
        let link = self.asset(stage, "final_link", cfg.final_link.as_deref()).await?;
        let text = match link {
            Some(link) => format!("{}\n{link}", cfg.closing_text),
            None => cfg.closing_text.clone(),
        };

        let mut out = Vec::new();
        if let Some(asset) = self.asset(stage, "final_video", cfg.final_video.as_deref()).await? {
            out.push(Outbound::Video {
                chat_id: chat,
                asset,
                caption: None,
            });
        }
        out.push(Outbound::text(chat, text));
        Ok(out)
    }

    /// Inline button presses. `origin` is the message carrying the button.
    pub async fn handle_callback(
        &self,
        actor: &Actor,
        data: &str,
        origin: Option<MessageRef>,
    ) -> Vec<Outbound> {
        match CallbackAction::parse(data) {
            Some(CallbackAction::StartQuest) => self.begin_quest(actor).await,
            Some(CallbackAction::Approve(target)) => {
                self.moderator_decision(actor, target, true, origin).await
            }
            Some(CallbackAction::Reject(target)) => {
                self.moderator_decision(actor, target, false, origin).await
            }
            None => {
                debug!(user = actor.telegram_id, data, "ignoring unknown callback payload");
                Vec::new()
            }
        }
    }

    pub async fn moderator_decision(
        &self,
        actor: &Actor,
        target: i64,
        approve: bool,
        origin: Option<MessageRef>,
    ) -> Vec<Outbound> {
        self.guarded(
            actor,
            "moderator_decision",
            self.moderator_decision_inner(actor, target, approve, origin),
        )
        .await
    }

    async fn moderator_decision_inner(
        &self,
        actor: &Actor,
        target: i64,
        approve: bool,
        origin: Option<MessageRef>,
    ) -> EngineResult<Vec<Outbound>> {
        let moderator = self.ensure_actor(actor).await?;
        let messages = &self.catalog.messages;

        if !moderator.role.is_staff() {
            warn!(actor = actor.telegram_id, target, "non-staff moderator action rejected");
            return Ok(vec![Outbound::alert(&messages.not_authorized)]);
        }

        let pending = self
            .sessions
            .get(target)
            .await?
            .filter(|s| s.phase == QuestPhase::AwaitingModeratorDecision);
        let Some(mut session) = pending else {
            return Ok(vec![Outbound::alert(&messages.moderator_already_handled)]);
        };

        let mut out = Vec::new();
        let note = if approve {
            let cfg = self.stage_config(session.stage)?;
            let record = VerificationRecord {
                telegram_id: target,
                distance: self.catalog.moderator_placeholder_distance.clone(),
                run_date: format_run_date(Utc::now().date_naive()),
                passed_date_check: true,
                source: VerificationSource::Moderator,
                updated_at: Utc::now(),
            };
            self.db.upsert_verification(&record).await?;
            session.enter_riddle(self.catalog.riddle_attempts);
            self.sessions.set(target, &session).await?;
            out.push(Outbound::text(target, &cfg.riddle_prompt));
            info!(moderator = actor.telegram_id, target, "verification approved");
            &messages.moderator_approved_note
        } else {
            self.sessions.clear(target).await?;
            out.push(Outbound::text(target, &messages.rejected));
            info!(moderator = actor.telegram_id, target, "verification rejected");
            &messages.moderator_rejected_note
        };

        if let Some(message) = origin {
            out.push(Outbound::Edit {
                message,
                text: fill(note, &[("moderator", &moderator.label())]),
            });
        }
        Ok(out)
    }
}
