use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quest_core::{
    HintExhaustion, ParticipantImport, QuestPhase, Role, RunData, StageCatalog,
    VerificationSource,
};
use quest_engine::{
    Actor, AdminCommand, CallbackAction, Inbound, InMemorySessionStore, MessageRef, Outbound,
    QuestEngine, SessionStore,
};
use quest_oracle::{ExtractionOracle, OracleError};
use quest_storage::{ExportKind, QuestDb, ScreenshotStore};
use tempfile::TempDir;

#[derive(Default)]
struct ScriptedOracle {
    results: Mutex<VecDeque<RunData>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedOracle {
    fn push(&self, data: RunData) {
        self.results.lock().unwrap().push_back(data);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionOracle for ScriptedOracle {
    async fn extract(&self, image_path: &Path) -> Result<RunData, OracleError> {
        assert!(image_path.exists(), "screenshot stored before extraction");
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(RunData::not_found))
    }
}

struct Harness {
    engine: QuestEngine,
    db: QuestDb,
    sessions: Arc<InMemorySessionStore>,
    oracle: Arc<ScriptedOracle>,
    catalog: StageCatalog,
    _dir: TempDir,
}

async fn harness_with(catalog: StageCatalog, oracle: ScriptedOracle) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = QuestDb::in_memory().await.unwrap();
    let sessions = Arc::new(InMemorySessionStore::new());
    let oracle = Arc::new(oracle);
    let engine = QuestEngine::new(
        db.clone(),
        sessions.clone(),
        oracle.clone(),
        ScreenshotStore::new(dir.path()),
        Arc::new(catalog.clone()),
    )
    .with_oracle_timeout(Duration::from_millis(200));

    Harness {
        engine,
        db,
        sessions,
        oracle,
        catalog,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    harness_with(StageCatalog::embedded().unwrap(), ScriptedOracle::default()).await
}

impl Harness {
    /// Imports a participant on `stage_id`, links `telegram_id` through the
    /// personal link and opens their first stage.
    async fn linked_runner(&self, telegram_id: i64, stage_id: i64) -> Actor {
        let external_id = format!("P-{telegram_id}");
        self.db
            .import_participants(&[ParticipantImport {
                external_id: external_id.clone(),
                first_name: Some("Иван".to_string()),
                last_name: Some("Бегунов".to_string()),
                email: Some(format!("{telegram_id}@example.com")),
                phone: None,
                stage_id,
            }])
            .await
            .unwrap();
        let participant = self
            .db
            .list_participants()
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.external_id == external_id)
            .unwrap();
        let token = format!("tok-{telegram_id}");
        self.db
            .insert_link(participant.id, &token, "https://t.me/quest_bot")
            .await
            .unwrap();

        let actor = Actor::new(telegram_id).with_username(format!("runner{telegram_id}"));
        let welcome = self.engine.start(&actor, Some(&token)).await;
        assert!(matches!(
            &welcome[0],
            Outbound::Text { buttons, .. } if buttons[0].data == CallbackAction::StartQuest.to_data()
        ));
        actor
    }

    async fn moderator(&self, telegram_id: i64) -> Actor {
        let actor = Actor::new(telegram_id).with_username("mod");
        self.engine.start(&actor, None).await;
        self.db.set_role(telegram_id, Role::Moderator).await.unwrap();
        actor
    }

    async fn session(&self, actor: &Actor) -> Option<quest_core::QuestSession> {
        self.sessions.get(actor.telegram_id).await.unwrap()
    }

    async fn say(&self, actor: &Actor, text: &str) -> Vec<Outbound> {
        self.engine
            .handle_message(actor, Inbound::Text(text.to_string()))
            .await
    }

    async fn photo(&self, actor: &Actor, seed: u8) -> Vec<Outbound> {
        self.engine
            .handle_message(
                actor,
                Inbound::Photo {
                    bytes: vec![0xff, 0xd8, seed],
                    extension: "jpg".to_string(),
                },
            )
            .await
    }

    /// Drives a linked runner from stage start through the riddle.
    async fn solve_riddle(&self, actor: &Actor, stage: u8) {
        self.oracle.push(RunData::new("26.11.2025", "10.01 км"));
        self.photo(actor, stage).await;
        let answer = self.catalog.stage(stage).unwrap().riddle_answer.clone();
        self.say(actor, &answer).await;
        assert_eq!(
            self.session(actor).await.unwrap().phase,
            QuestPhase::AwaitingAddress
        );
    }
}

fn texts_for(out: &[Outbound], chat: i64) -> Vec<String> {
    out.iter()
        .filter_map(|o| match o {
            Outbound::Text { chat_id, text, .. } if *chat_id == chat => Some(text.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn scenario_a_valid_photo_reaches_riddle() {
    let h = harness().await;
    let runner = h.linked_runner(101, 1).await;

    let intro = h.engine.begin_quest(&runner).await;
    let stage1 = h.catalog.stage(1).unwrap();
    assert!(matches!(&intro[0], Outbound::Video { asset, .. } if asset == "stage1_intro.mp4"));
    assert!(texts_for(&intro, 101).contains(&stage1.photo_prompt));

    h.oracle.push(RunData::new("26.11.2025", "10.01 км"));
    let out = h.photo(&runner, 1).await;
    assert_eq!(texts_for(&out, 101), vec![stage1.riddle_prompt.clone()]);

    let record = h.db.get_verification(101).await.unwrap().unwrap();
    assert_eq!(record.run_date, "26.11.2025");
    assert_eq!(record.distance, "10.01 км");
    assert!(record.passed_date_check);
    assert_eq!(record.source, VerificationSource::Oracle);

    let session = h.session(&runner).await.unwrap();
    assert_eq!(session.phase, QuestPhase::AwaitingRiddleAnswer);
    assert_eq!(session.attempts_left, 3);
}

#[tokio::test]
async fn run_before_cutoff_is_recorded_as_failed_check() {
    let h = harness().await;
    let runner = h.linked_runner(102, 1).await;
    h.engine.begin_quest(&runner).await;

    h.oracle.push(RunData::new("24.11.2025", "5.00 км"));
    h.photo(&runner, 1).await;

    let record = h.db.get_verification(102).await.unwrap().unwrap();
    assert!(!record.passed_date_check);
}

#[tokio::test]
async fn non_image_input_is_corrected_without_advancing() {
    let h = harness().await;
    let runner = h.linked_runner(103, 2).await;
    h.engine.begin_quest(&runner).await;

    let out = h.say(&runner, "вот мой результат").await;
    assert_eq!(texts_for(&out, 103), vec![h.catalog.messages.photo_only.clone()]);
    let out = h.engine.handle_message(&runner, Inbound::Other).await;
    assert_eq!(texts_for(&out, 103), vec![h.catalog.messages.photo_only.clone()]);

    let session = h.session(&runner).await.unwrap();
    assert_eq!(session.phase, QuestPhase::AwaitingPhoto);
    assert_eq!(session.recognition_attempts, 0);
    assert_eq!(h.oracle.calls(), 0);
}

#[tokio::test]
async fn scenario_b_third_failure_escalates_to_moderators() {
    let h = harness().await;
    let moderator = h.moderator(900).await;
    let runner = h.linked_runner(104, 1).await;
    h.engine.begin_quest(&runner).await;

    for attempt in 1..=2u8 {
        let out = h.photo(&runner, attempt).await;
        assert!(out.iter().all(|o| o.chat_id() == Some(104)), "no escalation yet");
        let session = h.session(&runner).await.unwrap();
        assert_eq!(session.phase, QuestPhase::AwaitingPhoto);
        assert_eq!(session.recognition_attempts, u32::from(attempt));
    }

    let out = h.photo(&runner, 3).await;
    let notification = out
        .iter()
        .find(|o| o.chat_id() == Some(moderator.telegram_id))
        .expect("moderator notified");
    match notification {
        Outbound::Photo { buttons, path, .. } => {
            assert!(path.exists());
            let payloads: Vec<_> = buttons.iter().map(|b| b.data.as_str()).collect();
            assert_eq!(payloads, vec!["mod:approve:104", "mod:reject:104"]);
        }
        other => panic!("expected photo notification, got {other:?}"),
    }
    assert_eq!(texts_for(&out, 104), vec![h.catalog.messages.escalated.clone()]);
    assert_eq!(
        h.session(&runner).await.unwrap().phase,
        QuestPhase::AwaitingModeratorDecision
    );
    assert_eq!(h.oracle.calls(), 3);

    let out = h.photo(&runner, 4).await;
    assert_eq!(texts_for(&out, 104), vec![h.catalog.messages.already_submitted.clone()]);
    let out = h.say(&runner, "когда?").await;
    assert_eq!(texts_for(&out, 104), vec![h.catalog.messages.waiting_for_moderator.clone()]);
    assert_eq!(h.oracle.calls(), 3);
}

#[tokio::test]
async fn escalation_without_moderators_lets_the_runner_retry() {
    let h = harness().await;
    let runner = h.linked_runner(110, 1).await;
    h.engine.begin_quest(&runner).await;

    for seed in 1..=2 {
        h.photo(&runner, seed).await;
    }
    let out = h.photo(&runner, 3).await;
    assert_eq!(texts_for(&out, 110), vec![h.catalog.messages.photo_failed.clone()]);
    assert!(out.iter().all(|o| o.chat_id() == Some(110)));

    let session = h.session(&runner).await.unwrap();
    assert_eq!(session.phase, QuestPhase::AwaitingPhoto);
    assert_eq!(session.recognition_attempts, 0);

    h.oracle.push(RunData::new("26.11.2025", "10.00 км"));
    h.photo(&runner, 4).await;
    assert_eq!(
        h.session(&runner).await.unwrap().phase,
        QuestPhase::AwaitingRiddleAnswer
    );
}

#[tokio::test]
async fn oracle_timeout_counts_as_failed_recognition() {
    let oracle = ScriptedOracle {
        delay: Some(Duration::from_secs(5)),
        ..ScriptedOracle::default()
    };
    let h = harness_with(StageCatalog::embedded().unwrap(), oracle).await;
    let runner = h.linked_runner(105, 3).await;
    h.engine.begin_quest(&runner).await;

    h.oracle.push(RunData::new("26.11.2025", "10.00 км"));
    h.photo(&runner, 1).await;

    let session = h.session(&runner).await.unwrap();
    assert_eq!(session.phase, QuestPhase::AwaitingPhoto);
    assert_eq!(session.recognition_attempts, 1);
    assert!(h.db.get_verification(105).await.unwrap().is_none());
}

async fn escalate(h: &Harness, runner: &Actor) {
    h.engine.begin_quest(runner).await;
    for seed in 1..=3 {
        h.photo(runner, seed).await;
    }
    assert_eq!(
        h.session(runner).await.unwrap().phase,
        QuestPhase::AwaitingModeratorDecision
    );
}

#[tokio::test]
async fn scenario_c_reject_clears_session_and_next_photo_starts_fresh() {
    let h = harness().await;
    let moderator = h.moderator(900).await;
    let runner = h.linked_runner(106, 1).await;
    escalate(&h, &runner).await;

    let origin = MessageRef {
        chat_id: 900,
        message_id: 77,
    };
    let out = h
        .engine
        .handle_callback(&moderator, "mod:reject:106", Some(origin))
        .await;
    assert_eq!(texts_for(&out, 106), vec![h.catalog.messages.rejected.clone()]);
    assert!(out
        .iter()
        .any(|o| matches!(o, Outbound::Edit { message, .. } if *message == origin)));
    assert!(h.session(&runner).await.is_none());

    let out = h.photo(&runner, 9).await;
    assert!(texts_for(&out, 106)[0].contains("1 из 3"));
    let session = h.session(&runner).await.unwrap();
    assert_eq!(session.stage, 1);
    assert_eq!(session.phase, QuestPhase::AwaitingPhoto);
    assert_eq!(session.recognition_attempts, 1);
}

#[tokio::test]
async fn approve_moves_target_to_riddle_once() {
    let h = harness().await;
    let moderator = h.moderator(900).await;
    let runner = h.linked_runner(107, 2).await;
    escalate(&h, &runner).await;

    let out = h
        .engine
        .handle_callback(&moderator, &CallbackAction::Approve(107).to_data(), None)
        .await;
    assert_eq!(
        texts_for(&out, 107),
        vec![h.catalog.stage(2).unwrap().riddle_prompt.clone()]
    );
    let session = h.session(&runner).await.unwrap();
    assert_eq!(session.phase, QuestPhase::AwaitingRiddleAnswer);
    assert_eq!(session.attempts_left, 3);

    let record = h.db.get_verification(107).await.unwrap().unwrap();
    assert_eq!(record.source, VerificationSource::Moderator);
    assert_eq!(record.distance, h.catalog.moderator_placeholder_distance);
    assert!(record.passed_date_check);

    let again = h.engine.handle_callback(&moderator, "mod:approve:107", None).await;
    assert_eq!(
        again,
        vec![Outbound::alert(&h.catalog.messages.moderator_already_handled)]
    );
}

#[tokio::test]
async fn non_staff_cannot_decide() {
    let h = harness().await;
    h.moderator(900).await;
    let runner = h.linked_runner(108, 1).await;
    let bystander = h.linked_runner(109, 1).await;
    escalate(&h, &runner).await;

    let out = h.engine.handle_callback(&bystander, "mod:approve:108", None).await;
    assert_eq!(out, vec![Outbound::alert(&h.catalog.messages.not_authorized)]);
    assert_eq!(
        h.session(&runner).await.unwrap().phase,
        QuestPhase::AwaitingModeratorDecision
    );
}

#[tokio::test]
async fn correct_answer_while_pending_skips_to_address() {
    let h = harness().await;
    h.moderator(900).await;
    let runner = h.linked_runner(110, 1).await;
    escalate(&h, &runner).await;

    let answer = h.catalog.stage(1).unwrap().riddle_answer.to_uppercase();
    h.say(&runner, &format!(" {answer} ")).await;
    assert_eq!(
        h.session(&runner).await.unwrap().phase,
        QuestPhase::AwaitingAddress
    );
}

#[tokio::test]
async fn escalation_disabled_reports_failure_without_limit() {
    let mut catalog = StageCatalog::embedded().unwrap();
    catalog
        .stages
        .iter_mut()
        .find(|s| s.stage == 4)
        .unwrap()
        .moderator_escalation = false;
    let h = harness_with(catalog, ScriptedOracle::default()).await;
    h.moderator(900).await;
    let runner = h.linked_runner(111, 4).await;
    h.engine.begin_quest(&runner).await;

    for seed in 1..=5 {
        let out = h.photo(&runner, seed).await;
        assert_eq!(texts_for(&out, 111), vec![h.catalog.messages.photo_failed.clone()]);
        assert!(out.iter().all(|o| o.chat_id() == Some(111)));
    }
    let session = h.session(&runner).await.unwrap();
    assert_eq!(session.phase, QuestPhase::AwaitingPhoto);
    assert_eq!(session.recognition_attempts, 5);
}

#[tokio::test]
async fn riddle_budget_reveals_hint_and_repeats_it() {
    let h = harness().await;
    let runner = h.linked_runner(112, 1).await;
    h.engine.begin_quest(&runner).await;
    h.oracle.push(RunData::new("26.11.2025", "10.01 км"));
    h.photo(&runner, 1).await;

    let out = h.say(&runner, "ветер").await;
    assert_eq!(texts_for(&out, 112), vec!["Неверно. Осталось попыток: 2.".to_string()]);
    let out = h.say(&runner, "гром").await;
    assert_eq!(texts_for(&out, 112), vec!["Неверно. Осталось попыток: 1.".to_string()]);

    let out = h.say(&runner, "шум").await;
    assert!(texts_for(&out, 112)[0].contains("Э _ _"));
    let session = h.session(&runner).await.unwrap();
    assert!(session.hint_shown);
    assert_eq!(session.attempts_left, 1);

    let out = h.say(&runner, "эхх").await;
    assert!(texts_for(&out, 112)[0].contains("Э _ _"));
    let session = h.session(&runner).await.unwrap();
    assert_eq!(session.phase, QuestPhase::AwaitingRiddleAnswer);
    assert_eq!(session.attempts_left, 1);

    h.say(&runner, "Эхо").await;
    assert_eq!(
        h.session(&runner).await.unwrap().phase,
        QuestPhase::AwaitingAddress
    );
}

#[tokio::test]
async fn riddle_reset_policy_drops_the_session() {
    let mut catalog = StageCatalog::embedded().unwrap();
    catalog.after_hint_exhausted = HintExhaustion::ResetStage;
    let h = harness_with(catalog, ScriptedOracle::default()).await;
    let runner = h.linked_runner(113, 1).await;
    h.engine.begin_quest(&runner).await;
    h.oracle.push(RunData::new("26.11.2025", "10.01 км"));
    h.photo(&runner, 1).await;

    for wrong in ["a", "b", "c"] {
        h.say(&runner, wrong).await;
    }
    let out = h.say(&runner, "d").await;
    assert_eq!(texts_for(&out, 113), vec![h.catalog.messages.riddle_reset.clone()]);
    assert!(h.session(&runner).await.is_none());
    assert!(!h.db.get_user(113).await.unwrap().unwrap().is_stage_completed(1));
}

#[tokio::test]
async fn short_address_is_reprompted() {
    let h = harness().await;
    let runner = h.linked_runner(114, 1).await;
    h.engine.begin_quest(&runner).await;
    h.solve_riddle(&runner, 1).await;

    let out = h.say(&runner, "  дом ").await;
    assert_eq!(texts_for(&out, 114), vec![h.catalog.messages.address_too_short.clone()]);
    assert_eq!(
        h.session(&runner).await.unwrap().phase,
        QuestPhase::AwaitingAddress
    );
    assert!(h.db.addresses_for_user(114).await.unwrap().is_empty());
}

#[tokio::test]
async fn first_completion_claims_a_promo_and_closes_the_stage() {
    let h = harness().await;
    h.db.load_promo_codes(["RUN-001", "RUN-002"]).await.unwrap();
    let runner = h.linked_runner(115, 1).await;
    h.engine.begin_quest(&runner).await;
    h.solve_riddle(&runner, 1).await;

    let out = h.say(&runner, "г. Москва, ул. Беговая, д. 1").await;
    let texts = texts_for(&out, 115);
    assert_eq!(texts[0], "Ваш промокод: RUN-001");
    assert!(texts.last().unwrap().ends_with("https://runquest.example/stage1"));
    assert!(out
        .iter()
        .any(|o| matches!(o, Outbound::Video { asset, .. } if asset == "stage1_final.mp4")));

    let user = h.db.get_user(115).await.unwrap().unwrap();
    assert_eq!(user.stage_completed, [true, false, false, false]);
    assert!(h.session(&runner).await.is_none());
    assert_eq!(h.db.addresses_for_user(115).await.unwrap().len(), 1);

    let refused = h.engine.advance_to_stage(&runner, 1).await;
    assert_eq!(
        texts_for(&refused, 115),
        vec![h.catalog.messages.stage_already_completed.clone()]
    );
    assert!(h.session(&runner).await.is_none());

    // A second stage after an admin reassignment is not a first completion.
    h.db.reassign_participant_stage("P-115", 2).await.unwrap();
    h.engine.begin_quest(&runner).await;
    h.solve_riddle(&runner, 2).await;
    let out = h.say(&runner, "г. Казань, ул. Баумана, 5").await;
    assert!(!texts_for(&out, 115).iter().any(|t| t.starts_with("Ваш промокод")));
    assert_eq!(h.db.promo_counts().await.unwrap().active, 1);
}

#[tokio::test]
async fn scenario_d_empty_pool_still_completes_stage() {
    let h = harness().await;
    let runner = h.linked_runner(116, 1).await;
    h.engine.begin_quest(&runner).await;
    h.solve_riddle(&runner, 1).await;

    let out = h.say(&runner, "г. Москва, ул. Беговая, д. 1").await;
    assert_eq!(texts_for(&out, 116)[0], h.catalog.messages.promo_exhausted);
    assert!(h.db.get_user(116).await.unwrap().unwrap().is_stage_completed(1));
}

#[tokio::test]
async fn chained_runner_moves_straight_into_the_next_stage() {
    let h = harness().await;
    h.db.load_promo_codes(["RUN-001"]).await.unwrap();
    let runner = h.linked_runner(117, 5).await;
    h.engine.begin_quest(&runner).await;
    h.solve_riddle(&runner, 1).await;

    let out = h.say(&runner, "г. Москва, ул. Беговая, д. 1").await;
    let texts = texts_for(&out, 117);
    assert_eq!(texts[0], *h.catalog.stage(1).unwrap().relic_text.as_ref().unwrap());
    assert!(texts.contains(&h.catalog.stage(2).unwrap().intro_text));

    let session = h.session(&runner).await.unwrap();
    assert_eq!(session.stage, 2);
    assert_eq!(session.phase, QuestPhase::AwaitingPhoto);
    assert!(session.is_chained_participant);

    let user = h.db.get_user(117).await.unwrap().unwrap();
    assert_eq!(user.current_stage, 2);
    assert_eq!(user.stage_completed, [true, false, false, false]);
    assert_eq!(h.db.promo_counts().await.unwrap().active, 1, "no promo for chained runners");

    for stage in 2..=4 {
        h.solve_riddle(&runner, stage).await;
        h.say(&runner, "г. Москва, ул. Беговая, д. 1").await;
    }
    let user = h.db.get_user(117).await.unwrap().unwrap();
    assert_eq!(user.stage_completed, [true; 4]);
    assert_eq!(user.current_stage, 4);
    assert!(h.session(&runner).await.is_none());
    assert_eq!(h.db.promo_counts().await.unwrap().active, 1);

    let out = h.engine.begin_quest(&runner).await;
    assert_eq!(texts_for(&out, 117), vec![h.catalog.messages.quest_finished.clone()]);
}

#[tokio::test]
async fn unlinked_users_are_sent_to_their_link() {
    let h = harness().await;
    let stranger = Actor::new(118);
    let out = h.engine.start(&stranger, Some("no-such-token")).await;
    assert_eq!(texts_for(&out, 118), vec![h.catalog.messages.not_linked.clone()]);
    let out = h.photo(&stranger, 1).await;
    assert_eq!(texts_for(&out, 118), vec![h.catalog.messages.not_linked.clone()]);
    assert_eq!(h.oracle.calls(), 0);
}

#[tokio::test]
async fn admin_commands_require_admin_role() {
    let h = harness().await;
    let runner = h.linked_runner(119, 1).await;
    let out = h.engine.run_admin(&runner, AdminCommand::Stats).await;
    assert!(texts_for(&out, 119)[0].contains("администратор"));

    let admin = Actor::new(1);
    h.engine.start(&admin, None).await;
    h.db.set_role(1, Role::Admin).await.unwrap();

    let out = h
        .engine
        .run_admin(
            &admin,
            AdminCommand::LoadPromos {
                content: "A1\n\nA2\nA1\n".to_string(),
            },
        )
        .await;
    assert!(texts_for(&out, 1)[0].contains('2'));

    let out = h.engine.run_admin(&admin, AdminCommand::Export(ExportKind::Promos)).await;
    match &out[0] {
        Outbound::Document { file_name, bytes, .. } => {
            assert_eq!(file_name, "promos.csv");
            assert!(String::from_utf8_lossy(bytes).starts_with("code,status"));
        }
        other => panic!("expected document, got {other:?}"),
    }

    h.engine.begin_quest(&runner).await;
    h.solve_riddle(&runner, 1).await;
    h.say(&runner, "г. Москва, ул. Беговая, д. 1").await;
    h.engine
        .run_admin(&admin, AdminCommand::ResetUser { telegram_id: 119 })
        .await;
    let user = h.db.get_user(119).await.unwrap().unwrap();
    assert_eq!(user.completed_count(), 0);
}

#[tokio::test]
async fn configured_admin_ids_are_promoted_on_contact() {
    let h = harness().await;
    let engine = h
        .engine
        .clone()
        .with_admin_ids(std::collections::HashSet::from([555]));
    engine.start(&Actor::new(555), None).await;
    assert_eq!(h.db.get_user(555).await.unwrap().unwrap().role, Role::Admin);
}

#[tokio::test]
async fn raffle_opt_in_is_idempotent() {
    let h = harness().await;
    let runner = h.linked_runner(120, 1).await;
    let first = h.engine.join_raffle(&runner, "finale").await;
    let second = h.engine.join_raffle(&runner, "finale").await;
    assert!(texts_for(&first, 120)[0].contains("Вы участвуете"));
    assert!(texts_for(&second, 120)[0].contains("уже участвуете"));
    assert_eq!(h.db.raffle_entrants("finale").await.unwrap().len(), 1);
}
