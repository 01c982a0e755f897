use std::collections::HashMap;

use async_trait::async_trait;
use quest_core::QuestSession;
use quest_storage::{QuestDb, StorageError};
use tokio::sync::Mutex;

/// Keyed per-user session slot.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, telegram_id: i64) -> Result<Option<QuestSession>, StorageError>;
    async fn set(&self, telegram_id: i64, session: &QuestSession) -> Result<(), StorageError>;
    async fn clear(&self, telegram_id: i64) -> Result<(), StorageError>;
}

/// Sessions persisted as JSON blobs, surviving restarts.
#[async_trait]
impl SessionStore for QuestDb {
    async fn get(&self, telegram_id: i64) -> Result<Option<QuestSession>, StorageError> {
        self.load_session(telegram_id).await
    }

    async fn set(&self, telegram_id: i64, session: &QuestSession) -> Result<(), StorageError> {
        self.save_session(telegram_id, session).await
    }

    async fn clear(&self, telegram_id: i64) -> Result<(), StorageError> {
        self.clear_session(telegram_id).await
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<i64, QuestSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, telegram_id: i64) -> Result<Option<QuestSession>, StorageError> {
        Ok(self.sessions.lock().await.get(&telegram_id).cloned())
    }

    async fn set(&self, telegram_id: i64, session: &QuestSession) -> Result<(), StorageError> {
        self.sessions
            .lock()
            .await
            .insert(telegram_id, session.clone());
        Ok(())
    }

    async fn clear(&self, telegram_id: i64) -> Result<(), StorageError> {
        self.sessions.lock().await.remove(&telegram_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quest_core::QuestPhase;

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemorySessionStore::new();
        assert!(store.get(1).await.unwrap().is_none());

        let mut session = QuestSession::start(2, false);
        session.phase = QuestPhase::AwaitingAddress;
        store.set(1, &session).await.unwrap();
        assert_eq!(store.get(1).await.unwrap(), Some(session));
        assert_eq!(store.len().await, 1);

        store.clear(1).await.unwrap();
        assert!(store.get(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn database_store_shares_reset_with_progress() {
        let db = QuestDb::in_memory().await.unwrap();
        db.ensure_user(5, None, quest_core::Role::User).await.unwrap();
        SessionStore::set(&db, 5, &QuestSession::start(1, true)).await.unwrap();
        assert!(SessionStore::get(&db, 5).await.unwrap().is_some());

        db.reset_user_progress(5).await.unwrap();
        assert!(SessionStore::get(&db, 5).await.unwrap().is_none());
    }
}
