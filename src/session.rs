use crate::model::{GameSession, QueryResult, MAX_LEVEL, MIN_LEVEL};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    AddScore(u32),
    RecordHint,
    SetLevel(u32),
}

/// Owner of player sessions. The query service only reaches it through the
/// HTTP layer, which applies score and hint updates.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self) -> GameSession;
    async fn get_session(&self, id: &str) -> Option<GameSession>;
    async fn update_session(&self, id: &str, update: SessionUpdate) -> Option<GameSession>;
    async fn delete_session(&self, id: &str) -> bool;
    /// Returns false, storing nothing, when the session no longer exists.
    async fn store_query_result(&self, id: &str, result: QueryResult) -> bool;
    async fn latest_query_result(&self, id: &str) -> Option<QueryResult>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, GameSession>>,
    results: RwLock<HashMap<String, QueryResult>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self) -> GameSession {
        let now = Utc::now();
        let session = GameSession {
            id: Uuid::new_v4().to_string(),
            current_level: MIN_LEVEL,
            score: 0,
            hints_used: 0,
            start_time: now,
            last_activity: now,
        };
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        session
    }

    async fn get_session(&self, id: &str) -> Option<GameSession> {
        self.sessions.read().get(id).cloned()
    }

    async fn update_session(&self, id: &str, update: SessionUpdate) -> Option<GameSession> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id)?;
        match update {
            SessionUpdate::AddScore(points) => {
                session.score = session.score.saturating_add(u64::from(points));
            }
            SessionUpdate::RecordHint => {
                session.hints_used = session.hints_used.saturating_add(1);
            }
            SessionUpdate::SetLevel(level) => {
                session.current_level = level.clamp(MIN_LEVEL, MAX_LEVEL);
            }
        }
        session.last_activity = Utc::now();
        Some(session.clone())
    }

    // Lock order is sessions, then results.
    async fn delete_session(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write();
        self.results.write().remove(id);
        sessions.remove(id).is_some()
    }

    async fn store_query_result(&self, id: &str, result: QueryResult) -> bool {
        let sessions = self.sessions.read();
        if !sessions.contains_key(id) {
            return false;
        }
        self.results.write().insert(id.to_string(), result);
        true
    }

    async fn latest_query_result(&self, id: &str) -> Option<QueryResult> {
        self.results.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_sessions_start_at_level_one() {
        let store = MemorySessionStore::new();
        let a = store.create_session().await;
        let b = store.create_session().await;
        assert_ne!(a.id, b.id);
        assert_eq!(a.current_level, 1);
        assert_eq!(a.score, 0);
        assert_eq!(a.hints_used, 0);
        assert_eq!(store.get_session(&a.id).await, Some(a));
    }

    #[tokio::test]
    async fn updates_accumulate() {
        let store = MemorySessionStore::new();
        let s = store.create_session().await;
        store.update_session(&s.id, SessionUpdate::AddScore(100)).await;
        store.update_session(&s.id, SessionUpdate::AddScore(50)).await;
        store.update_session(&s.id, SessionUpdate::RecordHint).await;
        let updated = store
            .update_session(&s.id, SessionUpdate::SetLevel(7))
            .await
            .expect("session");
        assert_eq!(updated.score, 150);
        assert_eq!(updated.hints_used, 1);
        assert_eq!(updated.current_level, 7);
        assert!(updated.last_activity >= s.last_activity);
        assert_eq!(updated.start_time, s.start_time);
    }

    #[tokio::test]
    async fn unknown_sessions_are_none() {
        let store = MemorySessionStore::new();
        assert!(store.get_session("missing").await.is_none());
        assert!(store
            .update_session("missing", SessionUpdate::RecordHint)
            .await
            .is_none());
        assert!(!store.delete_session("missing").await);
    }

    #[tokio::test]
    async fn keeps_only_latest_result() {
        let store = MemorySessionStore::new();
        let s = store.create_session().await;
        store
            .store_query_result(&s.id, QueryResult::failed("first", 1))
            .await;
        store
            .store_query_result(&s.id, QueryResult::failed("second", 2))
            .await;
        let latest = store.latest_query_result(&s.id).await.expect("result");
        assert_eq!(latest.error.as_deref(), Some("second"));

        assert!(store.delete_session(&s.id).await);
        assert!(store.latest_query_result(&s.id).await.is_none());
    }

    #[tokio::test]
    async fn results_for_deleted_sessions_are_dropped() {
        let store = MemorySessionStore::new();
        let s = store.create_session().await;
        assert!(store.delete_session(&s.id).await);

        let stored = store
            .store_query_result(&s.id, QueryResult::failed("late", 3))
            .await;
        assert!(!stored);
        assert!(store.latest_query_result(&s.id).await.is_none());
        assert!(store.results.read().is_empty());

        assert!(!store.store_query_result("never-created", QueryResult::default()).await);
        assert!(store.results.read().is_empty());
    }
}
