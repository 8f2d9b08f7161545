//! Persisted per-learner conversational sessions (quiz, recitation).
//!
//! A learner has at most one active session; the store enforces it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::ids::{LearnerId, SessionId};
use crate::store::{ProgressStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Quiz,
    Recitation,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Quiz => "quiz",
            SessionKind::Recitation => "recitation",
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quiz" => Ok(SessionKind::Quiz),
            "recitation" => Ok(SessionKind::Recitation),
            other => Err(StoreError::Backend(format!("unknown session kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub learner_id: LearnerId,
    pub kind: SessionKind,
    /// Opaque state owned by the collaborator running the session
    pub state: serde_json::Value,
    pub active: bool,
    /// Number of updates applied since start
    pub turn: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct SessionManager {
    store: Arc<dyn ProgressStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    /// Start a session. Fails with `InvalidState` when one is already active.
    pub async fn start(
        &self,
        learner_id: LearnerId,
        kind: SessionKind,
        state: serde_json::Value,
    ) -> EngineResult<Session> {
        let now = Utc::now();
        let session = Session {
            id: SessionId::new(),
            learner_id,
            kind,
            state,
            active: true,
            turn: 0,
            created_at: now,
            updated_at: now,
        };
        match self.store.insert_session(&session).await {
            Ok(()) => {
                tracing::debug!("Started {} session {} for {}", kind.as_str(), session.id, learner_id);
                Ok(session)
            }
            Err(StoreError::Conflict(_)) => Err(EngineError::InvalidState(format!(
                "learner {} already has an active session",
                learner_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the session state and count the turn.
    pub async fn update(&self, id: SessionId, state: serde_json::Value) -> EngineResult<Session> {
        let mut session = self.load(id).await?;
        if !session.active {
            return Err(EngineError::InvalidState(format!(
                "session {} is finished",
                id
            )));
        }
        session.state = state;
        session.turn += 1;
        session.updated_at = Utc::now();
        self.store.update_session(&session).await?;
        Ok(session)
    }

    /// Deactivate the session. Finishing a finished session is a no-op.
    pub async fn finish(&self, id: SessionId) -> EngineResult<Session> {
        let mut session = self.load(id).await?;
        if session.active {
            session.active = false;
            session.updated_at = Utc::now();
            self.store.update_session(&session).await?;
        }
        Ok(session)
    }

    pub async fn current(&self, learner_id: LearnerId) -> EngineResult<Option<Session>> {
        Ok(self.store.get_active_session(learner_id).await?)
    }

    async fn load(&self, id: SessionId) -> EngineResult<Session> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("session {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryProgressStore;
    use serde_json::json;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(InMemoryProgressStore::new()))
    }

    #[tokio::test]
    async fn one_active_session_per_learner() {
        let sessions = manager();
        let learner = LearnerId::new();
        let first = sessions
            .start(learner, SessionKind::Quiz, json!({"question": 1}))
            .await
            .unwrap();

        let err = sessions
            .start(learner, SessionKind::Recitation, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        sessions.finish(first.id).await.unwrap();
        assert!(sessions.current(learner).await.unwrap().is_none());
        sessions
            .start(learner, SessionKind::Recitation, json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_counts_turns_and_rejects_finished_sessions() {
        let sessions = manager();
        let learner = LearnerId::new();
        let session = sessions
            .start(learner, SessionKind::Quiz, json!({"score": 0}))
            .await
            .unwrap();

        let updated = sessions.update(session.id, json!({"score": 1})).await.unwrap();
        assert_eq!(updated.turn, 1);
        assert_eq!(
            sessions.current(learner).await.unwrap().map(|s| s.state),
            Some(json!({"score": 1}))
        );

        let finished = sessions.finish(session.id).await.unwrap();
        assert!(!finished.active);
        assert!(!sessions.finish(session.id).await.unwrap().active);
        assert!(matches!(
            sessions.update(session.id, json!({})).await,
            Err(EngineError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let sessions = manager();
        assert!(matches!(
            sessions.finish(SessionId::new()).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
