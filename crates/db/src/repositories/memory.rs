use std::collections::HashMap;

use tokio::sync::RwLock;

use convoflow_core::domain::session::SessionState;
use convoflow_core::errors::StoreError;
use convoflow_core::session::SessionStore;

/// Process-local session store with the same version semantics as the SQL store.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned())
    }

    async fn save(&self, session_id: &str, state: &SessionState) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored_version = sessions.get(session_id).map_or(0, |stored| stored.version);
        if stored_version != state.version {
            return Err(StoreError::VersionConflict {
                session_id: session_id.to_owned(),
                expected: state.version,
            });
        }

        let version = stored_version + 1;
        sessions.insert(session_id.to_owned(), SessionState { version, ..state.clone() });
        Ok(version)
    }
}
