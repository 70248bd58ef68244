//! Durable dialog state and per-session exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::session::SessionState;
use crate::errors::{RuntimeError, StoreError};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, StoreError>;

    /// Persists `state` if the stored version still equals `state.version` and returns the new
    /// version. Version 0 means the session has never been saved.
    async fn save(&self, session_id: &str, state: &SessionState) -> Result<u64, StoreError>;
}

/// In-process lock table keyed by session id.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of one turn; dropping it releases the session.
#[derive(Debug)]
pub struct SessionGuard {
    session_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the session without waiting. A turn already in flight yields `SessionBusy`.
    pub fn try_acquire(&self, session_id: &str) -> Result<SessionGuard, RuntimeError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|id, lock| id == session_id || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(session_id.to_owned()).or_default())
        };

        let guard = lock
            .try_lock_owned()
            .map_err(|_| RuntimeError::SessionBusy(session_id.to_owned()))?;
        Ok(SessionGuard { session_id: session_id.to_owned(), _guard: guard })
    }

    pub fn tracked(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or_default()
    }
}
