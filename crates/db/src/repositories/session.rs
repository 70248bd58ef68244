use chrono::Utc;
use sqlx::Row;
use tracing::debug;

use convoflow_core::domain::session::SessionState;
use convoflow_core::errors::StoreError;
use convoflow_core::session::SessionStore;

use super::RepositoryError;
use crate::DbPool;

/// Session state persisted as a JSON document guarded by an optimistic `version` column.
pub struct SqlSessionStore {
    pool: DbPool,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Removes a session; returns whether a row existed.
    pub async fn delete(&self, session_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM session_state WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM session_state")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }

    async fn insert(&self, session_id: &str, state_json: &str) -> Result<bool, RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO session_state (session_id, state_json, version, created_at, updated_at)
             VALUES (?, ?, 1, ?, ?)
             ON CONFLICT(session_id) DO NOTHING",
        )
        .bind(session_id)
        .bind(state_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update(
        &self,
        session_id: &str,
        state_json: &str,
        expected: u64,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE session_state
             SET state_json = ?, version = version + 1, updated_at = ?
             WHERE session_id = ? AND version = ?",
        )
        .bind(state_json)
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .bind(version_param(expected))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn version_param(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

#[async_trait::async_trait]
impl SessionStore for SqlSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, StoreError> {
        let row = sqlx::query("SELECT state_json, version FROM session_state WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let state_json = row.get::<String, _>("state_json");
        let version = row.get::<i64, _>("version");
        let mut state: SessionState = serde_json::from_str(&state_json).map_err(|error| {
            StoreError::Decode { session_id: session_id.to_owned(), message: error.to_string() }
        })?;
        state.version = u64::try_from(version).map_err(|_| StoreError::Decode {
            session_id: session_id.to_owned(),
            message: format!("negative version {version}"),
        })?;
        Ok(Some(state))
    }

    async fn save(&self, session_id: &str, state: &SessionState) -> Result<u64, StoreError> {
        let state_json = serde_json::to_string(state)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        let written = if state.version == 0 {
            self.insert(session_id, &state_json).await?
        } else {
            self.update(session_id, &state_json, state.version).await?
        };
        if !written {
            return Err(StoreError::VersionConflict {
                session_id: session_id.to_owned(),
                expected: state.version,
            });
        }

        debug!(
            event_name = "db.session_state.saved",
            session_id,
            version = state.version + 1,
            "session state persisted"
        );
        Ok(state.version + 1)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use convoflow_core::domain::session::SessionState;
    use convoflow_core::errors::StoreError;
    use convoflow_core::session::SessionStore;

    use super::SqlSessionStore;
    use crate::{connect_with_settings, migrations::run_pending};

    async fn store() -> SqlSessionStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        SqlSessionStore::new(pool)
    }

    #[tokio::test]
    async fn corrupted_rows_surface_as_decode_errors() {
        let store = store().await;
        sqlx::query(
            "INSERT INTO session_state (session_id, state_json, version, created_at, updated_at)
             VALUES ('s-1', 'not json', 1, 'now', 'now')",
        )
        .execute(&store.pool)
        .await
        .expect("insert corrupt row");

        let error = store.load("s-1").await.expect_err("decode failure");
        assert!(matches!(error, StoreError::Decode { ref session_id, .. } if session_id == "s-1"));
    }

    #[tokio::test]
    async fn delete_and_count_track_rows() {
        let store = store().await;
        let mut state = SessionState::default();
        state.scopes.session.insert("k".to_owned(), json!(1));
        store.save("s-1", &state).await.expect("save");
        store.save("s-2", &state).await.expect("save");

        assert_eq!(store.count().await.expect("count"), 2);
        assert!(store.delete("s-1").await.expect("delete"));
        assert!(!store.delete("s-1").await.expect("delete again"));
        assert_eq!(store.count().await.expect("count"), 1);
    }
}
