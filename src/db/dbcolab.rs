use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Error as SqlxError;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{GatewayFuture, PersistenceGateway};
use crate::models::{PresenceRecord, SnapshotRecord};

/// Postgres-backed persistence gateway.
///
/// Expects the `document_snapshots`, `document_updates` and
/// `document_presence` tables to exist; schema management lives elsewhere.
#[derive(Clone)]
pub struct DbColab {
    pool: PgPool,
}

impl DbColab {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    ///
    /// # Returns
    /// * `Result<Self, SqlxError>` - Database connection pool or error
    pub async fn new(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // Close idle connections after 10 minutes
            .max_lifetime(Duration::from_secs(1800)) // Recycle connections after 30 minutes
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    pub async fn get_snapshot(&self, document_id: Uuid) -> Result<Option<SnapshotRecord>, SqlxError> {
        let query_sql = r#"
            SELECT document_id, state, version, modified_by, updated_at
            FROM document_snapshots
            WHERE document_id = $1
        "#;

        sqlx::query_as::<_, SnapshotRecord>(query_sql)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Upsert the snapshot. A stored snapshot with a higher version is kept,
    /// so a late periodic save never rolls a document back.
    pub async fn upsert_snapshot(
        &self,
        document_id: Uuid,
        state: &[u8],
        version: i64,
        modified_by: Option<&str>,
    ) -> Result<(), SqlxError> {
        let query_sql = r#"
            INSERT INTO document_snapshots (document_id, state, version, modified_by, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (document_id) DO UPDATE SET
                state = EXCLUDED.state,
                version = EXCLUDED.version,
                modified_by = EXCLUDED.modified_by,
                updated_at = EXCLUDED.updated_at
            WHERE document_snapshots.version <= EXCLUDED.version
        "#;

        sqlx::query(query_sql)
            .bind(document_id)
            .bind(state)
            .bind(version)
            .bind(modified_by)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_update(
        &self,
        document_id: Uuid,
        user_id: &str,
        update: &[u8],
        version: i64,
    ) -> Result<(), SqlxError> {
        let query_sql = r#"
            INSERT INTO document_updates (document_id, update_data, user_id, version, created_at)
            VALUES ($1, $2, $3, $4, $5)
        "#;

        sqlx::query(query_sql)
            .bind(document_id)
            .bind(update)
            .bind(user_id)
            .bind(version)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_presence_row(
        &self,
        document_id: Uuid,
        user_id: &str,
        cursor_position: Option<serde_json::Value>,
    ) -> Result<(), SqlxError> {
        let query_sql = r#"
            INSERT INTO document_presence (document_id, user_id, cursor_position, last_seen)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (document_id, user_id) DO UPDATE SET
                cursor_position = EXCLUDED.cursor_position,
                last_seen = EXCLUDED.last_seen
        "#;

        sqlx::query(query_sql)
            .bind(document_id)
            .bind(user_id)
            .bind(cursor_position.map(Json))
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_presence_rows(&self, document_id: Uuid) -> Result<Vec<PresenceRecord>, SqlxError> {
        let query_sql = r#"
            SELECT document_id, user_id, cursor_position, last_seen
            FROM document_presence
            WHERE document_id = $1
            ORDER BY last_seen DESC
        "#;

        sqlx::query_as::<_, PresenceRecord>(query_sql)
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn delete_presence_row(&self, document_id: Uuid, user_id: &str) -> Result<(), SqlxError> {
        sqlx::query("DELETE FROM document_presence WHERE document_id = $1 AND user_id = $2")
            .bind(document_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn log_failure(op: &str, document_id: Uuid, e: SqlxError) -> String {
    error!("Database error during {} for document '{}': {}", op, document_id, e);
    format!("Database error during {}: {}", op, e)
}

impl PersistenceGateway for DbColab {
    fn load_snapshot(&self, document_id: Uuid) -> GatewayFuture<Option<SnapshotRecord>> {
        let db = self.clone();
        Box::pin(async move {
            db.get_snapshot(document_id)
                .await
                .map_err(|e| log_failure("load_snapshot", document_id, e))
        })
    }

    fn save_snapshot(
        &self,
        document_id: Uuid,
        state: Vec<u8>,
        version: i64,
        modified_by: Option<String>,
    ) -> GatewayFuture<()> {
        let db = self.clone();
        Box::pin(async move {
            db.upsert_snapshot(document_id, &state, version, modified_by.as_deref())
                .await
                .map_err(|e| log_failure("save_snapshot", document_id, e))?;
            debug!("Snapshot saved for document {} at version {}", document_id, version);
            Ok(())
        })
    }

    fn save_update(&self, document_id: Uuid, user_id: String, update: Vec<u8>, version: i64) -> GatewayFuture<()> {
        let db = self.clone();
        Box::pin(async move {
            db.insert_update(document_id, &user_id, &update, version)
                .await
                .map_err(|e| log_failure("save_update", document_id, e))
        })
    }

    fn upsert_presence(
        &self,
        document_id: Uuid,
        user_id: String,
        cursor_position: Option<serde_json::Value>,
    ) -> GatewayFuture<()> {
        let db = self.clone();
        Box::pin(async move {
            db.upsert_presence_row(document_id, &user_id, cursor_position)
                .await
                .map_err(|e| log_failure("upsert_presence", document_id, e))
        })
    }

    fn list_presence(&self, document_id: Uuid) -> GatewayFuture<Vec<PresenceRecord>> {
        let db = self.clone();
        Box::pin(async move {
            db.get_presence_rows(document_id)
                .await
                .map_err(|e| log_failure("list_presence", document_id, e))
        })
    }

    fn remove_presence(&self, document_id: Uuid, user_id: String) -> GatewayFuture<()> {
        let db = self.clone();
        Box::pin(async move {
            db.delete_presence_row(document_id, &user_id)
                .await
                .map_err(|e| log_failure("remove_presence", document_id, e))
        })
    }
}
