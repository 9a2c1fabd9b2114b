//! Connected client session tracking

use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::Result;
use crate::store::rows::SessionRecord;

/// A session row to open at handshake time
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub client_name: String,
    pub endpoint_type: Option<String>,
    pub host: Option<String>,
    pub capabilities: Value,
}

/// Reads and writes for the `sessions` table.
///
/// Rows are opened on accepted handshake and closed on disconnect; they
/// are never deleted.
pub struct ClientSessionRepo<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> ClientSessionRepo<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    pub async fn open(&mut self, session: &NewSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, client_name, endpoint_type, host, capabilities)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session.id)
        .bind(&session.client_name)
        .bind(&session.endpoint_type)
        .bind(&session.host)
        .bind(&session.capabilities)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn close(&mut self, session_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET disconnected_at = now(), last_seen_at = now() WHERE id = $1",
        )
        .bind(session_id)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn heartbeat(&mut self, session_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_seen_at = now() WHERE id = $1")
            .bind(session_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn list_active(&mut self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query_as::<_, SessionRecord>(
            "SELECT id, client_name, endpoint_type, host, capabilities,
                    connected_at, disconnected_at, last_seen_at
             FROM sessions
             WHERE disconnected_at IS NULL
             ORDER BY connected_at",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }
}
