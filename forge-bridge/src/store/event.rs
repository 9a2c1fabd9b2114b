//! Append-only event log.
//!
//! Nothing here updates or deletes records. Appending happens inside the
//! same transaction as the state mutation it describes, so a committed
//! write implies a committed event.

use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::Result;
use crate::store::rows::EventRecord;

/// A pending append
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: Value,
    pub session_id: Option<Uuid>,
    pub client_name: Option<String>,
    pub project_id: Option<Uuid>,
    pub entity_id: Option<Uuid>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            session_id: None,
            client_name: None,
            project_id: None,
            entity_id: None,
        }
    }

    pub fn session(mut self, session_id: Uuid, client_name: &str) -> Self {
        self.session_id = Some(session_id);
        self.client_name = Some(client_name.to_string());
        self
    }

    pub fn project(mut self, project_id: Option<Uuid>) -> Self {
        self.project_id = project_id;
        self
    }

    pub fn entity(mut self, entity_id: Option<Uuid>) -> Self {
        self.entity_id = entity_id;
        self
    }
}

/// Filters for [`EventRepo::get_recent`]
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub project_id: Option<Uuid>,
    pub entity_id: Option<Uuid>,
}

const SELECT_EVENT: &str = "SELECT id, event_type, session_id, client_name, project_id, \
                            entity_id, payload, occurred_at FROM events";

/// Reads and appends for the `events` table
pub struct EventRepo<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> EventRepo<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Append one event within the caller's transaction
    pub async fn append(&mut self, event: NewEvent) -> Result<EventRecord> {
        let id = Uuid::new_v4();
        let record = sqlx::query_as::<_, EventRecord>(
            r#"
            INSERT INTO events (id, event_type, session_id, client_name, project_id, entity_id, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, event_type, session_id, client_name, project_id, entity_id, payload, occurred_at
            "#,
        )
        .bind(id)
        .bind(&event.event_type)
        .bind(event.session_id)
        .bind(&event.client_name)
        .bind(event.project_id)
        .bind(event.entity_id)
        .bind(&event.payload)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(record)
    }

    /// The most recent events, newest first, optionally filtered
    pub async fn get_recent(&mut self, limit: u32, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRecord>(&format!(
            "{SELECT_EVENT}
             WHERE ($1::text IS NULL OR event_type = $1)
               AND ($2::uuid IS NULL OR project_id = $2)
               AND ($3::uuid IS NULL OR entity_id = $3)
             ORDER BY occurred_at DESC, id DESC
             LIMIT $4"
        ))
        .bind(&filter.event_type)
        .bind(filter.project_id)
        .bind(filter.entity_id)
        .bind(i64::from(limit))
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }

    /// Events strictly after the cursor event, in log order.
    ///
    /// An unknown cursor yields an empty result — the client is so far
    /// behind that a full resync is required, and that is signalled by
    /// silence, not an error.
    pub async fn get_since(&mut self, cursor_id: Uuid, limit: u32) -> Result<Vec<EventRecord>> {
        let anchor: Option<EventRecord> =
            sqlx::query_as::<_, EventRecord>(&format!("{SELECT_EVENT} WHERE id = $1"))
                .bind(cursor_id)
                .fetch_optional(&mut *self.conn)
                .await?;
        let Some(anchor) = anchor else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query_as::<_, EventRecord>(&format!(
            "{SELECT_EVENT}
             WHERE (occurred_at, id) > ($1, $2)
             ORDER BY occurred_at, id
             LIMIT $3"
        ))
        .bind(anchor.occurred_at)
        .bind(anchor.id)
        .bind(i64::from(limit))
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }
}
