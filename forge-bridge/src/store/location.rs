//! Location persistence

use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::core::traits::Location;
use crate::error::Result;
use crate::store::rows::LocationRow;

/// Typed reads and writes for the `locations` table
pub struct LocationRepo<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> LocationRepo<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Replace every location owned by an entity, atomically within the
    /// caller's transaction
    pub async fn replace_entity_locations(
        &mut self,
        entity_id: Uuid,
        locations: &[Location],
    ) -> Result<()> {
        sqlx::query("DELETE FROM locations WHERE entity_id = $1")
            .bind(entity_id)
            .execute(&mut *self.conn)
            .await?;
        for location in locations {
            sqlx::query(
                r#"
                INSERT INTO locations (id, entity_id, path, storage_type, priority, "exists", attributes)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(entity_id)
            .bind(&location.path)
            .bind(location.storage_type.as_str())
            .bind(location.priority)
            .bind(location.exists)
            .bind(Value::Object(location.metadata.clone().into_iter().collect()))
            .execute(&mut *self.conn)
            .await?;
        }
        Ok(())
    }

    /// All locations for an entity, highest priority first
    pub async fn list_for_entity(&mut self, entity_id: Uuid) -> Result<Vec<Location>> {
        let rows = sqlx::query_as::<_, LocationRow>(
            r#"
            SELECT path, storage_type, priority, "exists", attributes
            FROM locations
            WHERE entity_id = $1
            ORDER BY priority DESC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
