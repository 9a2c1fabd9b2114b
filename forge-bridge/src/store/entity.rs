//! Entity persistence.
//!
//! Translates between [`Entity`] values and the single `entities` table.
//! Type-specific fields travel in the JSONB `attributes` column via
//! [`Entity::attributes_json`] and [`Entity::from_parts`].

use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::core::entities::{Entity, EntityType};
use crate::error::{Error, Result};
use crate::protocol::JsonMap;
use crate::store::rows::EntityRow;

/// Typed reads and writes for the `entities` table
pub struct EntityRepo<'c> {
    conn: &'c mut PgConnection,
}

fn row_to_entity(row: EntityRow) -> Result<Entity> {
    let entity_type = EntityType::parse(&row.entity_type)?;
    let attributes = match row.attributes {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    };
    Entity::from_parts(
        entity_type,
        row.id,
        row.name,
        row.status.as_deref(),
        row.project_id,
        &attributes,
    )
    .map_err(Error::from)
}

impl<'c> EntityRepo<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Insert or update, preserving the id
    pub async fn save(&mut self, entity: &Entity, project_id: Option<Uuid>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entities (id, entity_type, project_id, name, status, attributes)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                attributes = EXCLUDED.attributes,
                project_id = COALESCE(EXCLUDED.project_id, entities.project_id),
                updated_at = now()
            "#,
        )
        .bind(entity.id())
        .bind(entity.entity_type().as_str())
        .bind(project_id)
        .bind(entity.name())
        .bind(entity.status().map(|s| s.as_str()))
        .bind(Value::Object(entity.attributes_json()))
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn get(&mut self, entity_id: Uuid) -> Result<Option<Entity>> {
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT id, entity_type, project_id, name, status, attributes
             FROM entities WHERE id = $1",
        )
        .bind(entity_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        row.map(row_to_entity).transpose()
    }

    /// The project a persisted entity belongs to, if any
    pub async fn project_of(&mut self, entity_id: Uuid) -> Result<Option<Uuid>> {
        let project: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT project_id FROM entities WHERE id = $1")
                .bind(entity_id)
                .fetch_optional(&mut *self.conn)
                .await?;
        Ok(project.flatten())
    }

    pub async fn list_by_type(
        &mut self,
        entity_type: EntityType,
        project_id: Option<Uuid>,
    ) -> Result<Vec<Entity>> {
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT id, entity_type, project_id, name, status, attributes
             FROM entities
             WHERE entity_type = $1 AND ($2::uuid IS NULL OR project_id = $2)
             ORDER BY name",
        )
        .bind(entity_type.as_str())
        .bind(project_id)
        .fetch_all(&mut *self.conn)
        .await?;
        rows.into_iter().map(row_to_entity).collect()
    }

    /// Entities whose attributes contain every pair in `filter`
    pub async fn find_by_attribute(
        &mut self,
        entity_type: EntityType,
        filter: &JsonMap,
        project_id: Option<Uuid>,
    ) -> Result<Vec<Entity>> {
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT id, entity_type, project_id, name, status, attributes
             FROM entities
             WHERE entity_type = $1
               AND attributes @> $2::jsonb
               AND ($3::uuid IS NULL OR project_id = $3)",
        )
        .bind(entity_type.as_str())
        .bind(Value::Object(filter.clone()))
        .bind(project_id)
        .fetch_all(&mut *self.conn)
        .await?;
        rows.into_iter().map(row_to_entity).collect()
    }

    pub async fn delete(&mut self, entity_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entities WHERE id = $1")
            .bind(entity_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Rewrite every layer holding `old_key` to `new_key`.
    ///
    /// This is the persistence half of a role delete-with-migration; it
    /// runs in the same transaction as the registry row delete.
    pub async fn rewrite_role_key(&mut self, old_key: Uuid, new_key: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE entities
            SET attributes = jsonb_set(attributes, '{role_key}', to_jsonb($2::text)),
                updated_at = now()
            WHERE entity_type = 'layer' AND attributes->>'role_key' = $1
            "#,
        )
        .bind(old_key.to_string())
        .bind(new_key.to_string())
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected())
    }
}
