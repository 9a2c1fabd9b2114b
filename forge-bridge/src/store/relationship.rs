//! Dependency graph persistence

use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::core::traits::Relationship;
use crate::error::Result;
use crate::store::rows::RelationshipRow;

/// Typed reads and writes for the `relationships` table
pub struct RelationshipRepo<'c> {
    conn: &'c mut PgConnection,
}

const SELECT_EDGE: &str =
    "SELECT source_id, target_id, rel_type_key, attributes, created_at FROM relationships";

impl<'c> RelationshipRepo<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Insert an edge. Idempotent on the unique triple — returns whether a
    /// new row was written.
    pub async fn save(&mut self, rel: &Relationship) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO relationships (id, source_id, target_id, rel_type_key, attributes)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT ON CONSTRAINT uq_relationships_edge DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(rel.source_id)
        .bind(rel.target_id)
        .bind(rel.rel_type_key)
        .bind(Value::Object(rel.attributes.clone()))
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Edges leaving `source_id`, optionally filtered by type
    pub async fn outgoing(
        &mut self,
        source_id: Uuid,
        rel_type_key: Option<Uuid>,
    ) -> Result<Vec<Relationship>> {
        let rows = sqlx::query_as::<_, RelationshipRow>(&format!(
            "{SELECT_EDGE} WHERE source_id = $1 AND ($2::uuid IS NULL OR rel_type_key = $2)"
        ))
        .bind(source_id)
        .bind(rel_type_key)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Edges arriving at `target_id`, optionally filtered by type
    pub async fn incoming(
        &mut self,
        target_id: Uuid,
        rel_type_key: Option<Uuid>,
    ) -> Result<Vec<Relationship>> {
        let rows = sqlx::query_as::<_, RelationshipRow>(&format!(
            "{SELECT_EDGE} WHERE target_id = $1 AND ($2::uuid IS NULL OR rel_type_key = $2)"
        ))
        .bind(target_id)
        .bind(rel_type_key)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Every edge touching an entity, in either direction
    pub async fn for_entity(&mut self, entity_id: Uuid) -> Result<Vec<Relationship>> {
        let rows = sqlx::query_as::<_, RelationshipRow>(&format!(
            "{SELECT_EDGE} WHERE source_id = $1 OR target_id = $1"
        ))
        .bind(entity_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Every edge touching any entity of a project
    pub async fn for_project(&mut self, project_id: Uuid) -> Result<Vec<Relationship>> {
        let rows = sqlx::query_as::<_, RelationshipRow>(
            r#"
            SELECT DISTINCT r.source_id, r.target_id, r.rel_type_key, r.attributes, r.created_at
            FROM relationships r
            JOIN entities e ON e.id = r.source_id OR e.id = r.target_id
            WHERE e.project_id = $1
            "#,
        )
        .bind(project_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// IDs of every entity with an edge pointing TO `entity_id` — the
    /// blast-radius query: "what depends on this?"
    pub async fn get_dependents(&mut self, entity_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT source_id FROM relationships WHERE target_id = $1",
        )
        .bind(entity_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(ids)
    }

    /// IDs of every entity that `entity_id` points TO — "what does this
    /// depend on?"
    pub async fn get_dependencies(&mut self, entity_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT target_id FROM relationships WHERE source_id = $1",
        )
        .bind(entity_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(ids)
    }

    /// Remove one edge by its triple. Returns whether a row was deleted.
    pub async fn delete(
        &mut self,
        source_id: Uuid,
        target_id: Uuid,
        rel_type_key: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM relationships
             WHERE source_id = $1 AND target_id = $2 AND rel_type_key = $3",
        )
        .bind(source_id)
        .bind(target_id)
        .bind(rel_type_key)
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Rewrite every edge of `old_key` to `new_key`.
    ///
    /// Edges that would collide with an existing edge of the target type
    /// are dropped instead — the surviving edge already expresses the link.
    pub async fn migrate_type(&mut self, old_key: Uuid, new_key: Uuid) -> Result<u64> {
        let rewritten = sqlx::query(
            r#"
            UPDATE relationships r
            SET rel_type_key = $2
            WHERE r.rel_type_key = $1
              AND NOT EXISTS (
                  SELECT 1 FROM relationships d
                  WHERE d.source_id = r.source_id
                    AND d.target_id = r.target_id
                    AND d.rel_type_key = $2
              )
            "#,
        )
        .bind(old_key)
        .bind(new_key)
        .execute(&mut *self.conn)
        .await?;
        sqlx::query("DELETE FROM relationships WHERE rel_type_key = $1")
            .bind(old_key)
            .execute(&mut *self.conn)
            .await?;
        Ok(rewritten.rows_affected())
    }
}
