//! Registry persistence.
//!
//! The registry lives in memory and is the authority at runtime; this repo
//! writes changes through and rebuilds the full in-memory state at server
//! startup.

use serde_json::{json, Value};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::core::registry::{Registry, RelationshipTypeDef, RoleDefinition};
use crate::error::Result;
use crate::store::rows::{RelationshipTypeRow, RoleRow};

/// Reads and writes for the two registry tables
pub struct RegistryRepo<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> RegistryRepo<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    // ── Roles ───────────────────────────────────────────────────────────

    pub async fn save_role(&mut self, role: &RoleDefinition) -> Result<()> {
        let attributes = json!({
            "path_template": role.path_template,
            "aliases": role.aliases,
        });
        sqlx::query(
            r#"
            INSERT INTO registry_roles (key, name, label, role_class, sort_order, protected, attributes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (key) DO UPDATE SET
                name = EXCLUDED.name,
                label = EXCLUDED.label,
                role_class = EXCLUDED.role_class,
                sort_order = EXCLUDED.sort_order,
                protected = EXCLUDED.protected,
                attributes = EXCLUDED.attributes,
                updated_at = now()
            "#,
        )
        .bind(role.key)
        .bind(&role.name)
        .bind(&role.label)
        .bind(role.role_class.as_str())
        .bind(role.order)
        .bind(role.protected)
        .bind(attributes)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn delete_role(&mut self, key: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM registry_roles WHERE key = $1")
            .bind(key)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn load_all_roles(&mut self) -> Result<Vec<RoleDefinition>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            "SELECT key, name, label, role_class, sort_order, protected, attributes
             FROM registry_roles ORDER BY sort_order",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // ── Relationship types ──────────────────────────────────────────────

    pub async fn save_relationship_type(&mut self, typedef: &RelationshipTypeDef) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO registry_relationship_types
                (key, name, label, description, directionality, protected)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (key) DO UPDATE SET
                name = EXCLUDED.name,
                label = EXCLUDED.label,
                description = EXCLUDED.description,
                directionality = EXCLUDED.directionality,
                protected = EXCLUDED.protected,
                updated_at = now()
            "#,
        )
        .bind(typedef.key)
        .bind(&typedef.name)
        .bind(&typedef.label)
        .bind(&typedef.description)
        .bind(typedef.directionality.to_string())
        .bind(typedef.protected)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn delete_relationship_type(&mut self, key: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM registry_relationship_types WHERE key = $1")
            .bind(key)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn load_all_relationship_types(&mut self) -> Result<Vec<RelationshipTypeDef>> {
        let rows = sqlx::query_as::<_, RelationshipTypeRow>(
            "SELECT key, name, label, description, directionality, protected
             FROM registry_relationship_types ORDER BY name",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // ── Restore ─────────────────────────────────────────────────────────

    /// Rebuild the in-memory registry from the persisted state of record.
    ///
    /// Persisted rows overlay the seeded defaults by key, so renames of
    /// protected entries survive restarts. Reference counts are rebuilt by
    /// scanning layer attributes and graph edges.
    pub async fn restore_registry(&mut self) -> Result<Registry> {
        let mut registry = Registry::default();

        for role in self.load_all_roles().await? {
            registry.roles.restore(role);
        }
        for typedef in self.load_all_relationship_types().await? {
            registry.relationship_types.restore(typedef);
        }

        // Rebuild role usage from persisted layers
        let layer_roles: Vec<(Uuid, Value)> = sqlx::query_as(
            "SELECT id, attributes->'role_key' FROM entities
             WHERE entity_type = 'layer' AND attributes ? 'role_key'",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        for (entity_id, role_key) in layer_roles {
            if let Some(key) = role_key.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                registry.roles.register_usage(key, entity_id);
            }
        }

        // Rebuild relationship-type usage from persisted edges
        let edges: Vec<(Uuid, Uuid, Uuid)> =
            sqlx::query_as("SELECT source_id, target_id, rel_type_key FROM relationships")
                .fetch_all(&mut *self.conn)
                .await?;
        for (source_id, target_id, rel_type_key) in edges {
            registry
                .relationship_types
                .register_usage(rel_type_key, (source_id, target_id));
        }

        Ok(registry)
    }

    /// Write every definition through, so first boot lands the seeds in
    /// the store. Idempotent.
    pub async fn persist_registry(&mut self, registry: &Registry) -> Result<()> {
        for role in registry.roles.all() {
            self.save_role(role).await?;
        }
        for typedef in registry.relationship_types.all() {
            self.save_relationship_type(typedef).await?;
        }
        Ok(())
    }
}
