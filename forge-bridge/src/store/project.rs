//! Project persistence

use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::core::entities::Project;
use crate::error::Result;
use crate::store::rows::value_to_map;

/// Typed reads and writes for the `projects` table
pub struct ProjectRepo<'c> {
    conn: &'c mut PgConnection,
}

#[derive(Debug, sqlx::FromRow)]
struct ProjectRow {
    id: Uuid,
    name: String,
    code: String,
    attributes: Value,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        let mut project = Project::new(row.name, row.code);
        project.id = row.id;
        project.metadata = value_to_map(row.attributes);
        project
    }
}

impl<'c> ProjectRepo<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Insert or update, preserving the id
    pub async fn save(&mut self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, code, attributes)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                code = EXCLUDED.code,
                attributes = EXCLUDED.attributes,
                updated_at = now()
            "#,
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(&project.code)
        .bind(Value::Object(project.metadata.clone()))
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn get(&mut self, project_id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, code, attributes FROM projects WHERE id = $1",
        )
        .bind(project_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_by_code(&mut self, code: &str) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, code, attributes FROM projects WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_all(&mut self) -> Result<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, code, attributes FROM projects ORDER BY name",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Delete a project. Entities, locations, and edges cascade in the
    /// store; registry usage cleanup is the caller's responsibility.
    pub async fn delete(&mut self, project_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(project_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
