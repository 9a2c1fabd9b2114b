//! Schema bootstrap.
//!
//! Idempotent `CREATE TABLE IF NOT EXISTS` statements executed at startup.
//! Design rules:
//!
//!   1. UUIDs everywhere as primary keys — every entity already carries one.
//!   2. Separate tables per concern: registry, projects, entities, graph,
//!      events, sessions.
//!   3. One `entities` table with a type discriminator; type-specific
//!      fields live in the JSONB `attributes` column, with the frequently
//!      queried fields promoted to indexed columns.
//!   4. The events table is append-only — never updated, never deleted.
//!   5. All times UTC, `TIMESTAMPTZ`.
//!   6. `rel_type_key` is deliberately not a foreign key into the registry
//!      table — orphan protection is enforced at the application layer so
//!      a registry delete can never cascade into the graph.

use sqlx::PgPool;

use crate::error::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS registry_roles (
        key         UUID PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        label       TEXT NOT NULL,
        role_class  TEXT NOT NULL DEFAULT 'track',
        sort_order  INTEGER NOT NULL DEFAULT 0,
        protected   BOOLEAN NOT NULL DEFAULT FALSE,
        attributes  JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS registry_relationship_types (
        key            UUID PRIMARY KEY,
        name           TEXT NOT NULL UNIQUE,
        label          TEXT NOT NULL,
        description    TEXT NOT NULL DEFAULT '',
        directionality TEXT NOT NULL DEFAULT '→',
        protected      BOOLEAN NOT NULL DEFAULT FALSE,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at     TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL,
        code        TEXT NOT NULL,
        attributes  JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT uq_projects_code UNIQUE (code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        id          UUID PRIMARY KEY,
        entity_type TEXT NOT NULL,
        project_id  UUID REFERENCES projects(id) ON DELETE CASCADE,
        name        TEXT,
        status      TEXT,
        attributes  JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT ck_entities_type CHECK (entity_type IN
            ('sequence', 'shot', 'asset', 'version', 'media', 'layer', 'stack'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_entities_project_type ON entities (project_id, entity_type)",
    "CREATE INDEX IF NOT EXISTS ix_entities_type_name ON entities (entity_type, name)",
    "CREATE INDEX IF NOT EXISTS ix_entities_attributes ON entities USING gin (attributes)",
    r#"
    CREATE TABLE IF NOT EXISTS locations (
        id           UUID PRIMARY KEY,
        project_id   UUID REFERENCES projects(id) ON DELETE CASCADE,
        entity_id    UUID REFERENCES entities(id) ON DELETE CASCADE,
        path         TEXT NOT NULL,
        storage_type TEXT NOT NULL DEFAULT 'local',
        priority     INTEGER NOT NULL DEFAULT 0,
        "exists"     BOOLEAN,
        attributes   JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        checked_at   TIMESTAMPTZ,
        CONSTRAINT ck_locations_owner CHECK (
            (project_id IS NOT NULL)::int + (entity_id IS NOT NULL)::int = 1
        ),
        CONSTRAINT ck_locations_storage_type CHECK (storage_type IN
            ('local', 'network', 'cloud', 'archive', 'clip'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_locations_entity_priority ON locations (entity_id, priority)",
    r#"
    CREATE TABLE IF NOT EXISTS relationships (
        id           UUID PRIMARY KEY,
        source_id    UUID NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        target_id    UUID NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        rel_type_key UUID NOT NULL,
        attributes   JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT uq_relationships_edge UNIQUE (source_id, target_id, rel_type_key)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_relationships_source_type ON relationships (source_id, rel_type_key)",
    "CREATE INDEX IF NOT EXISTS ix_relationships_target_type ON relationships (target_id, rel_type_key)",
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id          UUID PRIMARY KEY,
        event_type  TEXT NOT NULL,
        session_id  UUID,
        client_name TEXT,
        project_id  UUID,
        entity_id   UUID,
        payload     JSONB NOT NULL DEFAULT '{}'::jsonb,
        occurred_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_events_time ON events (occurred_at, id)",
    "CREATE INDEX IF NOT EXISTS ix_events_project_time ON events (project_id, occurred_at)",
    "CREATE INDEX IF NOT EXISTS ix_events_entity_time ON events (entity_id, occurred_at)",
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id              UUID PRIMARY KEY,
        client_name     TEXT NOT NULL,
        endpoint_type   TEXT,
        host            TEXT,
        capabilities    JSONB NOT NULL DEFAULT '{}'::jsonb,
        connected_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        disconnected_at TIMESTAMPTZ,
        last_seen_at    TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_sessions_connected_at ON sessions (connected_at)",
];

pub(crate) async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!("Schema verified: {} statements applied", SCHEMA.len());
    Ok(())
}
