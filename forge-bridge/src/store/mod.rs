//! Persistence layer.
//!
//! All database reads and writes go through the repository types in this
//! module — nothing outside `store/` writes SQL. Repositories borrow a
//! `PgConnection`, so they compose inside one transaction:
//!
//! ```rust,ignore
//! let mut tx = store.begin().await?;
//! ProjectRepo::new(&mut tx).save(&project).await?;
//! let event = EventRepo::new(&mut tx).append(new_event).await?;
//! tx.commit().await?;
//! ```
//!
//! Repositories translate between persisted rows and core entities; they
//! never broadcast — that is the router's job.

mod entity;
mod event;
mod location;
mod project;
mod registry;
mod relationship;
mod rows;
mod schema;
mod session;

pub use entity::EntityRepo;
pub use event::{EventFilter, EventRepo, NewEvent};
pub use location::LocationRepo;
pub use project::ProjectRepo;
pub use registry::RegistryRepo;
pub use relationship::RelationshipRepo;
pub use rows::{EventRecord, SessionRecord};
pub use session::{ClientSessionRepo, NewSession};

use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Handle to the relational store: a connection pool plus schema bootstrap
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect with retry and exponential backoff
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut attempt = 0u32;
        let base_delay = Duration::from_secs(config.retry_delay_secs);

        loop {
            match Self::try_connect(config).await {
                Ok(pool) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Database connection established after {} attempt(s)",
                            attempt + 1
                        );
                    } else {
                        tracing::info!(
                            "Database connection pool created: max={}, min={}",
                            config.max_connections,
                            config.min_connections
                        );
                    }
                    return Ok(Self { pool });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > config.max_retries {
                        tracing::error!(
                            "Failed to connect to database after {} attempts: {}",
                            config.max_retries + 1,
                            e
                        );
                        return Err(e);
                    }
                    let delay = base_delay * 2u32.pow(attempt.saturating_sub(1));
                    tracing::warn!(
                        "Database connection attempt {} failed: {}. Retrying in {:?}...",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_connect(config: &DatabaseConfig) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| {
                Error::internal(format!(
                    "Failed to connect to database at '{}': {}",
                    sanitize_connection_url(&config.url),
                    e
                ))
            })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction; commit-on-success is the caller's responsibility
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Borrow one connection for read-only work
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>> {
        Ok(self.pool.acquire().await?)
    }

    /// Create the eight tables and their indexes, idempotently
    pub async fn ensure_schema(&self) -> Result<()> {
        schema::ensure_schema(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Whether an error is a unique-constraint violation on the named constraint
pub fn is_unique_violation(err: &Error, constraint: &str) -> bool {
    if let Error::Database(sqlx::Error::Database(db)) = err {
        return db.code().as_deref() == Some("23505")
            && db.constraint() == Some(constraint);
    }
    false
}

/// Whether an error is a foreign-key violation (a referenced row is gone)
pub fn is_foreign_key_violation(err: &Error) -> bool {
    if let Error::Database(sqlx::Error::Database(db)) = err {
        return db.code().as_deref() == Some("23503");
    }
    false
}

/// Strip the password from a connection URL for safe logging
fn sanitize_connection_url(url: &str) -> String {
    if let (Some(scheme_end), Some(at_pos)) = (url.find("://"), url.find('@')) {
        let auth = &url[scheme_end + 3..at_pos];
        if let Some(colon) = auth.find(':') {
            let username = &auth[..colon];
            return format!("{}{}:***{}", &url[..scheme_end + 3], username, &url[at_pos..]);
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_connection_url() {
        assert_eq!(
            sanitize_connection_url("postgres://forge:secret@db:5432/forge_bridge"),
            "postgres://forge:***@db:5432/forge_bridge"
        );
        assert_eq!(
            sanitize_connection_url("postgres://db:5432/forge_bridge"),
            "postgres://db:5432/forge_bridge"
        );
    }
}
