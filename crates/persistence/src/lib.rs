//! Persistence layer for the round signal engine
//!
//! Provides SQLite storage for observed game rounds and emitted signals.

pub mod repository;
pub mod schema;

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file at `path`
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db = Self::connect(&format!("sqlite:{}?mode=rwc", path.display()), 5).await?;
        // WAL lets the HTTP readers run while the ingest path writes
        db.pragma("journal_mode=WAL").await?;
        db.pragma("synchronous=NORMAL").await?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub async fn in_memory() -> DbResult<Self> {
        // A single connection: every new in-memory connection is a fresh empty db
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(url: &str, max_connections: u32) -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        let applied = db.run_migrations().await?;
        if !applied.is_empty() {
            info!(migrations = ?applied, "Schema migrated");
        }
        Ok(db)
    }

    /// Create tables, then apply every migration not yet recorded in
    /// `schema_migrations`. Returns the names applied by this call.
    async fn run_migrations(&self) -> DbResult<Vec<&'static str>> {
        for sql in schema::table_statements() {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
        }
        sqlx::query(schema::CREATE_MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Migration(format!("schema_migrations: {e}")))?;

        let recorded: Vec<(String,)> = sqlx::query_as("SELECT name FROM schema_migrations")
            .fetch_all(&self.pool)
            .await?;

        let mut applied = Vec::new();
        for migration in schema::MIGRATIONS {
            if recorded.iter().any(|(name,)| name == migration.name) {
                continue;
            }
            match sqlx::query(migration.sql).execute(&self.pool).await {
                Ok(_) => debug!(migration = migration.name, "Migration applied"),
                // Databases created before migrations were recorded already have the column
                Err(e) if e.to_string().contains("duplicate column name") => {
                    debug!(migration = migration.name, "Column already present, recording only")
                }
                Err(e) => {
                    return Err(DbError::Migration(format!("{}: {e}", migration.name)));
                }
            }
            sqlx::query("INSERT INTO schema_migrations (name) VALUES (?)")
                .bind(migration.name)
                .execute(&self.pool)
                .await?;
            applied.push(migration.name);
        }

        Ok(applied)
    }

    async fn pragma(&self, setting: &str) -> DbResult<()> {
        sqlx::query(&format!("PRAGMA {setting}"))
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Connection(format!("PRAGMA {setting} failed: {e}")))?;
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Clone the pool for use in spawned tasks
    pub fn pool_clone(&self) -> SqlitePool {
        self.pool.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_runs_migrations() {
        let db = Database::in_memory().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('game_rounds', 'signals') ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();

        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        assert_eq!(names, vec!["game_rounds", "signals"]);
    }

    #[tokio::test]
    async fn test_migrations_recorded_once() {
        let db = Database::in_memory().await.unwrap();
        let recorded: Vec<(String,)> = sqlx::query_as("SELECT name FROM schema_migrations")
            .fetch_all(db.pool())
            .await
            .unwrap();
        assert_eq!(recorded, vec![("signals_closed_at".to_string(),)]);

        // Already recorded, so nothing runs again
        assert!(db.run_migrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_database_with_column_is_recorded() {
        let db = Database::in_memory().await.unwrap();
        // A database migrated before names were recorded
        sqlx::query("DELETE FROM schema_migrations")
            .execute(db.pool())
            .await
            .unwrap();

        let applied = db.run_migrations().await.unwrap();
        assert_eq!(applied, vec!["signals_closed_at"]);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
