//! devfleet Database Module
//! SQLite adapter with connection pooling

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use thiserror::Error;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Bumped whenever the table layout below changes
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to create database pool: {0}")]
    PoolError(#[from] r2d2::Error),
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("Unsupported schema version {found} (expected {expected})")]
    SchemaVersion { found: i64, expected: i64 },
}

#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self, DatabaseError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA busy_timeout = 5000;"));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)?;

        let db = Self { pool };
        db.init_schema(true)?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        // Every pooled connection to :memory: is a separate database.
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;
        let db = Self { pool };
        db.init_schema(false)?;
        Ok(db)
    }

    fn init_schema(&self, wal: bool) -> Result<(), DatabaseError> {
        let conn = self.pool.get()?;

        if wal {
            // PRAGMA journal_mode returns the resulting mode as a row
            let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        }

        let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if found > SCHEMA_VERSION {
            return Err(DatabaseError::SchemaVersion {
                found,
                expected: SCHEMA_VERSION,
            });
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS devices (
                uuid TEXT PRIMARY KEY NOT NULL,
                display_name TEXT NOT NULL,
                timezone TEXT NOT NULL,
                status TEXT NOT NULL,
                current_version TEXT NOT NULL,
                last_seen TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS updates (
                version TEXT PRIMARY KEY NOT NULL,
                major INTEGER NOT NULL,
                minor INTEGER NOT NULL,
                patch INTEGER NOT NULL,
                description TEXT NOT NULL,
                created_at TEXT NOT NULL,
                requires_system_packages INTEGER NOT NULL,
                system_packages TEXT NOT NULL,
                policy TEXT NOT NULL,
                package_checksum TEXT NOT NULL,
                package_size INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_updates_precedence
                ON updates (major DESC, minor DESC, patch DESC);",
        )?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;

        Ok(())
    }

    pub fn get_connection(&self) -> Result<DbConnection, DatabaseError> {
        Ok(self.pool.get()?)
    }
}
