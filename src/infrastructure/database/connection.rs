//! Database connection pool manager.
//!
//! SQLite with WAL mode for concurrent readers alongside the single
//! writer. Migrations are embedded from `./migrations` and applied at
//! startup; re-running is a no-op.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Create a new connection pool.
    ///
    /// Journal mode WAL, synchronous NORMAL, foreign keys on, 5 second
    /// busy timeout, 1..10 connections.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("invalid database URL")?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // In-memory databases live inside a single connection; pooling
        // more than one would hand out empty databases.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            10
        };

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .idle_timeout(Duration::from_secs(30))
            .max_lifetime(Duration::from_secs(1800))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("failed to create connection pool")?;

        Ok(Self { pool })
    }

    /// Apply pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Pool handle for repository construction.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections; call at shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
