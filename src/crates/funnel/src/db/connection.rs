//! Database connection management
//!
//! Provides database connection pooling, migrations and health checks.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Type alias for the database connection pool
pub type DatabasePool = SqlitePool;

/// Database connection wrapper
#[derive(Clone, Debug)]
pub struct DatabaseConnection {
    pool: Arc<DatabasePool>,
}

impl DatabaseConnection {
    /// Create a new database connection from a connection string
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:funnel.db")
    ///
    /// # Returns
    /// A new DatabaseConnection or an sqlx error
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::with_max_connections(database_url, 5).await
    }

    /// Create a new database connection with custom pool size
    ///
    /// The database file is created when missing and opened in WAL mode so
    /// the scheduler and workers can read while a claim is being written.
    pub async fn with_max_connections(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        debug!(url = %database_url, max_connections, "Connecting to database");

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!(url = %database_url, "Database connection established");

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Run the embedded migrations
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await
    }

    /// Perform a health check by running a simple query
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(self.pool.as_ref()).await?;

        Ok(())
    }

    /// Close the connection pool gracefully
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_connection() -> (tempfile::TempDir, DatabaseConnection) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("conn.db").display());
        let conn = DatabaseConnection::new(&url).await.unwrap();
        (dir, conn)
    }

    #[tokio::test]
    async fn test_create_connection_creates_file() {
        let (dir, conn) = temp_connection().await;
        assert!(conn.pool().acquire().await.is_ok());
        assert!(dir.path().join("conn.db").exists());
    }

    #[tokio::test]
    async fn test_health_check_success() {
        let (_dir, conn) = temp_connection().await;
        assert!(conn.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let (_dir, conn) = temp_connection().await;
        conn.run_migrations().await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
             ('campaigns', 'executions', 'delivery_records', 'recipient_failures', 'block_list', 'recent_activity')",
        )
        .fetch_one(conn.pool())
        .await
        .unwrap();
        assert_eq!(count, 6);
    }
}
