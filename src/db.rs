use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::config::Config;

/// Open a pool against the configured SQLite database.
///
/// The database must already exist: this service reads an application's
/// schema and data, it does not provision storage. A missing file surfaces
/// as an upstream error rather than a silently created empty database.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.database.path;

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(false)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    Ok(pool)
}
