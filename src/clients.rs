use crate::config::Config;
use crate::error::Error;
use crate::gateway::GatewayClient;
use crate::store::MessageStore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// Creates and returns a new database connection pool.
pub async fn setup_db_pool(config: &Config) -> Result<SqlitePool, Error> {
    let options = SqliteConnectOptions::from_str(&config.database_url)
        .map_err(|e| Error::Configuration(format!("DATABASE_URL is invalid: {}", e)))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Opens the message store, creating the table on first use.
pub async fn setup_store(config: &Config) -> Result<MessageStore, Error> {
    let store = MessageStore::new(setup_db_pool(config).await?);
    store.create_schema().await?;
    Ok(store)
}

pub fn setup_gateway_client(config: &Config) -> Result<GatewayClient, Error> {
    GatewayClient::new(config.gateway())
}
