//! SQLite persistence: pool construction, schema bootstrap, repositories.

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// Open the database, creating the file and schema on first run.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    // An in-memory database exists per connection, so its pool must stay at
    // a single connection or the schema vanishes between queries.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    bootstrap_schema(&pool).await?;
    info!(database_url, "database ready");
    Ok(pool)
}

async fn bootstrap_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            exchange TEXT,
            api_key TEXT,
            api_secret TEXT,
            passphrase TEXT,
            balance_allocated_to_bots REAL NOT NULL DEFAULT 0,
            user_current_balance REAL NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS subscriptions (
            user_id TEXT NOT NULL,
            bot_name TEXT NOT NULL,
            symbol TEXT NOT NULL,
            bot_initial_balance REAL NOT NULL,
            bot_current_balance REAL NOT NULL,
            PRIMARY KEY (user_id, bot_name)
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_subscriptions_symbol ON subscriptions(symbol)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            order_id TEXT,
            symbol TEXT NOT NULL,
            direction TEXT NOT NULL,
            entry_time TEXT NOT NULL,
            entry_price REAL NOT NULL,
            stop_loss REAL,
            take_profit REAL,
            leverage REAL NOT NULL,
            initial_margin REAL NOT NULL,
            status TEXT NOT NULL,
            pnl REAL,
            exit_time TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_trades_open \
         ON trades(user_id, symbol, direction, status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
