use crate::config::DatabaseConfig;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite};
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod outputs;
pub mod subscriptions;

/// Embedded schema migrations, applied in order and recorded in a ledger
/// table so re-runs are no-ops.
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema.sql",
    r#"
    CREATE TABLE IF NOT EXISTS subscriptions (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        user_agent TEXT NOT NULL DEFAULT 'Mozilla/5.0',
        headers TEXT NOT NULL DEFAULT '{}',
        auto_update_minutes INTEGER NOT NULL DEFAULT 0,
        is_enabled BOOLEAN NOT NULL DEFAULT 1,
        last_updated TEXT,
        last_update_status TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS channels (
        id TEXT PRIMARY KEY,
        subscription_id TEXT NOT NULL,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        group_title TEXT,
        logo TEXT,
        tvg_id TEXT,
        is_enabled BOOLEAN NOT NULL DEFAULT 1,
        check_status BOOLEAN,
        check_date TEXT,
        check_image TEXT,
        check_error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_channels_subscription_id
        ON channels(subscription_id);

    CREATE TABLE IF NOT EXISTS output_sources (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        subscription_ids TEXT NOT NULL DEFAULT '[]',
        filter_regex TEXT NOT NULL DEFAULT '.*',
        keywords TEXT NOT NULL DEFAULT '[]',
        epg_url TEXT,
        include_source_suffix BOOLEAN NOT NULL DEFAULT 1,
        auto_update_minutes INTEGER NOT NULL DEFAULT 0,
        auto_visual_check BOOLEAN NOT NULL DEFAULT 0,
        is_enabled BOOLEAN NOT NULL DEFAULT 1,
        last_updated TEXT,
        last_update_status TEXT,
        last_request_time TEXT,
        created_at TEXT NOT NULL
    );
    "#,
)];

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    channel_replace_lock: Arc<Mutex<()>>,
}

impl Database {
    pub fn pool(&self) -> Pool<Sqlite> {
        self.pool.clone()
    }

    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        // Create database if it doesn't exist (for SQLite)
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(10))
            .connect(&config.url)
            .await?;

        Ok(Self {
            pool,
            channel_replace_lock: Arc::new(Mutex::new(())),
        })
    }

    /// In-memory database for tests. A single connection keeps every query
    /// on the same SQLite memory instance.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self {
            pool,
            channel_replace_lock: Arc::new(Mutex::new(())),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _schema_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT NOT NULL,
                installed_on TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                success BOOLEAN NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (name, content) in MIGRATIONS {
            let version: i64 = name
                .split('_')
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            let existing = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM _schema_migrations WHERE version = ? AND success = true",
            )
            .bind(version)
            .fetch_one(&self.pool)
            .await?;

            if existing > 0 {
                continue;
            }

            let mut transaction = self.pool.begin().await?;
            match sqlx::query(content).execute(&mut *transaction).await {
                Ok(_) => {
                    sqlx::query(
                        "INSERT INTO _schema_migrations (version, description, success)
                         VALUES (?, ?, true)",
                    )
                    .bind(version)
                    .bind(name)
                    .execute(&mut *transaction)
                    .await?;
                    transaction.commit().await?;
                    tracing::info!("Applied migration: {}", name);
                }
                Err(e) => {
                    transaction.rollback().await?;
                    return Err(anyhow::anyhow!("Migration {} failed: {}", name, e));
                }
            }
        }

        Ok(())
    }

    /// Serializes delete-old/insert-new channel replacement across callers.
    pub async fn acquire_channel_replace_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.channel_replace_lock.lock().await
    }
}

/// Parse datetime from RFC3339 or the bare SQLite format.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc());
    }
    Err(anyhow::anyhow!("Failed to parse datetime: {}", s))
}

pub(crate) fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_datetime(&v)).transpose()
}
