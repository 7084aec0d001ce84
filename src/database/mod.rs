//! Store façade (C1). Wraps a single SQLite pool behind per-entity
//! repository modules; every write that touches more than one table runs
//! inside a transaction.

use crate::assets::MigrationAssets;
use crate::errors::AppError;
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod channels;
pub mod epg_channels;
pub mod epg_programs;
pub mod epg_sources;
pub mod settings;
pub mod streams;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    /// Serializes the bulk replace-on-refresh writes done by the EPG
    /// ingester so two concurrently-refreshing sources can't interleave
    /// partial states into a reader's view.
    epg_write_lock: Arc<Mutex<()>>,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, AppError> {
        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            Sqlite::create_database(database_url).await?;
        }
        let pool = SqlitePool::connect(database_url).await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;
        Ok(Self {
            pool,
            epg_write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (name, content) in MigrationAssets::get_migrations() {
            let version: i64 = name
                .split('_')
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            let already_applied: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM _migrations WHERE version = ?")
                    .bind(version)
                    .fetch_one(&self.pool)
                    .await?;
            if already_applied > 0 {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            for statement in content.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
                .bind(version)
                .bind(&name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!(migration = %name, "applied database migration");
        }

        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn acquire_epg_write_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.epg_write_lock.lock().await
    }
}
