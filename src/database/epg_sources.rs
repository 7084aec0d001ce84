//! EPG source repository. This is the admin-managed list of XMLTV feeds
//! the scheduler (C10) and ingester (C9) act on.

use chrono::Utc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::EpgSource;

use super::Database;

impl Database {
    pub async fn list_epg_sources(&self, enabled_only: bool) -> Result<Vec<EpgSource>, AppError> {
        let sources = if enabled_only {
            sqlx::query_as::<_, EpgSource>(
                "SELECT * FROM epg_sources WHERE enabled = 1 ORDER BY name ASC",
            )
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, EpgSource>("SELECT * FROM epg_sources ORDER BY name ASC")
                .fetch_all(self.pool())
                .await?
        };
        Ok(sources)
    }

    pub async fn get_epg_source(&self, id: Uuid) -> Result<Option<EpgSource>, AppError> {
        let source = sqlx::query_as::<_, EpgSource>("SELECT * FROM epg_sources WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(source)
    }

    pub async fn create_epg_source(&self, mut source: EpgSource) -> Result<EpgSource, AppError> {
        let now = Utc::now();
        source.created_at = now;
        source.updated_at = now;
        sqlx::query(
            r#"
            INSERT INTO epg_sources
                (id, name, url, refresh_interval, enabled, last_refresh, last_success,
                 last_error, category, secondary_genres, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(&source.url)
        .bind(&source.refresh_interval)
        .bind(source.enabled)
        .bind(source.last_refresh)
        .bind(source.last_success)
        .bind(&source.last_error)
        .bind(&source.category)
        .bind(&source.secondary_genres)
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(self.pool())
        .await?;
        Ok(source)
    }

    pub async fn update_epg_source(&self, mut source: EpgSource) -> Result<EpgSource, AppError> {
        source.updated_at = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE epg_sources
            SET name = ?, url = ?, refresh_interval = ?, enabled = ?, category = ?,
                secondary_genres = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&source.name)
        .bind(&source.url)
        .bind(&source.refresh_interval)
        .bind(source.enabled)
        .bind(&source.category)
        .bind(&source.secondary_genres)
        .bind(source.updated_at)
        .bind(source.id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("epg_source", source.id.to_string()));
        }
        Ok(source)
    }

    pub async fn delete_epg_source(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM epg_sources WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("epg_source", id.to_string()));
        }
        Ok(())
    }

    /// Called at the start of an ingest attempt, scheduled or manual.
    pub async fn mark_epg_source_refresh_started(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE epg_sources SET last_refresh = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn mark_epg_source_success(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE epg_sources SET last_success = ?, last_error = NULL WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_epg_source_error(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE epg_sources SET last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// The configured `category`/`secondary_genres` for the source that
    /// owns `channel_key`, if any, joined through `epg_channels`. XMLTV
    /// generation (C11) uses this to override a programme's own category
    /// fields at read time (§4.11).
    pub async fn category_override_for_channel_key(
        &self,
        channel_key: &str,
    ) -> Result<Option<EpgSource>, AppError> {
        let source = sqlx::query_as::<_, EpgSource>(
            r#"
            SELECT s.* FROM epg_sources s
            JOIN epg_channels c ON c.source_id = s.id
            WHERE c.epg_id = ?
            LIMIT 1
            "#,
        )
        .bind(channel_key)
        .fetch_optional(self.pool())
        .await?;
        Ok(source)
    }
}
