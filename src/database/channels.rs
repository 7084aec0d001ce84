//! Channel repository: the HDHomeRun lineup is built directly from this
//! table (§4.4), so inserts/updates keep `updated_at` current and reads
//! favor sorting by `number` the way a physical tuner's channel list would.

use chrono::Utc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::Channel;

use super::Database;

impl Database {
    pub async fn list_channels(&self, enabled_only: bool) -> Result<Vec<Channel>, AppError> {
        let channels = if enabled_only {
            sqlx::query_as::<_, Channel>(
                "SELECT * FROM channels WHERE enabled = 1 ORDER BY number ASC",
            )
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, Channel>("SELECT * FROM channels ORDER BY number ASC")
                .fetch_all(self.pool())
                .await?
        };
        Ok(channels)
    }

    pub async fn get_channel(&self, id: Uuid) -> Result<Option<Channel>, AppError> {
        let channel = sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(channel)
    }

    /// Looks up a channel by its configured `epg_id` (§8 S6: channels may
    /// be addressed by internal UUID or by `epg_id`).
    pub async fn get_channel_by_epg_id(&self, epg_id: &str) -> Result<Option<Channel>, AppError> {
        let channel = sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE epg_id = ?")
            .bind(epg_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(channel)
    }

    pub async fn get_channel_by_number(&self, number: i64) -> Result<Option<Channel>, AppError> {
        let channel = sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE number = ?")
            .bind(number)
            .fetch_optional(self.pool())
            .await?;
        Ok(channel)
    }

    pub async fn create_channel(&self, mut channel: Channel) -> Result<Channel, AppError> {
        let now = Utc::now();
        channel.created_at = now;
        channel.updated_at = now;
        sqlx::query(
            r#"
            INSERT INTO channels
                (id, number, name, logo, epg_id, enabled, encoding_profile, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(channel.id)
        .bind(channel.number)
        .bind(&channel.name)
        .bind(&channel.logo)
        .bind(&channel.epg_id)
        .bind(channel.enabled)
        .bind(&channel.encoding_profile)
        .bind(channel.created_at)
        .bind(channel.updated_at)
        .execute(self.pool())
        .await?;
        Ok(channel)
    }

    pub async fn update_channel(&self, mut channel: Channel) -> Result<Channel, AppError> {
        channel.updated_at = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE channels
            SET number = ?, name = ?, logo = ?, epg_id = ?, enabled = ?,
                encoding_profile = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(channel.number)
        .bind(&channel.name)
        .bind(&channel.logo)
        .bind(&channel.epg_id)
        .bind(channel.enabled)
        .bind(&channel.encoding_profile)
        .bind(channel.updated_at)
        .bind(channel.id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("channel", channel.id.to_string()));
        }
        Ok(channel)
    }

    pub async fn delete_channel(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("channel", id.to_string()));
        }
        Ok(())
    }

    /// A channel is live (appears in the lineup) only when enabled and at
    /// least one of its streams is enabled (§3 invariant).
    pub async fn channel_has_enabled_stream(&self, channel_id: Uuid) -> Result<bool, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM streams WHERE channel_id = ? AND enabled = 1",
        )
        .bind(channel_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_channel() -> Channel {
        Channel {
            id: Uuid::new_v4(),
            number: 100,
            name: "Test Channel".to_string(),
            logo: None,
            epg_id: Some("test.channel".to_string()),
            enabled: true,
            encoding_profile: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let created = db.create_channel(sample_channel()).await.unwrap();
        let fetched = db.get_channel(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.number, 100);
        assert_eq!(fetched.name, "Test Channel");
    }

    #[tokio::test]
    async fn get_by_epg_id_finds_the_same_row_as_get_by_id() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let created = db.create_channel(sample_channel()).await.unwrap();
        let by_epg_id = db.get_channel_by_epg_id("test.channel").await.unwrap().unwrap();
        assert_eq!(by_epg_id.id, created.id);
    }

    #[tokio::test]
    async fn delete_missing_channel_is_not_found() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let err = db.delete_channel(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
