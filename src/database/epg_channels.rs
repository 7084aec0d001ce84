//! EPG channel repository. Each source's full channel list is replaced
//! wholesale on every successful refresh (§4.9), never merged field by
//! field, so stale entries from a renamed/removed upstream channel can't
//! linger.

use chrono::Utc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::EpgChannel;

use super::Database;

impl Database {
    pub async fn list_epg_channels(&self, source_id: Uuid) -> Result<Vec<EpgChannel>, AppError> {
        let channels = sqlx::query_as::<_, EpgChannel>(
            "SELECT * FROM epg_channels WHERE source_id = ? ORDER BY display_name ASC",
        )
        .bind(source_id)
        .fetch_all(self.pool())
        .await?;
        Ok(channels)
    }

    pub async fn find_epg_channel(&self, epg_id: &str) -> Result<Option<EpgChannel>, AppError> {
        let channel = sqlx::query_as::<_, EpgChannel>(
            "SELECT * FROM epg_channels WHERE epg_id = ? LIMIT 1",
        )
        .bind(epg_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(channel)
    }

    /// Deletes every channel previously associated with `source_id` and
    /// inserts the freshly-parsed set, inside the caller's transaction.
    pub async fn replace_epg_channels(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        source_id: Uuid,
        channels: &[EpgChannel],
    ) -> Result<(), AppError> {
        sqlx::query("DELETE FROM epg_channels WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut **tx)
            .await?;

        let now = Utc::now();
        for channel in channels {
            sqlx::query(
                r#"
                INSERT INTO epg_channels (source_id, epg_id, display_name, icon_url, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(source_id)
            .bind(&channel.epg_id)
            .bind(&channel.display_name)
            .bind(&channel.icon_url)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}
