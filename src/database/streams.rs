//! Stream repository. Streams are ordered by `sort_order` then
//! `reliability_score` so the gateway (C8) always tries the best candidate
//! first when falling back across multiple upstreams for one channel.

use chrono::Utc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::Stream;

use super::Database;

impl Database {
    pub async fn list_streams_for_channel(
        &self,
        channel_id: Uuid,
    ) -> Result<Vec<Stream>, AppError> {
        let streams = sqlx::query_as::<_, Stream>(
            r#"
            SELECT * FROM streams
            WHERE channel_id = ? AND enabled = 1
            ORDER BY sort_order ASC, reliability_score DESC
            "#,
        )
        .bind(channel_id)
        .fetch_all(self.pool())
        .await?;
        Ok(streams)
    }

    pub async fn get_stream(&self, id: Uuid) -> Result<Option<Stream>, AppError> {
        let stream = sqlx::query_as::<_, Stream>("SELECT * FROM streams WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(stream)
    }

    pub async fn create_stream(&self, mut stream: Stream) -> Result<Stream, AppError> {
        let now = Utc::now();
        stream.created_at = now;
        stream.updated_at = now;
        sqlx::query(
            r#"
            INSERT INTO streams
                (id, channel_id, url, kind, enabled, reliability_score, failure_count,
                 last_failure, encoding_profile, sort_order, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(stream.id)
        .bind(stream.channel_id)
        .bind(&stream.url)
        .bind(stream.kind)
        .bind(stream.enabled)
        .bind(stream.reliability_score)
        .bind(stream.failure_count)
        .bind(stream.last_failure)
        .bind(&stream.encoding_profile)
        .bind(stream.sort_order)
        .bind(stream.created_at)
        .bind(stream.updated_at)
        .execute(self.pool())
        .await?;
        Ok(stream)
    }

    pub async fn delete_stream(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM streams WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("stream", id.to_string()));
        }
        Ok(())
    }

    /// Records a failed playback attempt: bumps `failure_count`, stamps
    /// `last_failure`, and nudges `reliability_score` down (floor 0.0) so
    /// the gateway's ordering self-corrects away from flaky upstreams.
    pub async fn record_stream_failure(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE streams
            SET failure_count = failure_count + 1,
                last_failure = ?,
                reliability_score = MAX(0.0, reliability_score - 0.1),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Records a successful playback attempt: nudges `reliability_score`
    /// back up toward 1.0.
    pub async fn record_stream_success(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE streams
            SET reliability_score = MIN(1.0, reliability_score + 0.05),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
