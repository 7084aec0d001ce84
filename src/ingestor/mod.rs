//! EPG ingester (C9). `refresh(source_id)` is the unit of work: download,
//! validate, parse, then write channels and programmes, tolerating
//! per-row failures the way the teacher's `ingestor/mod.rs` tolerates
//! per-channel M3U parse failures, generalized from playlists to XMLTV
//! feeds.

pub mod download;
pub mod scheduler;
pub mod xmltv_parse;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::EpgConfig;
use crate::database::Database;
use crate::epg::EpgCaches;
use crate::errors::AppError;
use crate::models::EpgSource;

/// Outcome of a single source refresh, surfaced to manual callers and
/// logged for scheduled ones.
#[derive(Debug, Clone, Copy)]
pub struct RefreshOutcome {
    pub channels_written: usize,
    pub programs_written: usize,
}

/// Per-source refresh locks, so a second refresh for a source already
/// refreshing waits rather than interleaving writes (§5 "Per-source EPG
/// refresh is serialized").
#[derive(Clone)]
pub struct EpgIngester {
    db: Database,
    http: reqwest::Client,
    config: EpgConfig,
    caches: EpgCaches,
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl EpgIngester {
    pub fn new(db: Database, config: EpgConfig, caches: EpgCaches) -> Result<Self, AppError> {
        let http = download::build_client(&config)?;
        Ok(Self { db, http, config, caches, locks: Arc::new(Mutex::new(HashMap::new())) })
    }

    async fn source_lock(&self, source_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(source_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Manual refresh (`force_refresh`): propagates errors to the caller.
    pub async fn refresh(&self, source_id: Uuid) -> Result<RefreshOutcome, AppError> {
        let lock = self.source_lock(source_id).await;
        let _guard = lock.lock().await;
        self.refresh_locked(source_id).await
    }

    /// Scheduled refresh: logs and swallows errors so one broken source
    /// never crashes the scheduler (§4.9 "Manual vs scheduled refresh").
    pub async fn scheduled_refresh(&self, source_id: Uuid) {
        match self.refresh(source_id).await {
            Ok(outcome) => tracing::info!(
                %source_id,
                channels = outcome.channels_written,
                programs = outcome.programs_written,
                "scheduled EPG refresh completed"
            ),
            Err(e) => tracing::warn!(%source_id, error = %e, "scheduled EPG refresh failed"),
        }
    }

    async fn refresh_locked(&self, source_id: Uuid) -> Result<RefreshOutcome, AppError> {
        let source = self
            .db
            .get_epg_source(source_id)
            .await?
            .ok_or_else(|| AppError::not_found("epg_source", source_id.to_string()))?;

        if !source.enabled {
            return Ok(RefreshOutcome { channels_written: 0, programs_written: 0 });
        }

        self.db.mark_epg_source_refresh_started(source_id).await?;

        // The write lock protects readers from ever observing a
        // half-replaced table while two *different* sources refresh
        // concurrently; `source_lock` above already prevents the same
        // source from refreshing twice at once.
        let write_lock = self.db.acquire_epg_write_lock().await;
        let result = self.try_refresh(&source).await;
        drop(write_lock);

        match &result {
            Ok(_) => {
                self.db.mark_epg_source_success(source_id).await?;
                self.caches.invalidate_all().await;
            }
            Err(e) => {
                self.db.mark_epg_source_error(source_id, &e.to_string()).await?;
            }
        }
        result
    }

    async fn try_refresh(&self, source: &EpgSource) -> Result<RefreshOutcome, AppError> {
        let body = download::download(&self.http, &source.url, &self.config).await?;
        let text = download::validate_xmltv(&body)?;
        let (mut channels, programs) = xmltv_parse::parse(&text)?;

        for channel in &mut channels {
            channel.source_id = source.id;
        }

        let mut tx = self.db.pool().begin().await.map_err(AppError::from)?;
        self.db.replace_epg_channels(&mut tx, source.id, &channels).await?;
        tx.commit().await.map_err(AppError::from)?;

        let channel_keys: Vec<String> = channels.iter().map(|c| c.epg_id.clone()).collect();
        let outcome = self.db.write_programs_tolerant(&channel_keys, &programs).await?;

        // Verification (§4.9 step 8): the tolerant writer already aborts
        // (rolling back the whole transaction) when too few rows
        // succeeded, so reaching here with `parsed == 0` or `succeeded >
        // 0` already satisfies the success condition.
        Ok(RefreshOutcome { channels_written: channels.len(), programs_written: outcome.succeeded })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn epg_config() -> EpgConfig {
        crate::config::Config::default().epg
    }

    fn source(url: &str, enabled: bool) -> EpgSource {
        EpgSource {
            id: Uuid::new_v4(),
            name: "Test Source".to_string(),
            url: url.to_string(),
            refresh_interval: "4h".to_string(),
            enabled,
            last_refresh: None,
            last_success: None,
            last_error: None,
            category: None,
            secondary_genres: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn disabled_source_is_a_no_op() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let src = db.create_epg_source(source("http://example.invalid/epg.xml", false)).await.unwrap();

        let ingester = EpgIngester::new(db, epg_config(), EpgCaches::new()).unwrap();
        let outcome = ingester.refresh(src.id).await.unwrap();
        assert_eq!(outcome.channels_written, 0);
        assert_eq!(outcome.programs_written, 0);
    }

    #[tokio::test]
    async fn refresh_of_unknown_source_is_not_found() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let ingester = EpgIngester::new(db, epg_config(), EpgCaches::new()).unwrap();
        let err = ingester.refresh(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
