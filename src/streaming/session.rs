//! Session manager (C5). Tracks live viewer sessions against a global cap
//! and a per-channel cap, and sweeps sessions that have gone idle past
//! the configured timeout, modeled after the teacher's session tracker
//! (`Arc<RwLock<HashMap<Uuid, _>>>` plus `Instant`-based activity stamps).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::AppError;

struct SessionEntry {
    channel_id: Uuid,
    started_at: Instant,
    last_byte_at: Instant,
    cancel: CancellationToken,
}

/// A handle returned to the gateway on successful admission. Dropping it
/// does not release the slot; the gateway calls `release` explicitly when
/// the response body finishes (or the idle sweep does it instead).
#[derive(Debug, Clone, Copy)]
pub struct SessionHandle {
    pub id: Uuid,
    pub channel_id: Uuid,
}

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
    global_limit: usize,
    per_channel_limit: usize,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(global_limit: u32, per_channel_limit: u32, idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            global_limit: global_limit as usize,
            per_channel_limit: per_channel_limit as usize,
            idle_timeout,
        }
    }

    /// Admits a new session for `channel_id` if neither cap is exceeded.
    /// Returns the session's cancellation token alongside its handle so
    /// the gateway can tear down the encoder when the sweep (or an
    /// explicit release) fires it.
    pub async fn admit(&self, channel_id: Uuid) -> Result<(SessionHandle, CancellationToken), AppError> {
        let mut sessions = self.sessions.write().await;

        if sessions.len() >= self.global_limit {
            return Err(AppError::capacity(format!(
                "global session limit reached ({}/{})",
                sessions.len(),
                self.global_limit
            )));
        }

        let per_channel = sessions
            .values()
            .filter(|entry| entry.channel_id == channel_id)
            .count();
        if per_channel >= self.per_channel_limit {
            return Err(AppError::capacity(format!(
                "per-channel session limit reached for {channel_id} ({per_channel}/{})",
                self.per_channel_limit
            )));
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let now = Instant::now();
        sessions.insert(
            id,
            SessionEntry { channel_id, started_at: now, last_byte_at: now, cancel: cancel.clone() },
        );
        Ok((SessionHandle { id, channel_id }, cancel))
    }

    /// Called by the gateway's byte-copy loop on every chunk forwarded to
    /// the client, so the idle sweep doesn't reap an active viewer.
    pub async fn mark_byte(&self, id: Uuid) {
        if let Some(entry) = self.sessions.write().await.get_mut(&id) {
            entry.last_byte_at = Instant::now();
        }
    }

    pub async fn release(&self, id: Uuid) {
        if let Some(entry) = self.sessions.write().await.remove(&id) {
            entry.cancel.cancel();
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_count_for_channel(&self, channel_id: Uuid) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.channel_id == channel_id)
            .count()
    }

    /// Cancels and removes every session whose `last_byte_at` is older
    /// than the configured idle timeout. Intended to run on a fixed
    /// interval from the caller (see `spawn_idle_sweep`).
    pub async fn sweep_idle(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let expired: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_byte_at) > self.idle_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(entry) = sessions.remove(id) {
                entry.cancel.cancel();
            }
        }
        expired
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    #[cfg(test)]
    pub async fn session_age(&self, id: Uuid) -> Option<Duration> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.started_at.elapsed())
    }
}

/// Spawns the background task that periodically reaps idle sessions,
/// mirroring the teacher's scheduler tick loop but on a much shorter
/// period (15s default, per §4.5).
pub fn spawn_idle_sweep(manager: SessionManager, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = manager.sweep_idle().await;
            for id in reaped {
                tracing::info!(session = %id, "reaped idle stream session");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_global_limit_then_rejects() {
        let manager = SessionManager::new(2, 10, Duration::from_secs(30));
        let channel = Uuid::new_v4();
        assert!(manager.admit(channel).await.is_ok());
        assert!(manager.admit(channel).await.is_ok());
        let err = manager.admit(channel).await.unwrap_err();
        assert_eq!(err.kind(), "capacity");
    }

    #[tokio::test]
    async fn per_channel_limit_is_independent_of_other_channels() {
        let manager = SessionManager::new(10, 1, Duration::from_secs(30));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(manager.admit(a).await.is_ok());
        assert!(manager.admit(a).await.is_err());
        assert!(manager.admit(b).await.is_ok());
    }

    #[tokio::test]
    async fn release_frees_the_slot() {
        let manager = SessionManager::new(1, 1, Duration::from_secs(30));
        let channel = Uuid::new_v4();
        let (handle, _cancel) = manager.admit(channel).await.unwrap();
        manager.release(handle.id).await;
        assert_eq!(manager.active_count().await, 0);
        assert!(manager.admit(channel).await.is_ok());
    }

    #[tokio::test]
    async fn sweep_idle_reaps_sessions_past_timeout() {
        let manager = SessionManager::new(10, 10, Duration::from_millis(10));
        let (handle, _cancel) = manager.admit(Uuid::new_v4()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let reaped = manager.sweep_idle().await;
        assert_eq!(reaped, vec![handle.id]);
        assert_eq!(manager.active_count().await, 0);
    }
}
