//! EPG scheduler (C10). Owns the set of scheduled refresh jobs, modeled
//! after the teacher's `ingestor/scheduler.rs` cached-schedule-plus-tick
//! loop: a periodically refreshed in-memory cache of active sources and
//! their parsed `cron::Schedule`s, checked on a short, cheap tick rather
//! than re-querying the store on every beat.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EpgConfig;
use crate::database::Database;
use crate::ingestor::EpgIngester;
use crate::models::EpgSource;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const CACHE_REFRESH_INTERVAL: chrono::Duration = chrono::Duration::minutes(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

/// `parseInterval`'s output (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInterval {
    pub value: i64,
    pub unit: IntervalUnit,
}

/// Parses `"4h"`/`"30m"`/`"2d"`, a legacy bare-seconds number (rounded to
/// the nearest hour, minimum 1h), or the cron expression a previous call
/// to [`interval_to_cron`] produced — the inverse lookup property tested
/// in §8 property 4 requires this function's domain to include its own
/// sibling function's range. Falls back to `default` (itself re-parsed)
/// on anything unrecognized.
pub fn parse_interval(raw: &str, default: &str) -> ParsedInterval {
    parse_interval_str(raw)
        .or_else(|| parse_interval_str(default))
        .unwrap_or(ParsedInterval { value: 4, unit: IntervalUnit::Hours })
}

fn parse_interval_str(raw: &str) -> Option<ParsedInterval> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(secs) = raw.parse::<i64>() {
        let hours = std::cmp::max(1, (secs as f64 / 3600.0).round() as i64);
        return Some(ParsedInterval { value: hours, unit: IntervalUnit::Hours });
    }

    if raw.contains(' ') {
        return parse_cron_fields(raw);
    }

    let (num_part, unit_part) = raw.split_at(raw.len().saturating_sub(1));
    let value: i64 = num_part.parse().ok()?;
    if value <= 0 {
        return None;
    }
    let unit = match unit_part {
        "h" | "H" => IntervalUnit::Hours,
        "m" | "M" => IntervalUnit::Minutes,
        "d" | "D" => IntervalUnit::Days,
        _ => return None,
    };
    Some(ParsedInterval { value, unit })
}

/// Recovers a [`ParsedInterval`] from a 5-field (no-seconds) cron
/// expression produced by [`interval_to_cron`]. Checked in
/// hour-then-minute-then-day order since that's the only field each
/// shape leaves slashed.
fn parse_cron_fields(expr: &str) -> Option<ParsedInterval> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return None;
    }
    let (minute, hour, dom) = (fields[0], fields[1], fields[2]);

    if let Some(value) = slashed_value(hour) {
        return Some(ParsedInterval { value, unit: IntervalUnit::Hours });
    }
    if let Some(value) = slashed_value(minute) {
        return Some(ParsedInterval { value, unit: IntervalUnit::Minutes });
    }
    if let Some(value) = slashed_value(dom) {
        return Some(ParsedInterval { value, unit: IntervalUnit::Days });
    }
    None
}

fn slashed_value(field: &str) -> Option<i64> {
    field.split('/').nth(1)?.parse().ok()
}

/// A stable-per-`source_id` minute in `[0, 60)`, used to stagger refresh
/// times so enabled sources don't all fire on the same tick.
/// `DefaultHasher::new()` uses a fixed key (unlike `RandomState`), so this
/// is the same value across process restarts (§8 property 7).
fn stable_minute(source_id: Uuid) -> u32 {
    let mut hasher = DefaultHasher::new();
    source_id.hash(&mut hasher);
    (hasher.finish() % 60) as u32
}

/// `intervalToCron` (§4.10): builds a 5-field cron expression (no leading
/// seconds field — the caller prepends `"0 "` before handing it to the
/// `cron` crate, which always expects one).
pub fn interval_to_cron(interval: ParsedInterval, source_id: Uuid) -> String {
    let minute = stable_minute(source_id);
    match interval.unit {
        IntervalUnit::Hours => format!("{minute} 0-23/{} * * *", interval.value.max(1)),
        IntervalUnit::Minutes => format!("*/{} * * * *", interval.value.max(1)),
        IntervalUnit::Days => format!("{minute} 0 */{} * *", interval.value.max(1)),
    }
}

/// Parses a source's effective refresh interval into a runnable
/// `cron::Schedule`, substituting `config.refresh_default_interval` for
/// anything unparseable (§9 "config resilience").
fn build_schedule(source: &EpgSource, config: &EpgConfig) -> Schedule {
    let interval = parse_interval(&source.refresh_interval, &config.refresh_default_interval);
    let cron_expr = interval_to_cron(interval, source.id);
    Schedule::from_str(&format!("0 {cron_expr}")).unwrap_or_else(|_| {
        // Should be unreachable since interval_to_cron always produces a
        // syntactically valid 5-field expression; fall back to hourly.
        Schedule::from_str("0 0 * * * *").expect("hourly fallback cron is always valid")
    })
}

#[derive(Clone)]
struct CachedSource {
    source: EpgSource,
    schedule: Schedule,
    last_fired: Option<DateTime<Utc>>,
}

/// Debug-surface view of one scheduled job (`/epg/debug/jobs`,
/// `/epg/debug/diagnose/{id?}`).
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub source_id: Uuid,
    pub source_name: String,
    pub refresh_interval: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Owns the scheduled-jobs registry as a process-wide singleton (§9
/// "global state"): created once at service init via [`SchedulerService::new`]
/// and torn down by cancelling the token passed to [`SchedulerService::start`].
#[derive(Clone)]
pub struct SchedulerService {
    db: Database,
    ingester: Arc<EpgIngester>,
    config: EpgConfig,
    cache: Arc<RwLock<HashMap<Uuid, CachedSource>>>,
}

impl SchedulerService {
    pub fn new(db: Database, ingester: Arc<EpgIngester>, config: EpgConfig) -> Self {
        Self { db, ingester, config, cache: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Loads active sources from the store, (re)building their cached
    /// schedules. Sources removed or disabled since the last load are
    /// dropped from the cache; their in-flight refreshes (if any) still
    /// complete normally.
    async fn refresh_cache(&self) -> Result<(), crate::errors::AppError> {
        let sources = self.db.list_epg_sources(true).await?;
        let mut cache = self.cache.write().await;

        let previous: HashMap<Uuid, Option<DateTime<Utc>>> =
            cache.iter().map(|(id, cached)| (*id, cached.last_fired)).collect();
        cache.clear();

        for source in sources {
            let schedule = build_schedule(&source, &self.config);
            let last_fired = previous.get(&source.id).copied().flatten();
            cache.insert(source.id, CachedSource { source, schedule, last_fired });
        }
        Ok(())
    }

    /// Starts the scheduler's background loop on a spawned task and
    /// returns immediately; the returned handle's cache is shared with
    /// `self`, so `jobs()`/`diagnose()`/`force_refresh()` remain usable
    /// from the caller that retained the original value.
    pub fn start(&self, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.refresh_cache().await {
                tracing::error!(error = %e, "failed to load initial EPG scheduler cache");
            }
            this.trigger_initial_refreshes().await;

            let mut ticker = interval(TICK_INTERVAL);
            let mut last_cache_refresh = Utc::now();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if Utc::now().signed_duration_since(last_cache_refresh) >= CACHE_REFRESH_INTERVAL {
                            if let Err(e) = this.refresh_cache().await {
                                tracing::error!(error = %e, "failed to refresh EPG scheduler cache");
                            }
                            last_cache_refresh = Utc::now();
                        }
                        this.fire_due_jobs().await;
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("EPG scheduler shutting down");
                        break;
                    }
                }
            }
        });

        self.spawn_daily_cleanup(cancel.clone());
    }

    /// Sources that have never successfully refreshed get an immediate
    /// background refresh at startup, rather than waiting for their first
    /// scheduled tick (§4.10 "on init").
    async fn trigger_initial_refreshes(&self) {
        let due: Vec<Uuid> = self
            .cache
            .read()
            .await
            .values()
            .filter(|c| c.source.last_success.is_none())
            .map(|c| c.source.id)
            .collect();

        for source_id in due {
            let ingester = self.ingester.clone();
            tokio::spawn(async move {
                ingester.scheduled_refresh(source_id).await;
            });
        }
    }

    async fn fire_due_jobs(&self) {
        let now = Utc::now();
        let mut to_fire = Vec::new();

        {
            let cache = self.cache.read().await;
            for cached in cache.values() {
                let after = cached.last_fired.unwrap_or(now - chrono::Duration::days(1));
                if let Some(next) = cached.schedule.after(&after).next() {
                    if next <= now {
                        to_fire.push(cached.source.id);
                    }
                }
            }
        }

        if to_fire.is_empty() {
            return;
        }

        let mut cache = self.cache.write().await;
        for source_id in &to_fire {
            if let Some(cached) = cache.get_mut(source_id) {
                cached.last_fired = Some(now);
            }
        }
        drop(cache);

        for source_id in to_fire {
            let ingester = self.ingester.clone();
            // Job handlers must be panic-safe (§4.10): a failing refresh
            // runs in its own task and can never unwind into the
            // scheduler's own loop.
            tokio::spawn(async move {
                ingester.scheduled_refresh(source_id).await;
            });
        }
    }

    /// Global daily cleanup (§4.10): purge programmes that ended more
    /// than `program_retention_days` ago, on `config.cleanup_cron` (a
    /// full 6-field cron string, seconds included).
    fn spawn_daily_cleanup(&self, cancel: CancellationToken) {
        let db = self.db.clone();
        let retention_days = self.config.program_retention_days;
        let cron_expr = self.config.cleanup_cron.clone();

        tokio::spawn(async move {
            let schedule = match Schedule::from_str(&cron_expr) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(cron = %cron_expr, error = %e, "invalid cleanup_cron, daily cleanup disabled");
                    return;
                }
            };

            loop {
                let Some(next) = schedule.upcoming(Utc).next() else { return };
                let sleep_for = (next - Utc::now()).to_std().unwrap_or(Duration::from_secs(60));

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {
                        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
                        match db.purge_programs_ended_before(cutoff).await {
                            Ok(purged) => tracing::info!(purged, "daily EPG cleanup completed"),
                            Err(e) => tracing::error!(error = %e, "daily EPG cleanup failed"),
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("EPG cleanup job shutting down");
                        return;
                    }
                }
            }
        });
    }

    /// Manual refresh (`force_refresh`), propagating errors to the caller.
    pub async fn force_refresh(&self, source_id: Uuid) -> Result<crate::ingestor::RefreshOutcome, crate::errors::AppError> {
        let outcome = self.ingester.refresh(source_id).await?;
        if let Some(cached) = self.cache.write().await.get_mut(&source_id) {
            cached.last_fired = Some(Utc::now());
        }
        Ok(outcome)
    }

    pub async fn jobs(&self) -> Vec<JobInfo> {
        self.cache.read().await.values().map(job_info).collect()
    }

    pub async fn diagnose(&self, source_id: Option<Uuid>) -> Vec<JobInfo> {
        let cache = self.cache.read().await;
        match source_id {
            Some(id) => cache.get(&id).map(job_info).into_iter().collect(),
            None => cache.values().map(job_info).collect(),
        }
    }
}

fn job_info(cached: &CachedSource) -> JobInfo {
    JobInfo {
        source_id: cached.source.id,
        source_name: cached.source.name.clone(),
        refresh_interval: cached.source.refresh_interval.clone(),
        next_run: cached.schedule.after(&Utc::now()).next(),
        last_refresh: cached.source.last_refresh,
        last_success: cached.source.last_success,
        last_error: cached.source.last_error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_interval_handles_suffixed_forms() {
        assert_eq!(parse_interval("4h", "4h"), ParsedInterval { value: 4, unit: IntervalUnit::Hours });
        assert_eq!(parse_interval("30m", "4h"), ParsedInterval { value: 30, unit: IntervalUnit::Minutes });
        assert_eq!(parse_interval("2d", "4h"), ParsedInterval { value: 2, unit: IntervalUnit::Days });
    }

    #[test]
    fn parse_interval_rounds_legacy_seconds_to_nearest_hour() {
        assert_eq!(parse_interval("14400", "4h"), ParsedInterval { value: 4, unit: IntervalUnit::Hours });
        assert_eq!(parse_interval("1", "4h"), ParsedInterval { value: 1, unit: IntervalUnit::Hours });
    }

    #[test]
    fn parse_interval_falls_back_to_default_on_garbage() {
        assert_eq!(parse_interval("not-an-interval", "4h"), ParsedInterval { value: 4, unit: IntervalUnit::Hours });
    }

    #[test]
    fn stable_minute_is_deterministic_across_calls() {
        let id = Uuid::new_v4();
        assert_eq!(stable_minute(id), stable_minute(id));
    }

    #[test]
    fn interval_to_cron_round_trips_through_parse_interval() {
        let id = Uuid::new_v4();
        for x in ["4h", "30m", "2d", "1h", "45m", "7d"] {
            let parsed = parse_interval(x, "4h");
            let cron_expr = interval_to_cron(parsed, id);
            let round_tripped = parse_interval(&cron_expr, "4h");
            assert_eq!(round_tripped.value, parsed.value, "roundtrip failed for {x} -> {cron_expr}");
            assert_eq!(round_tripped.unit, parsed.unit, "roundtrip failed for {x} -> {cron_expr}");
        }
    }

    #[test]
    fn build_schedule_accepts_the_generated_cron_expression() {
        let source = EpgSource {
            id: Uuid::new_v4(),
            name: "x".to_string(),
            url: "http://example.invalid/epg.xml".to_string(),
            refresh_interval: "4h".to_string(),
            enabled: true,
            last_refresh: None,
            last_success: None,
            last_error: None,
            category: None,
            secondary_genres: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let config = crate::config::Config::default().epg;
        let schedule = build_schedule(&source, &config);
        assert!(schedule.upcoming(Utc).next().is_some());
    }
}
