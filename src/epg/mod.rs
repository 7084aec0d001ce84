//! EPG query/synthesis (C11). Resolves `now`/`next`/range lookups against
//! the store (through the TTL cache, C2), and renders XMLTV, following
//! the teacher's `proxy/epg_generator.rs` hand-built-string approach
//! (`push_str(&format!(...))` plus a small `escape_xml` helper) rather
//! than a generic XML writer, since the document shape here is fixed and
//! small.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::EpgConfig;
use crate::database::Database;
use crate::errors::AppError;
use crate::identity;
use crate::models::{Channel, EpgProgram};

/// The three cache tiers behind C11's lookups. Kept as a named bundle
/// (rather than a generic `Cache<String, String>`) so the ingester can
/// invalidate all of them on a successful refresh without needing a
/// `String`-keyed glob (§4.9 step 9's "invalidate all cache keys under
/// `epg:*`").
#[derive(Clone)]
pub struct EpgCaches {
    current: Cache<String, EpgProgram>,
    next: Cache<String, Option<EpgProgram>>,
    range: Cache<String, HashMap<Uuid, Vec<EpgProgram>>>,
}

impl EpgCaches {
    pub fn new() -> Self {
        Self { current: Cache::new(), next: Cache::new(), range: Cache::new() }
    }

    pub async fn invalidate_all(&self) {
        self.current.clear().await;
        self.next.clear().await;
        self.range.clear().await;
    }
}

impl Default for EpgCaches {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct EpgQuery {
    db: Database,
    caches: EpgCaches,
    config: EpgConfig,
}

/// An Android-identifying client gets a trimmed guide window (§6), since
/// several Android EPG consumers choke on large XMLTV documents.
pub fn is_android_user_agent(user_agent: Option<&str>) -> bool {
    user_agent.map(|ua| ua.to_lowercase().contains("android")).unwrap_or(false)
}

fn display_timezone(config: &EpgConfig) -> chrono_tz::Tz {
    config
        .display_timezone
        .as_deref()
        .and_then(|z| z.parse().ok())
        .unwrap_or(chrono_tz::UTC)
}

impl EpgQuery {
    pub fn new(db: Database, caches: EpgCaches, config: EpgConfig) -> Self {
        Self { db, caches, config }
    }

    /// `getCurrent` (§4.11): the program airing now for `channel`, falling
    /// back to a synthesized placeholder so a channel whose `epg_id`
    /// matches nothing in any feed still serves *something*.
    pub async fn current(&self, channel: &Channel) -> Result<EpgProgram, AppError> {
        let key = identity::epg_key(channel);
        let cache_key = format!("current:{key}");
        if let Some(cached) = self.caches.current.get(&cache_key).await {
            return Ok(cached);
        }

        let now = Utc::now();
        let program = match self.db.current_program(&key, now).await? {
            Some(p) => p,
            None => fallback_current(channel, now),
        };

        self.caches
            .current
            .put(cache_key, program.clone(), StdDuration::from_secs(self.config.current_program_cache_secs))
            .await;
        Ok(program)
    }

    /// `getNext` (§4.11): the earliest program starting after now, if any.
    pub async fn next(&self, channel: &Channel) -> Result<Option<EpgProgram>, AppError> {
        let key = identity::epg_key(channel);
        let cache_key = format!("next:{key}");
        if let Some(cached) = self.caches.next.get(&cache_key).await {
            return Ok(cached);
        }

        let program = self.db.next_program(&key, Utc::now()).await?;
        self.caches
            .next
            .put(cache_key, program.clone(), StdDuration::from_secs(self.config.current_program_cache_secs))
            .await;
        Ok(program)
    }

    /// `getRange` (§4.11): all programs overlapping `[start, end)` for
    /// each of `channels`, keyed by channel id. A single-channel call is
    /// cached for `range_cache_secs`; a multi-channel ("all channels")
    /// call is cached separately for `all_channels_range_cache_secs`.
    pub async fn range(
        &self,
        channels: &[Channel],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<Uuid, Vec<EpgProgram>>, AppError> {
        let ids: Vec<String> = channels.iter().map(|c| c.id.to_string()).collect();
        let cache_key = format!("range:{}:{}:{}", ids.join(","), start.timestamp(), end.timestamp());
        if let Some(cached) = self.caches.range.get(&cache_key).await {
            return Ok(cached);
        }

        let mut result = HashMap::with_capacity(channels.len());
        for channel in channels {
            let key = identity::epg_key(channel);
            let programs = self.db.programs_in_range(&key, start, end).await?;
            result.insert(channel.id, programs);
        }

        let ttl = if channels.len() <= 1 {
            self.config.range_cache_secs
        } else {
            self.config.all_channels_range_cache_secs
        };
        self.caches.range.put(cache_key, result.clone(), StdDuration::from_secs(ttl)).await;
        Ok(result)
    }

    /// `/epg/search` — delegates straight to the store; searches aren't
    /// cached since they're already bounded and infrequent relative to
    /// `now`/`next` lookups.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<EpgProgram>, AppError> {
        self.db.search_programs(query, limit).await
    }

    /// `generateXMLTV` (§4.11). `channels` is the local set to emit
    /// `<channel>` elements for; programs for each are resolved the same
    /// way `range` does, then rendered with category overrides applied
    /// from the owning source, if any.
    pub async fn generate_xmltv(
        &self,
        channels: &[Channel],
        days: i64,
        program_cap: Option<usize>,
    ) -> Result<String, AppError> {
        let now = Utc::now();
        let start = now - Duration::hours(1);
        let end = now + Duration::days(days.max(1));
        let tz = display_timezone(&self.config);

        let mut by_channel = self.range(channels, start, end).await?;

        let mut xmltv = String::new();
        xmltv.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xmltv.push_str("<!DOCTYPE tv SYSTEM \"xmltv.dtd\">\n");
        xmltv.push_str("<tv generator-info-name=\"hdhr-bridge\">\n");

        for channel in channels {
            write_channel_xml(&mut xmltv, channel);
        }

        for channel in channels {
            let key = identity::epg_key(channel);
            let override_source = self.db.category_override_for_channel_key(&key).await?;
            let mut programs = by_channel.remove(&channel.id).unwrap_or_default();

            let synthetic = programs.is_empty();
            if synthetic {
                programs = synthesize_week(channel, now);
            }
            if let Some(cap) = program_cap {
                programs.truncate(cap);
            }

            for program in &programs {
                write_program_xml(&mut xmltv, channel, program, &tz, override_source.as_ref(), synthetic);
            }
        }

        xmltv.push_str("</tv>\n");
        Ok(xmltv)
    }
}

/// §4.11: `{title:"{channel.name} Live", category:"Live TV", start:now,
/// end:now+1h}` for a channel with no matching programme.
fn fallback_current(channel: &Channel, now: DateTime<Utc>) -> EpgProgram {
    EpgProgram {
        id: format!("fallback|{}|{}", identity::epg_key(channel), now.to_rfc3339()),
        channel_key: identity::epg_key(channel),
        title: format!("{} Live", channel.name),
        subtitle: None,
        description: Some(format!("{} Live", channel.name)),
        start: now,
        end: now + Duration::hours(1),
        category: Some("Live TV".to_string()),
        secondary_category: None,
        year: None,
        country: None,
        icon_url: channel.logo.clone(),
        episode_number: None,
        season_number: None,
        series_id: None,
        keywords: None,
        rating: None,
        flag_audio_description: false,
        flag_subtitles: false,
        flag_hd: false,
        flag_premiere: false,
        flag_finale: false,
        flag_live: true,
        flag_new_episode: false,
    }
}

/// §4.11: a deterministic 7-day, 1-hour-per-slot fallback so restrictive
/// clients that refuse to enumerate empty guides still see something.
/// Slots align to the top of the hour so repeated calls produce the same
/// schedule for the same `now`.
fn synthesize_week(channel: &Channel, now: DateTime<Utc>) -> Vec<EpgProgram> {
    let key = identity::epg_key(channel);
    let aligned_start = now
        .date_naive()
        .and_hms_opt(now.time().hour(), 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now);

    (0..24 * 7)
        .map(|slot| {
            let start = aligned_start + Duration::hours(slot);
            let end = start + Duration::hours(1);
            EpgProgram {
                id: EpgProgram::program_id(&key, start),
                channel_key: key.clone(),
                title: format!("{} Schedule", channel.name),
                subtitle: None,
                description: Some(format!("Programming information for {} is not yet available.", channel.name)),
                start,
                end,
                category: Some("Series".to_string()),
                secondary_category: None,
                year: None,
                country: None,
                icon_url: channel.logo.clone(),
                episode_number: None,
                season_number: None,
                series_id: None,
                keywords: None,
                rating: None,
                flag_audio_description: false,
                flag_subtitles: false,
                flag_hd: false,
                flag_premiere: false,
                flag_finale: false,
                flag_live: false,
                flag_new_episode: false,
            }
        })
        .collect()
}

fn write_channel_xml(out: &mut String, channel: &Channel) {
    let id = identity::epg_key(channel);
    out.push_str(&format!("  <channel id=\"{}\">\n", escape_xml(&id)));
    out.push_str(&format!("    <display-name>{}</display-name>\n", escape_xml(&channel.name)));
    out.push_str(&format!("    <display-name>{}</display-name>\n", escape_xml(&channel.number.to_string())));
    out.push_str(&format!("    <lcn>{}</lcn>\n", channel.number));
    if let Some(logo) = &channel.logo {
        out.push_str(&format!("    <icon src=\"{}\" />\n", escape_xml(logo)));
    }
    out.push_str("  </channel>\n");
}

fn write_program_xml(
    out: &mut String,
    channel: &Channel,
    program: &EpgProgram,
    tz: &chrono_tz::Tz,
    override_source: Option<&crate::models::EpgSource>,
    is_synthetic: bool,
) {
    let id = identity::epg_key(channel);

    out.push_str(&format!(
        "  <programme start=\"{}\" stop=\"{}\" channel=\"{}\"{}>\n",
        format_xmltv_time(program.start, tz),
        format_xmltv_time(program.end, tz),
        escape_xml(&id),
        if is_synthetic { " type=\"clip\"" } else { "" },
    ));

    out.push_str(&format!("    <title>{}</title>\n", escape_xml(&program.title)));
    if let Some(subtitle) = &program.subtitle {
        out.push_str(&format!("    <sub-title>{}</sub-title>\n", escape_xml(subtitle)));
    }
    let description = program.description.clone().unwrap_or_default();
    out.push_str(&format!("    <desc>{}</desc>\n", escape_xml(&description)));

    let primary_category = override_source
        .and_then(|s| s.category.clone())
        .unwrap_or_else(|| normalize_primary_category(program.category.as_deref()));
    out.push_str(&format!("    <category>{}</category>\n", escape_xml(&primary_category)));

    let secondary: Vec<String> = match override_source.map(|s| s.secondary_genres_vec()) {
        Some(genres) if !genres.is_empty() => genres,
        _ => program.secondary_category.clone().into_iter().collect(),
    };
    for category in secondary {
        out.push_str(&format!("    <category>{}</category>\n", escape_xml(&category)));
    }

    if let (Some(season), Some(episode)) = (program.season_number, program.episode_number) {
        if season > 0 && episode > 0 {
            out.push_str(&format!(
                "    <episode-num system=\"xmltv_ns\">{}.{}.</episode-num>\n",
                season - 1,
                episode - 1
            ));
            out.push_str(&format!(
                "    <episode-num system=\"onscreen\">S{:02}E{:02}</episode-num>\n",
                season, episode
            ));
        }
    }

    out.push_str("    <video>\n");
    out.push_str("      <colour>yes</colour>\n");
    out.push_str(&format!("      <aspect>{}</aspect>\n", if program.flag_hd { "16:9" } else { "4:3" }));
    out.push_str(&format!("      <quality>{}</quality>\n", if program.flag_hd { "HDTV" } else { "SDTV" }));
    out.push_str("    </video>\n");
    out.push_str("    <audio>\n      <stereo>stereo</stereo>\n    </audio>\n");

    if program.flag_premiere {
        out.push_str("    <premiere />\n");
    }
    if program.flag_live {
        out.push_str("    <live />\n");
    }
    if program.flag_new_episode {
        out.push_str("    <new />\n");
    }
    if is_synthetic {
        out.push_str("    <content-type>4</content-type>\n");
    }

    out.push_str("  </programme>\n");
}

fn normalize_primary_category(raw: Option<&str>) -> String {
    let lower = raw.unwrap_or_default().to_lowercase();
    if lower.contains("movie") || lower.contains("film") {
        "Movie".to_string()
    } else if lower.contains("sport") {
        "Sports".to_string()
    } else if lower.contains("news") {
        "News".to_string()
    } else {
        "Series".to_string()
    }
}

/// §8 S7: a UTC start formatted in `tz` renders as `YYYYMMDDHHMMSS ±ZZZZ`.
fn format_xmltv_time(at: DateTime<Utc>, tz: &chrono_tz::Tz) -> String {
    at.with_timezone(tz).format("%Y%m%d%H%M%S %z").to_string()
}

/// XML requires escaping of all five predefined entities in text/attribute
/// content; order matters so `&` is escaped first.
fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Channel;

    fn channel() -> Channel {
        Channel {
            id: Uuid::new_v4(),
            number: 5,
            name: "Test".to_string(),
            logo: None,
            epg_id: Some("test.uk".to_string()),
            enabled: true,
            encoding_profile: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn program(channel_key: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> EpgProgram {
        EpgProgram {
            id: EpgProgram::program_id(channel_key, start),
            channel_key: channel_key.to_string(),
            title: "Fixture Show".to_string(),
            subtitle: None,
            description: Some("A fixture".to_string()),
            start,
            end,
            category: Some("news".to_string()),
            secondary_category: None,
            year: None,
            country: None,
            icon_url: None,
            episode_number: Some(3),
            season_number: Some(1),
            series_id: None,
            keywords: None,
            rating: None,
            flag_audio_description: false,
            flag_subtitles: false,
            flag_hd: true,
            flag_premiere: false,
            flag_finale: false,
            flag_live: false,
            flag_new_episode: false,
        }
    }

    #[test]
    fn android_user_agent_is_detected_case_insensitively() {
        assert!(is_android_user_agent(Some("Mozilla/5.0 (Linux; Android 13)")));
        assert!(!is_android_user_agent(Some("Plex/1.0")));
        assert!(!is_android_user_agent(None));
    }

    #[test]
    fn fallback_current_spans_one_hour_from_now() {
        let c = channel();
        let now = Utc::now();
        let fallback = fallback_current(&c, now);
        assert_eq!(fallback.start, now);
        assert_eq!(fallback.end, now + Duration::hours(1));
        assert_eq!(fallback.category.as_deref(), Some("Live TV"));
        assert_eq!(fallback.title, "Test Live");
    }

    #[test]
    fn synthesize_week_produces_168_one_hour_slots() {
        let c = channel();
        let slots = synthesize_week(&c, Utc::now());
        assert_eq!(slots.len(), 24 * 7);
        for pair in slots.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn xmltv_time_formats_in_configured_offset() {
        // Etc/GMT-12 is a fixed, DST-free UTC+12 zone (POSIX sign is
        // inverted from the common "+12" reading), matching §8 S7.
        let tz: chrono_tz::Tz = "Etc/GMT-12".parse().unwrap();
        let start = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        assert_eq!(format_xmltv_time(start, &tz), "20250115220000 +1200");
    }

    #[test]
    fn escape_xml_covers_all_five_entities() {
        assert_eq!(escape_xml("a & b < c > d \" e '"), "a &amp; b &lt; c &gt; d &quot; e &#39;");
    }

    #[test]
    fn write_program_xml_always_emits_nonempty_title_and_desc() {
        let c = channel();
        let now = Utc::now();
        let p = program("test.uk", now, now + Duration::hours(1));
        let tz = chrono_tz::UTC;
        let mut out = String::new();
        write_program_xml(&mut out, &c, &p, &tz, None, false);
        assert!(out.contains("<title>Fixture Show</title>"));
        assert!(out.contains("<desc>A fixture</desc>"));
        assert!(out.contains("<episode-num system=\"xmltv_ns\">0.2.</episode-num>"));
        assert!(out.contains("<episode-num system=\"onscreen\">S01E03</episode-num>"));
    }

    #[test]
    fn normalize_primary_category_buckets_common_genres() {
        assert_eq!(normalize_primary_category(Some("Feature Film")), "Movie");
        assert_eq!(normalize_primary_category(Some("Football")), "Sports");
        assert_eq!(normalize_primary_category(Some("World News")), "News");
        assert_eq!(normalize_primary_category(Some("Drama Series")), "Series");
        assert_eq!(normalize_primary_category(None), "Series");
    }
}
