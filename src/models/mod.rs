//! Persistent entity definitions shared across the store, the HDHomeRun
//! surface, the streaming pipeline and the EPG engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A Plex-visible channel. `enabled` channels need at least one enabled
/// [`Stream`] to appear in the lineup.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Channel {
    pub id: Uuid,
    pub number: i64,
    pub name: String,
    pub logo: Option<String>,
    pub epg_id: Option<String>,
    pub enabled: bool,
    pub encoding_profile: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The upstream realization of a [`Channel`]. A channel may have several;
/// the first enabled one by insertion order is primary.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Stream {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub url: String,
    pub kind: StreamKind,
    pub enabled: bool,
    pub reliability_score: f64,
    pub failure_count: i64,
    pub last_failure: Option<DateTime<Utc>>,
    pub encoding_profile: Option<String>,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Http,
    Hls,
    Dash,
    Rtsp,
    Rtmp,
    Mpegts,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Http => "http",
            StreamKind::Hls => "hls",
            StreamKind::Dash => "dash",
            StreamKind::Rtsp => "rtsp",
            StreamKind::Rtmp => "rtmp",
            StreamKind::Mpegts => "mpegts",
        }
    }
}

/// An upstream XMLTV feed the EPG ingester pulls on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EpgSource {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub refresh_interval: String,
    pub enabled: bool,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub category: Option<String>,
    /// JSON-encoded `Vec<String>`; stored as text because it came from a
    /// sloppily typed source column (see §9 of the spec).
    pub secondary_genres: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EpgSource {
    pub fn secondary_genres_vec(&self) -> Vec<String> {
        self.secondary_genres
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .unwrap_or_default()
    }
}

/// A channel as advertised by an [`EpgSource`]'s XMLTV feed. Replaced
/// wholesale on every successful refresh of that source.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EpgChannel {
    pub source_id: Uuid,
    pub epg_id: String,
    pub display_name: String,
    pub icon_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A single programme. `channel_key` is the EPG id as observed in the
/// feed; it is a weak reference, resolved at read time, not a foreign key
/// (see DESIGN NOTES §9 of the spec).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EpgProgram {
    pub id: String,
    pub channel_key: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub category: Option<String>,
    pub secondary_category: Option<String>,
    pub year: Option<i64>,
    pub country: Option<String>,
    pub icon_url: Option<String>,
    pub episode_number: Option<i64>,
    pub season_number: Option<i64>,
    pub series_id: Option<String>,
    pub keywords: Option<String>,
    pub rating: Option<String>,
    pub flag_audio_description: bool,
    pub flag_subtitles: bool,
    pub flag_hd: bool,
    pub flag_premiere: bool,
    pub flag_finale: bool,
    pub flag_live: bool,
    pub flag_new_episode: bool,
}

impl EpgProgram {
    pub fn program_id(channel_key: &str, start: DateTime<Utc>) -> String {
        format!("{channel_key}|{}", start.to_rfc3339())
    }
}

/// Application-wide key/value settings backing the concurrency caps and
/// other runtime-tunable values (§6 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

/// A live streaming session. In-memory only; never persisted (§3).
#[derive(Debug, Clone)]
pub struct StreamSessionInfo {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub last_byte_at: DateTime<Utc>,
    pub client_ua: Option<String>,
    pub upstream_state: UpstreamState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Connecting,
    Streaming,
    Closed,
}

/// §4.6 classifier output: how the gateway should serve a given stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamMode {
    Direct,
    Remux,
    Transcode,
}

/// §4.7 encoding profile. Fields mirror the recognized option set in §4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingProfile {
    pub preset: String,
    pub input_reconnect: bool,
    pub anti_loop: bool,
    pub gop_size: u32,
    pub keyframe_interval: u32,
    pub video_codec: VideoCodecMode,
    pub audio_codec: AudioCodecMode,
    pub container: ContainerMode,
    pub timestamp_strategy: String,
    pub retry_attempts: u32,
    pub session_timeout_secs: u64,
    pub enable_monitoring: bool,
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self {
            preset: "veryfast".to_string(),
            input_reconnect: true,
            anti_loop: false,
            gop_size: 50,
            keyframe_interval: 2,
            video_codec: VideoCodecMode::Copy,
            audio_codec: AudioCodecMode::Copy,
            container: ContainerMode::Mpegts,
            timestamp_strategy: "passthrough".to_string(),
            retry_attempts: 1,
            session_timeout_secs: 30,
            enable_monitoring: true,
        }
    }
}

impl EncodingProfile {
    /// The escalated, anti-loop-hardened profile described in §4.7:
    /// small GOP, frequent keyframes, live-edge start, no seeking.
    pub fn high_reliability() -> Self {
        Self {
            preset: "ultrafast".to_string(),
            input_reconnect: true,
            anti_loop: true,
            gop_size: 25,
            keyframe_interval: 1,
            video_codec: VideoCodecMode::H264,
            audio_codec: AudioCodecMode::Aac,
            container: ContainerMode::Mpegts,
            timestamp_strategy: "start_at_zero".to_string(),
            retry_attempts: 1,
            session_timeout_secs: 30,
            enable_monitoring: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodecMode {
    Copy,
    H264,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodecMode {
    Copy,
    Aac,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerMode {
    Mpegts,
    Mp4,
}
