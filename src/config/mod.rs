//! Runtime configuration.
//!
//! Loaded from a TOML file (written out with defaults on first run, same as
//! the teacher's `Config::load`), then overridden by the environment
//! variables and CLI flags documented for operators.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub streaming: StreamingConfig,
    pub epg: EpgConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// Host (and optionally port) advertised in `discover.json`,
    /// `device.xml` and stream URLs. Falls back to the incoming request's
    /// `Host` header when unset (see `identity::base_url`).
    pub advertised_host: Option<String>,
    pub friendly_name: String,
    pub device_id: String,
    pub tuner_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub global_concurrency_limit: u32,
    pub per_channel_concurrency_limit: u32,
    pub session_idle_timeout_secs: u64,
    pub idle_sweep_interval_secs: u64,
    pub deferred_start_max_secs: u64,
    pub encoder_binary: PathBuf,
    pub default_encoding_profile: String,
    /// Below this reliability score a stream always transcodes via the
    /// escalated profile, regardless of its declared kind (§4.6).
    pub reliability_threshold: f64,
    /// A stream with at least this many recorded failures is served with
    /// `EncodingProfile::high_reliability()` rather than its configured
    /// profile (§4.7 "escalation event").
    pub escalation_failure_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpgConfig {
    /// TTL for a single channel's `current_program:{id}` cache entry
    /// (§4.11 `getCurrent`).
    pub current_program_cache_secs: u64,
    /// TTL for a channel-specific range query (§4.11 `getRange`, "1h
    /// (channel-specific)").
    pub range_cache_secs: u64,
    /// TTL for an all-channels range query ("30m (all)" in the same
    /// section).
    pub all_channels_range_cache_secs: u64,
    pub synthetic_fallback_days: i64,
    pub synthetic_slot_hours: i64,
    /// Days a programme is kept after it ends before the scheduler's
    /// daily cleanup purges it (§4.10).
    pub program_retention_days: i64,
    pub cleanup_cron: String,
    /// Substituted for a source's `refresh_interval` when that field is
    /// empty or unparseable (§9 "Config resilience").
    pub refresh_default_interval: String,
    pub http_connect_timeout_secs: u64,
    pub http_total_timeout_secs: u64,
    pub http_max_redirects: usize,
    pub http_retry_attempts: u32,
    pub max_body_bytes: usize,
    /// IANA zone XMLTV timestamps are rendered in; `None` uses the
    /// process's local timezone (§4.11, §8 S7).
    pub display_timezone: Option<String>,
    /// Reduced day window XMLTV/JSON EPG responses use for Android user
    /// agents (§6).
    pub android_day_window: i64,
    /// Programme cap applied to the same Android responses.
    pub android_program_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub data_path: PathBuf,
    pub database_path: PathBuf,
    pub supervisord_conf: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                advertised_host: None,
                friendly_name: "HDHR Bridge".to_string(),
                device_id: "12345678".to_string(),
                tuner_count: 4,
            },
            streaming: StreamingConfig {
                global_concurrency_limit: 5,
                per_channel_concurrency_limit: 1,
                session_idle_timeout_secs: 30,
                idle_sweep_interval_secs: 15,
                deferred_start_max_secs: 10,
                encoder_binary: PathBuf::from("ffmpeg"),
                default_encoding_profile: "copy".to_string(),
                reliability_threshold: 0.3,
                escalation_failure_count: 3,
            },
            epg: EpgConfig {
                current_program_cache_secs: 30,
                range_cache_secs: 3600,
                all_channels_range_cache_secs: 1800,
                synthetic_fallback_days: 7,
                synthetic_slot_hours: 1,
                program_retention_days: 7,
                cleanup_cron: "0 0 2 * * *".to_string(),
                refresh_default_interval: "4h".to_string(),
                http_connect_timeout_secs: 5,
                http_total_timeout_secs: 120,
                http_max_redirects: 10,
                http_retry_attempts: 3,
                max_body_bytes: 100 * 1024 * 1024,
                display_timezone: None,
                android_day_window: 2,
                android_program_cap: 500,
            },
            paths: PathsConfig {
                data_path: PathBuf::from("./data"),
                database_path: PathBuf::from("./data/hdhr-bridge.db"),
                supervisord_conf: None,
            },
        }
    }
}

impl Config {
    /// Loads `config_file` if it exists, else writes out the default
    /// configuration to that path and returns it. Environment variables
    /// are then applied on top, matching the precedence CLI flags get in
    /// `main.rs` (CLI overrides env overrides file).
    pub fn load(config_file: &str) -> Result<Self, AppError> {
        let mut config = if std::path::Path::new(config_file).exists() {
            let contents = std::fs::read_to_string(config_file)
                .map_err(|e| AppError::config(format!("reading {config_file}: {e}")))?;
            toml::from_str(&contents)
                .map_err(|e| AppError::config(format!("parsing {config_file}: {e}")))?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)
                .map_err(|e| AppError::config(e.to_string()))?;
            if let Some(parent) = std::path::Path::new(config_file).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| AppError::config(e.to_string()))?;
                }
            }
            std::fs::write(config_file, contents)
                .map_err(|e| AppError::config(format!("writing {config_file}: {e}")))?;
            default_config
        };

        config.apply_env_overrides();
        std::fs::create_dir_all(&config.paths.data_path)
            .map_err(|e| AppError::config(e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ADVERTISED_HOST") {
            self.network.advertised_host = Some(v);
        }
        if let Ok(v) = std::env::var("DATA_PATH") {
            self.paths.data_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DB_PATH") {
            self.paths.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SUPERVISORD_CONF") {
            self.paths.supervisord_conf = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("ENCODER_PATH") {
            self.streaming.encoder_binary = PathBuf::from(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).expect("serialize");
        let parsed: Config = toml::from_str(&serialized).expect("parse");
        assert_eq!(parsed.network.port, config.network.port);
    }

    #[test]
    fn env_overrides_apply_on_top_of_defaults() {
        std::env::set_var("ADVERTISED_HOST", "tuner.example.com:8080");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(
            config.network.advertised_host.as_deref(),
            Some("tuner.example.com:8080")
        );
        std::env::remove_var("ADVERTISED_HOST");
    }
}
