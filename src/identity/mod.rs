//! Identity & addressing (C3). Resolves the base URL under which this
//! bridge should advertise itself to Plex, and maps between a channel's
//! database id and the EPG key used to join it against programme data.

use axum::http::HeaderMap;

use crate::config::NetworkConfig;
use crate::models::Channel;

/// The scheme+host+port Plex should use to reach this instance.
///
/// Resolution order (§4.3): an explicit `advertised_host` from config
/// wins outright; otherwise we trust the incoming request's `Host`
/// header, since that's what the client actually dialed; failing that we
/// fall back to `network.host`/`network.port` from config, which may be
/// `0.0.0.0` and therefore useless to a remote client but is better than
/// nothing.
pub fn base_url(config: &NetworkConfig, headers: &HeaderMap) -> String {
    if let Some(host) = &config.advertised_host {
        return format!("http://{host}");
    }
    if let Some(host) = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        return format!("http://{host}");
    }
    format!("http://{}:{}", config.host, config.port)
}

/// The key used to look up EPG data for a channel: its explicit `epg_id`
/// if set, else its own database id (stringified), so a channel with no
/// configured EPG mapping still gets a stable (if unmatched) key rather
/// than `None` propagating through every EPG query.
pub fn epg_key(channel: &Channel) -> String {
    channel
        .epg_id
        .clone()
        .unwrap_or_else(|| channel.id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn channel(epg_id: Option<&str>) -> Channel {
        Channel {
            id: Uuid::new_v4(),
            number: 1,
            name: "Test".to_string(),
            logo: None,
            epg_id: epg_id.map(str::to_string),
            enabled: true,
            encoding_profile: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn epg_key_falls_back_to_channel_id() {
        let c = channel(None);
        assert_eq!(epg_key(&c), c.id.to_string());
    }

    #[test]
    fn epg_key_prefers_explicit_mapping() {
        let c = channel(Some("bbc1.uk"));
        assert_eq!(epg_key(&c), "bbc1.uk");
    }

    #[test]
    fn advertised_host_takes_priority_over_request_host() {
        let mut config = NetworkConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            advertised_host: Some("tuner.lan:9000".to_string()),
            friendly_name: "x".to_string(),
            device_id: "x".to_string(),
            tuner_count: 1,
        };
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::HOST, "ignored:1234".parse().unwrap());
        assert_eq!(base_url(&config, &headers), "http://tuner.lan:9000");

        config.advertised_host = None;
        assert_eq!(base_url(&config, &headers), "http://ignored:1234");
    }
}
