//! HDHomeRun device emulation (C4). Builds the JSON/XML documents Plex's
//! tuner discovery and lineup scan expect, so this bridge shows up as an
//! ordinary network tuner.

use serde::Serialize;

use crate::config::{EpgConfig, NetworkConfig};
use crate::models::Channel;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoverResponse {
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_number: String,
    pub firmware_name: String,
    pub firmware_version: String,
    pub device_id: String,
    pub device_auth: String,
    pub base_url: String,
    pub lineup_url: String,
    pub tuner_count: u32,
    pub supports_epg: bool,
    pub epg_url: String,
    pub epg_source: String,
    pub guide_url: String,
    pub xmltv_guide_data_url: String,
    pub epg_days: i64,
}

pub fn discover(config: &NetworkConfig, epg: &EpgConfig, base_url: &str) -> DiscoverResponse {
    DiscoverResponse {
        friendly_name: config.friendly_name.clone(),
        manufacturer: "Silicondust".to_string(),
        model_number: "HDTC-2US".to_string(),
        firmware_name: "hdhomerun_atsc".to_string(),
        firmware_version: env!("CARGO_PKG_VERSION").to_string(),
        device_id: config.device_id.clone(),
        device_auth: config.device_id.clone(),
        base_url: base_url.to_string(),
        lineup_url: format!("{base_url}/lineup.json"),
        tuner_count: config.tuner_count,
        supports_epg: true,
        epg_url: format!("{base_url}/epg/xmltv.xml"),
        epg_source: "hdhr-bridge".to_string(),
        guide_url: format!("{base_url}/epg/xmltv.xml"),
        xmltv_guide_data_url: format!("{base_url}/epg/xmltv.xml"),
        epg_days: epg.synthetic_fallback_days,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LineupEntry {
    #[serde(rename = "GuideNumber")]
    pub guide_number: String,
    #[serde(rename = "GuideName")]
    pub guide_name: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hd: Option<u8>,
    pub epg_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epg_channel_id: Option<String>,
    pub guide_url: String,
}

/// Only enabled channels with at least one enabled stream are eligible;
/// callers filter for `channel_has_enabled_stream` before passing in.
pub fn lineup(base_url: &str, channels: &[Channel]) -> Vec<LineupEntry> {
    channels
        .iter()
        .map(|channel| LineupEntry {
            guide_number: channel.number.to_string(),
            guide_name: channel.name.clone(),
            url: format!("{base_url}/stream/{}", channel.id),
            hd: Some(1),
            epg_available: true,
            epg_channel_id: channel.epg_id.clone(),
            guide_url: format!("{base_url}/epg/xmltv/{}", channel.id),
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LineupStatus {
    pub scan_in_progress: u8,
    pub scan_possible: u8,
    pub source: String,
    pub source_list: Vec<String>,
    pub epg_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epg_last_update: Option<String>,
}

pub fn lineup_status(epg_last_update: Option<chrono::DateTime<chrono::Utc>>) -> LineupStatus {
    LineupStatus {
        scan_in_progress: 0,
        scan_possible: 1,
        source: "Cable".to_string(),
        source_list: vec!["Cable".to_string()],
        epg_available: true,
        epg_last_update: epg_last_update.map(|t| t.timestamp().to_string()),
    }
}

/// The UPnP-ish `device.xml` description some clients fetch before trying
/// `discover.json`. We return a minimal document; Plex only inspects a
/// handful of fields.
pub fn device_xml(config: &NetworkConfig, base_url: &str) -> String {
    format!(
        r#"<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion>
    <major>1</major>
    <minor>0</minor>
  </specVersion>
  <URLBase>{base_url}</URLBase>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
    <friendlyName>{name}</friendlyName>
    <manufacturer>Silicondust</manufacturer>
    <modelName>HDTC-2US</modelName>
    <modelNumber>HDTC-2US</modelNumber>
    <serialNumber>{device_id}</serialNumber>
    <UDN>uuid:{device_id}</UDN>
  </device>
</root>"#,
        base_url = base_url,
        name = config.friendly_name,
        device_id = config.device_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            advertised_host: None,
            friendly_name: "Test Bridge".to_string(),
            device_id: "ABCD1234".to_string(),
            tuner_count: 2,
        }
    }

    fn test_epg_config() -> EpgConfig {
        crate::config::Config::default().epg
    }

    #[test]
    fn lineup_includes_stream_url_per_channel() {
        let channel = Channel {
            id: Uuid::new_v4(),
            number: 101,
            name: "News".to_string(),
            logo: None,
            epg_id: None,
            enabled: true,
            encoding_profile: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let entries = lineup("http://host:8080", &[channel.clone()]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].guide_number, "101");
        assert!(entries[0].url.contains(&channel.id.to_string()));
        assert!(entries[0].epg_available);
    }

    #[test]
    fn discover_reports_configured_tuner_count() {
        let config = test_config();
        let response = discover(&config, &test_epg_config(), "http://host:8080");
        assert_eq!(response.tuner_count, 2);
        assert_eq!(response.device_id, "ABCD1234");
        assert!(response.supports_epg);
        assert_eq!(response.epg_days, 7);
    }

    #[test]
    fn json_body_starts_with_brace() {
        let response = discover(&test_config(), &test_epg_config(), "http://host:8080");
        let body = serde_json::to_string(&response).unwrap();
        assert!(body.starts_with('{'));
    }
}
