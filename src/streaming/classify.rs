//! Stream classifier (C6). Decides whether a stream can be served
//! direct, needs a lightweight remux, or needs a full transcode, using a
//! staged heuristic-then-probe approach modeled after the teacher's
//! `streaming/classification.rs`: cheap extension/URL checks first, a
//! bounded network probe only when those are ambiguous.

use std::time::Duration;

use crate::errors::AppError;
use crate::models::{StreamKind, UpstreamMode};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Who's asking. Plex normalizes codec quirks by always transcoding HLS;
/// a plain browser can't decode raw MPEG-TS at all (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Plex,
    Browser,
    Other,
}

pub fn client_kind_from_user_agent(user_agent: Option<&str>) -> ClientKind {
    match user_agent {
        Some(ua) if ua.to_lowercase().contains("plex") => ClientKind::Plex,
        Some(_) => ClientKind::Other,
        None => ClientKind::Other,
    }
}

/// §4.6 URL classification: file extension first, then an explicit
/// `type=ts` query flag, else the stream's declared `kind`. A HEAD
/// `Content-Type` probe (when available) is checked ahead of the
/// declared kind fallback.
pub fn classify_url_kind(url: &str, declared: StreamKind, content_type: Option<&str>) -> StreamKind {
    let lower = url.to_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);

    if path.ends_with(".m3u8") {
        return StreamKind::Hls;
    }
    if path.ends_with(".mpd") {
        return StreamKind::Dash;
    }
    if path.ends_with(".ts") || path.ends_with(".mpegts") || path.ends_with(".mts") {
        return StreamKind::Mpegts;
    }
    if lower.contains("type=ts") {
        return StreamKind::Mpegts;
    }
    if let Some(ct) = content_type {
        let ct = ct.to_lowercase();
        if ct.contains("video/mp2t") || ct.contains("octet-stream") {
            return StreamKind::Mpegts;
        }
        if ct.contains("mpegurl") {
            return StreamKind::Hls;
        }
        if ct.contains("dash+xml") {
            return StreamKind::Dash;
        }
    }
    declared
}

/// Inputs the classifier needs beyond the stream's own row: who's asking
/// and how reliable this stream has been lately.
pub struct ClassifyContext<'a> {
    pub client: ClientKind,
    pub reliability_score: f64,
    pub reliability_threshold: f64,
    pub content_type: Option<&'a str>,
}

/// Extension- and context-based classification, no network access.
/// Returns `None` when the URL alone isn't conclusive (ambiguous HLS/DASH)
/// and a manifest probe is warranted.
fn classify_by_url(url: &str, declared: StreamKind, ctx: &ClassifyContext) -> Option<UpstreamMode> {
    let lower = url.to_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    let is_ts_url = path.ends_with(".ts") || path.ends_with(".mpegts") || path.ends_with(".mts");

    // `.ts`-suffixed URLs served to a browser always transcode — browsers
    // cannot play raw MPEG-TS regardless of what the upstream actually is.
    if is_ts_url && ctx.client == ClientKind::Browser {
        return Some(UpstreamMode::Transcode);
    }

    if ctx.reliability_score < ctx.reliability_threshold {
        return Some(UpstreamMode::Transcode);
    }

    let kind = classify_url_kind(url, declared, ctx.content_type);
    match kind {
        StreamKind::Mpegts => {
            let direct_ok = ctx
                .content_type
                .map(|ct| {
                    let ct = ct.to_lowercase();
                    ct.contains("video/mp2t") || ct.contains("octet-stream")
                })
                .unwrap_or(true);
            Some(if direct_ok { UpstreamMode::Direct } else { UpstreamMode::Transcode })
        }
        StreamKind::Rtmp | StreamKind::Rtsp => Some(UpstreamMode::Transcode),
        StreamKind::Http if path.ends_with(".mp4") || path.ends_with(".mkv") => {
            Some(UpstreamMode::Transcode)
        }
        // Plex normalizes HLS codec quirks by always transcoding rather
        // than remuxing, per §4.6.
        StreamKind::Hls if ctx.client == ClientKind::Plex => Some(UpstreamMode::Transcode),
        StreamKind::Hls | StreamKind::Dash => None,
        _ => None,
    }
}

/// Fetches the first few KB of an HLS/DASH manifest to tell a
/// single-variant (collapsible to direct passthrough once the media
/// segments are known) playlist apart from a multi-variant one (needs a
/// remux to pick and flatten a rendition). Bounded by `PROBE_TIMEOUT` so
/// a slow or hanging manifest host never blocks the gateway.
async fn probe_playlist(client: &reqwest::Client, url: &str) -> Result<UpstreamMode, AppError> {
    let response = tokio::time::timeout(PROBE_TIMEOUT, client.get(url).send())
        .await
        .map_err(|_| AppError::upstream(format!("probe timed out fetching {url}")))?
        .map_err(|e| AppError::upstream(format!("probe request failed: {e}")))?;

    let body = response
        .text()
        .await
        .map_err(|e| AppError::upstream(format!("probe body read failed: {e}")))?;

    let variant_count = body
        .lines()
        .filter(|line| line.starts_with("#EXT-X-STREAM-INF"))
        .count();

    if variant_count > 1 {
        Ok(UpstreamMode::Remux)
    } else {
        Ok(UpstreamMode::Direct)
    }
}

/// Classifies `url` of the given declared `kind`, probing the network
/// only when the cheap heuristics can't decide.
pub async fn classify(
    client: &reqwest::Client,
    url: &str,
    declared: StreamKind,
    ctx: &ClassifyContext<'_>,
) -> Result<UpstreamMode, AppError> {
    if let Some(mode) = classify_by_url(url, declared, ctx) {
        return Ok(mode);
    }
    probe_playlist(client, url).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(client: ClientKind) -> ClassifyContext<'static> {
        ClassifyContext {
            client,
            reliability_score: 1.0,
            reliability_threshold: 0.3,
            content_type: None,
        }
    }

    #[test]
    fn mpegts_with_unknown_content_type_is_direct() {
        assert_eq!(
            classify_by_url("http://x/stream", StreamKind::Mpegts, &ctx(ClientKind::Other)),
            Some(UpstreamMode::Direct)
        );
    }

    #[test]
    fn plain_ts_file_to_plex_is_direct() {
        assert_eq!(
            classify_by_url("http://x/a.ts", StreamKind::Http, &ctx(ClientKind::Plex)),
            Some(UpstreamMode::Direct)
        );
    }

    #[test]
    fn plain_ts_file_to_browser_always_transcodes() {
        assert_eq!(
            classify_by_url("http://x/a.ts", StreamKind::Http, &ctx(ClientKind::Browser)),
            Some(UpstreamMode::Transcode)
        );
    }

    #[test]
    fn mp4_requires_transcode() {
        assert_eq!(
            classify_by_url("http://x/a.mp4", StreamKind::Http, &ctx(ClientKind::Other)),
            Some(UpstreamMode::Transcode)
        );
    }

    #[test]
    fn hls_to_plex_always_transcodes() {
        assert_eq!(
            classify_by_url("http://x/master.m3u8", StreamKind::Hls, &ctx(ClientKind::Plex)),
            Some(UpstreamMode::Transcode)
        );
    }

    #[test]
    fn hls_url_to_non_plex_client_is_ambiguous() {
        assert_eq!(
            classify_by_url("http://x/master.m3u8", StreamKind::Hls, &ctx(ClientKind::Other)),
            None
        );
    }

    #[test]
    fn low_reliability_forces_transcode_regardless_of_kind() {
        let mut c = ctx(ClientKind::Other);
        c.reliability_score = 0.1;
        assert_eq!(
            classify_by_url("http://x/stream", StreamKind::Mpegts, &c),
            Some(UpstreamMode::Transcode)
        );
    }

    #[test]
    fn url_kind_extension_rules_take_precedence_over_declared_kind() {
        assert_eq!(
            classify_url_kind("http://x/a.m3u8", StreamKind::Mpegts, None),
            StreamKind::Hls
        );
        assert_eq!(
            classify_url_kind("http://x/a.mpd", StreamKind::Hls, None),
            StreamKind::Dash
        );
        assert_eq!(
            classify_url_kind("http://x/play?type=ts", StreamKind::Hls, None),
            StreamKind::Mpegts
        );
    }
}
