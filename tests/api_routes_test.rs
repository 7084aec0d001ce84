//! End-to-end HTTP surface tests, driving the real axum router with
//! `tower::ServiceExt::oneshot` over an in-memory SQLite database, the
//! same way the teacher's `tests/api_routes_test.rs` drives its router.
//! Covers the §8 end-to-end scenarios that don't require a live
//! transcoder or upstream network stream (S1, S2, S3, S4, S5, S6).

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use hdhr_bridge::config::Config;
use hdhr_bridge::database::Database;
use hdhr_bridge::epg::{EpgCaches, EpgQuery};
use hdhr_bridge::ingestor::scheduler::SchedulerService;
use hdhr_bridge::ingestor::EpgIngester;
use hdhr_bridge::models::{Channel, EpgSource, Stream, StreamKind};
use hdhr_bridge::streaming::session::SessionManager;
use hdhr_bridge::web::{self, AppState};

async fn test_app() -> (Router, Database) {
    let (router, db, _sessions) = test_app_with(|_| {}).await;
    (router, db)
}

/// Same as `test_app`, but lets the caller tweak the default config (e.g.
/// shrink the concurrency caps for S3) and hands back the `SessionManager`
/// so a test can admit/release sessions directly without a live upstream.
async fn test_app_with(mutate: impl FnOnce(&mut Config)) -> (Router, Database, SessionManager) {
    let db = Database::new("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();

    let mut config = Config::default();
    mutate(&mut config);
    let caches = EpgCaches::new();
    let epg = EpgQuery::new(db.clone(), caches.clone(), config.epg.clone());
    let ingester = Arc::new(EpgIngester::new(db.clone(), config.epg.clone(), caches.clone()).unwrap());
    let scheduler = SchedulerService::new(db.clone(), ingester.clone(), config.epg.clone());
    let sessions = SessionManager::new(
        config.streaming.global_concurrency_limit,
        config.streaming.per_channel_concurrency_limit,
        Duration::from_secs(config.streaming.session_idle_timeout_secs),
    );

    let state = AppState {
        db: db.clone(),
        config,
        sessions: sessions.clone(),
        http: reqwest::Client::new(),
        epg,
        ingester,
        scheduler,
    };

    (web::router(state), db, sessions)
}

async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

fn sample_channel(number: i64, epg_id: Option<&str>) -> Channel {
    let now = chrono::Utc::now();
    Channel {
        id: Uuid::new_v4(),
        number,
        name: "Test".to_string(),
        logo: None,
        epg_id: epg_id.map(str::to_string),
        enabled: true,
        encoding_profile: None,
        created_at: now,
        updated_at: now,
    }
}

fn sample_stream(channel_id: Uuid, url: &str, kind: StreamKind) -> Stream {
    let now = chrono::Utc::now();
    Stream {
        id: Uuid::new_v4(),
        channel_id,
        url: url.to_string(),
        kind,
        enabled: true,
        reliability_score: 1.0,
        failure_count: 0,
        last_failure: None,
        encoding_profile: None,
        sort_order: 0,
        created_at: now,
        updated_at: now,
    }
}

// S1: Discovery with no channels.
#[tokio::test]
async fn discovery_with_no_channels() {
    let (app, _db) = test_app().await;

    let (status, body) = send(&app, Method::GET, "/discover.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["TunerCount"], 5);

    let (status, body) = send(&app, Method::GET, "/lineup.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}

// S2: Lineup after a channel with an enabled stream is added.
#[tokio::test]
async fn lineup_reflects_added_channel() {
    let (app, db) = test_app().await;
    let channel = db.create_channel(sample_channel(5, None)).await.unwrap();
    db.create_stream(sample_stream(channel.id, "http://x/a.m3u8", StreamKind::Hls))
        .await
        .unwrap();

    let (status, body) = send(&app, Method::GET, "/lineup.json").await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["GuideNumber"], "5");
    assert!(entries[0]["URL"].as_str().unwrap().ends_with(&format!("/stream/{}", channel.id)));
}

// A disabled channel, or one with no enabled stream, never appears.
#[tokio::test]
async fn lineup_excludes_disabled_or_streamless_channels() {
    let (app, db) = test_app().await;
    let mut disabled = sample_channel(6, None);
    disabled.enabled = false;
    let disabled = db.create_channel(disabled).await.unwrap();
    db.create_stream(sample_stream(disabled.id, "http://x/b.m3u8", StreamKind::Hls)).await.unwrap();

    let streamless = db.create_channel(sample_channel(7, None)).await.unwrap();
    let _ = streamless;

    let (_, body) = send(&app, Method::GET, "/lineup.json").await;
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn stream_endpoint_404s_for_unknown_channel() {
    let (app, _db) = test_app().await;
    let (status, body) = send(&app, Method::GET, &format!("/stream/{}", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

// S3: a stream request beyond the global concurrency cap is rejected with
// 503 `{error:"capacity"}`. The one free slot is consumed directly through
// the `SessionManager` (rather than racing a second real HTTP request)
// so the assertion exercises the web layer's `AppError::Capacity` handling
// without depending on a live upstream or encoder.
#[tokio::test]
async fn stream_endpoint_503s_with_capacity_json_when_over_the_global_cap() {
    let (app, db, sessions) = test_app_with(|c| {
        c.streaming.global_concurrency_limit = 1;
        c.streaming.per_channel_concurrency_limit = 1;
    })
    .await;

    let channel = db.create_channel(sample_channel(21, None)).await.unwrap();
    db.create_stream(sample_stream(channel.id, "http://example.invalid/a.m3u8", StreamKind::Hls))
        .await
        .unwrap();

    // Occupies the only global slot; never released within this test.
    let (_handle, _cancel) = sessions.admit(channel.id).await.unwrap();

    let (status, body) = send(&app, Method::GET, &format!("/stream/{}", channel.id)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "capacity");
}

// S4/S6: a channel whose epg_id never appears in any feed still serves a
// fallback now/next response, addressable by either its UUID or epg_id.
#[tokio::test]
async fn now_endpoint_falls_back_and_aliases_by_epg_id() {
    let (app, db) = test_app().await;
    let channel = db.create_channel(sample_channel(9, Some("unmatched.epg"))).await.unwrap();

    let (status, by_uuid) = send(&app, Method::GET, &format!("/epg/now/{}", channel.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_uuid["title"], "Test Live");

    let (status, by_epg_id) = send(&app, Method::GET, "/epg/now/unmatched.epg").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_epg_id["title"], by_uuid["title"]);
    assert_eq!(by_epg_id["start"], by_uuid["start"]);
}

#[tokio::test]
async fn now_endpoint_404s_for_unknown_alias() {
    let (app, _db) = test_app().await;
    let (status, _) = send(&app, Method::GET, "/epg/now/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// S5: a source whose feed is garbage fails a manual refresh but never
// brings down the now/next endpoints for channels that reference it.
#[tokio::test]
async fn force_refresh_of_invalid_feed_reports_error_as_json() {
    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;

    let (app, db) = test_app().await;
    let now = chrono::Utc::now();
    let source = db
        .create_epg_source(EpgSource {
            id: Uuid::new_v4(),
            name: "broken".to_string(),
            url: format!("{}/epg.xml", server.uri()),
            refresh_interval: "4h".to_string(),
            enabled: true,
            last_refresh: None,
            last_success: None,
            last_error: None,
            category: None,
            secondary_genres: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/epg/force-refresh/{}", source.id))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["kind"], "parse");

    let channel = db.create_channel(sample_channel(11, None)).await.unwrap();
    let (status, now_body) = send(&app, Method::GET, &format!("/epg/now/{}", channel.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(now_body["category"], "Live TV");
}

#[tokio::test]
async fn all_json_error_responses_start_with_a_brace() {
    let (app, _db) = test_app().await;
    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("/stream/{}", Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/json; charset=utf-8")
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.starts_with(b"{"));
}

// §7 forbids non-JSON error bodies; a malformed query string must not
// fall through to axum's default `text/plain` extractor rejection.
#[tokio::test]
async fn malformed_query_string_returns_json_parse_error() {
    let (app, _db) = test_app().await;
    let (status, body) = send(&app, Method::GET, "/epg/grid").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "parse");
}

// Same contract for a malformed path segment feeding a `Path<Uuid>`
// extractor directly (rather than the UUID-or-epg_id `resolve_channel`
// path, which never fails extraction since it takes a bare `String`).
#[tokio::test]
async fn malformed_path_uuid_returns_json_not_found_error() {
    let (app, _db) = test_app().await;
    let (status, body) = send(&app, Method::DELETE, "/epg-sources/not-a-uuid").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn xmltv_all_is_well_formed_and_every_programme_has_a_title() {
    let (app, db) = test_app().await;
    db.create_channel(sample_channel(12, None)).await.unwrap();

    let request = Request::builder().method(Method::GET).uri("/epg/xmltv.xml").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let xml = String::from_utf8(bytes.to_vec()).unwrap();

    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("<tv "));
    assert!(!xml.contains("<title></title>"));
    for segment in xml.split("<programme").skip(1) {
        assert!(segment.contains("<title>"));
    }
}
