//! HTTP surface. Thin axum handlers wiring the HDHomeRun emulation (C4),
//! stream gateway (C8) and EPG query/ingest surface (C9-C11) together,
//! following the same router-plus-shared-`AppState` shape as the
//! teacher's `web/mod.rs`, pared down to the endpoints this bridge
//! actually serves.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::database::Database;
use crate::epg::EpgQuery;
use crate::errors::AppError;
use crate::hdhomerun;
use crate::identity;
use crate::ingestor::scheduler::SchedulerService;
use crate::ingestor::EpgIngester;
use crate::models::{Channel, EncodingProfile, Stream as UpstreamStream};
use crate::streaming::classify::client_kind_from_user_agent;
use crate::streaming::encoder::EncoderProcess;
use crate::streaming::gateway::{self, GatewayConfig};
use crate::streaming::session::SessionManager;

/// Resolves a `{channel_id}` path segment that may be either a channel's
/// internal UUID or its configured `epg_id` (§8 S6): `/epg/now/{uuid}`
/// and `/epg/now/{epg_id}` must return the same program.
async fn resolve_channel(db: &Database, raw: &str) -> Result<Channel, AppError> {
    if let Ok(id) = Uuid::parse_str(raw) {
        if let Some(channel) = db.get_channel(id).await? {
            return Ok(channel);
        }
    }
    db.get_channel_by_epg_id(raw)
        .await?
        .ok_or_else(|| AppError::not_found("channel", raw.to_string()))
}

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub sessions: SessionManager,
    pub http: reqwest::Client,
    pub epg: EpgQuery,
    pub ingester: Arc<EpgIngester>,
    pub scheduler: SchedulerService,
}

// ---------------------------------------------------------------------
// Extractor wrappers
// ---------------------------------------------------------------------
//
// §7 forbids non-JSON error bodies on any client-facing response.
// `axum::extract::{Query, Path, Json}` all fall back to a plain-text
// rejection body on malformed input, so the guide/admin endpoints wrap
// them and convert the rejection into the same `AppError` JSON shape
// every handler error already uses.

/// `Query<T>` that rejects with an `AppError::Parse` JSON body instead of
/// axum's default `text/plain` rejection.
pub struct AppQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for AppQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| AppQuery(value))
            .map_err(|rejection| AppError::parse(format!("invalid query string: {rejection}")))
    }
}

/// `Path<T>` that rejects with an `AppError::NotFound` JSON body instead
/// of axum's default `text/plain` rejection (a malformed path segment -
/// e.g. a non-UUID `{id}` - means the addressed resource doesn't exist).
pub struct AppPath<T>(pub T);

impl<T, S> FromRequestParts<S> for AppPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Path::<T>::from_request_parts(parts, state)
            .await
            .map(|Path(value)| AppPath(value))
            .map_err(|rejection| AppError::not_found("path parameter", rejection.to_string()))
    }
}

/// `Json<T>` request-body extractor that rejects with an
/// `AppError::Parse` JSON body instead of axum's default `text/plain`
/// rejection.
pub struct AppJson<T>(pub T);

impl<T, S> FromRequest<S> for AppJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(json_rejection_to_app_error(rejection)),
        }
    }
}

fn json_rejection_to_app_error(rejection: JsonRejection) -> AppError {
    AppError::parse(format!("invalid JSON body: {rejection}"))
}

/// Rewrites `Content-Type: application/json` responses to carry an
/// explicit `charset=utf-8` (§4.4) - `axum::Json` emits the bare MIME
/// type, which is valid but stricter client parsers want the charset
/// spelled out.
async fn json_charset_layer(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let is_bare_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "application/json")
        .unwrap_or(false);
    if is_bare_json {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
    }
    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/discover.json", get(discover))
        .route("/lineup.json", get(lineup))
        .route("/lineup_status.json", get(lineup_status))
        .route("/device.xml", get(device_xml))
        .route("/stream/:channel_id", get(stream_channel))
        .route("/epg/xmltv.xml", get(epg_xmltv_all))
        .route("/epg/xmltv/:channel_id", get(epg_xmltv_channel))
        .route("/epg/json/:channel_id", get(epg_json_channel))
        .route("/epg/now/:channel_id", get(epg_now))
        .route("/epg/next/:channel_id", get(epg_next))
        .route("/epg/grid", get(epg_grid))
        .route("/epg/search", get(epg_search))
        .route("/epg-sources", post(create_epg_source))
        .route("/epg-sources/:id", delete(delete_epg_source))
        .route("/epg/force-refresh/:id", post(force_refresh))
        .route("/epg/debug/jobs", get(debug_jobs))
        .route("/epg/debug/diagnose", get(debug_diagnose_all))
        .route("/epg/debug/diagnose/:id", get(debug_diagnose_one))
        .route("/streams/preview/:stream_id", get(stream_preview))
        .route("/streams/active", get(streams_active))
        .layer(middleware::from_fn(json_charset_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------
// HDHomeRun surface (C4)
// ---------------------------------------------------------------------

async fn discover(State(state): State<AppState>, headers: HeaderMap) -> Json<hdhomerun::DiscoverResponse> {
    let base = identity::base_url(&state.config.network, &headers);
    let mut response = hdhomerun::discover(&state.config.network, &state.config.epg, &base);
    // §4.4: "TunerCount equals the global concurrency cap" - the network
    // config's own tuner_count is advisory/display only.
    response.tuner_count = state.config.streaming.global_concurrency_limit;
    Json(response)
}

async fn lineup(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<hdhomerun::LineupEntry>>, AppError> {
    let base = identity::base_url(&state.config.network, &headers);
    let channels = state.db.list_channels(true).await?;

    let mut eligible = Vec::with_capacity(channels.len());
    for channel in channels {
        if state.db.channel_has_enabled_stream(channel.id).await? {
            eligible.push(channel);
        }
    }

    Ok(Json(hdhomerun::lineup(&base, &eligible)))
}

async fn lineup_status(State(state): State<AppState>) -> Result<Json<hdhomerun::LineupStatus>, AppError> {
    let sources = state.db.list_epg_sources(false).await?;
    let last_update = sources.into_iter().filter_map(|s| s.last_success).max();
    Ok(Json(hdhomerun::lineup_status(last_update)))
}

async fn device_xml(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let base = identity::base_url(&state.config.network, &headers);
    let xml = hdhomerun::device_xml(&state.config.network, &base);
    ([(header::CONTENT_TYPE, "application/xml")], xml)
}

// ---------------------------------------------------------------------
// Stream gateway (C8)
// ---------------------------------------------------------------------

/// A stream with at least this many recorded failures is escalated to
/// `EncodingProfile::high_reliability()` regardless of its own configured
/// profile (§4.7 "escalation event").
fn resolve_profile(channel: &Channel, stream: &UpstreamStream, config: &Config) -> EncodingProfile {
    if stream.failure_count >= config.streaming.escalation_failure_count {
        return EncodingProfile::high_reliability();
    }
    let raw = stream
        .encoding_profile
        .as_deref()
        .or(channel.encoding_profile.as_deref())
        .unwrap_or(&config.streaming.default_encoding_profile);
    match raw {
        "high_reliability" => EncodingProfile::high_reliability(),
        _ => EncodingProfile::default(),
    }
}

async fn stream_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let channel = resolve_channel(&state.db, &channel_id).await?;
    let channel_id = channel.id;
    if !channel.enabled {
        return Err(AppError::not_found("channel", channel_id.to_string()));
    }

    let stream = state
        .db
        .list_streams_for_channel(channel_id)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::not_found("stream", format!("for channel {channel_id}")))?;

    let profile = resolve_profile(&channel, &stream, &state.config);
    let client = client_kind_from_user_agent(
        headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()),
    );
    let gateway_config = GatewayConfig {
        encoder_binary: state.config.streaming.encoder_binary.clone(),
        reliability_threshold: state.config.streaming.reliability_threshold,
    };
    let stream_id = stream.id;

    let outcome = gateway::start_stream(
        state.http.clone(),
        state.sessions.clone(),
        channel_id,
        stream,
        profile,
        client,
        gateway_config,
    )
    .await;

    // §7 ErrUpstream: "Recorded in stream failure counters". Best-effort -
    // a failure to record the counter shouldn't mask the original error.
    let outcome = match outcome {
        Ok(outcome) => {
            if let Err(e) = state.db.record_stream_success(stream_id).await {
                tracing::warn!(stream = %stream_id, error = %e, "failed to record stream success");
            }
            outcome
        }
        Err(e @ AppError::Upstream { .. } | e @ AppError::Http(_) | e @ AppError::Encoder { .. }) => {
            if let Err(record_err) = state.db.record_stream_failure(stream_id).await {
                tracing::warn!(stream = %stream_id, error = %record_err, "failed to record stream failure");
            }
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CONNECTION, "close")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(outcome.body)
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(response)
}

// ---------------------------------------------------------------------
// EPG query/synthesis (C11)
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DaysQuery {
    days: Option<i64>,
}

fn is_android(headers: &HeaderMap) -> bool {
    crate::epg::is_android_user_agent(
        headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()),
    )
}

/// Effective day window and program cap for this request, trimmed for
/// Android clients per §6.
fn effective_window(
    config: &crate::config::EpgConfig,
    requested: Option<i64>,
    android: bool,
) -> (i64, Option<usize>) {
    let default_days = config.synthetic_fallback_days;
    let days = requested.unwrap_or(default_days).max(1);
    if android {
        (days.min(config.android_day_window), Some(config.android_program_cap))
    } else {
        (days, None)
    }
}

async fn epg_xmltv_all(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, AppError> {
    let channels = state.db.list_channels(false).await?;
    let (days, cap) = effective_window(&state.config.epg, None, is_android(&headers));
    let xml = state.epg.generate_xmltv(&channels, days, cap).await?;
    Ok(xmltv_response(xml))
}

async fn epg_xmltv_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    AppQuery(query): AppQuery<DaysQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let channel = resolve_channel(&state.db, &channel_id).await?;
    let (days, cap) = effective_window(&state.config.epg, query.days, is_android(&headers));
    let xml = state.epg.generate_xmltv(&[channel], days, cap).await?;
    Ok(xmltv_response(xml))
}

fn xmltv_response(xml: String) -> Response {
    ([(header::CONTENT_TYPE, "application/xml; charset=utf-8")], xml).into_response()
}

#[derive(Debug, Serialize)]
struct JsonProgram {
    id: String,
    title: String,
    subtitle: Option<String>,
    description: Option<String>,
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
    category: Option<String>,
}

impl From<crate::models::EpgProgram> for JsonProgram {
    fn from(p: crate::models::EpgProgram) -> Self {
        Self {
            id: p.id,
            title: p.title,
            subtitle: p.subtitle,
            description: p.description,
            start: p.start,
            end: p.end,
            category: p.category,
        }
    }
}

async fn epg_json_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    AppQuery(query): AppQuery<DaysQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<JsonProgram>>, AppError> {
    let channel = resolve_channel(&state.db, &channel_id).await?;
    let (days, cap) = effective_window(&state.config.epg, query.days, is_android(&headers));
    let now = chrono::Utc::now();
    let end = now + chrono::Duration::days(days);

    let mut by_channel = state.epg.range(&[channel.clone()], now, end).await?;
    let mut programs = by_channel.remove(&channel.id).unwrap_or_default();
    if let Some(cap) = cap {
        programs.truncate(cap);
    }

    Ok(Json(programs.into_iter().map(JsonProgram::from).collect()))
}

async fn epg_now(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<JsonProgram>, AppError> {
    let channel = resolve_channel(&state.db, &channel_id).await?;
    let program = state.epg.current(&channel).await?;
    Ok(Json(JsonProgram::from(program)))
}

async fn epg_next(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<Option<JsonProgram>>, AppError> {
    let channel = resolve_channel(&state.db, &channel_id).await?;
    let program = state.epg.next(&channel).await?.map(JsonProgram::from);
    Ok(Json(program))
}

#[derive(Debug, Deserialize)]
struct GridQuery {
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
    channels: Option<String>,
}

async fn epg_grid(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<GridQuery>,
) -> Result<Json<std::collections::HashMap<Uuid, Vec<JsonProgram>>>, AppError> {
    let all_channels = state.db.list_channels(false).await?;

    let selected: Vec<Channel> = match query.channels {
        Some(ids) => {
            let wanted: Vec<Uuid> = ids.split(',').filter_map(|s| Uuid::parse_str(s.trim()).ok()).collect();
            all_channels.into_iter().filter(|c| wanted.contains(&c.id)).collect()
        }
        None => all_channels,
    };

    let by_channel = state.epg.range(&selected, query.start, query.end).await?;
    let result = by_channel
        .into_iter()
        .map(|(id, programs)| (id, programs.into_iter().map(JsonProgram::from).collect()))
        .collect();

    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    limit: Option<i64>,
}

async fn epg_search(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<SearchQuery>,
) -> Result<Json<Vec<JsonProgram>>, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let programs = state.epg.search(&query.q, limit).await?;
    Ok(Json(programs.into_iter().map(JsonProgram::from).collect()))
}

// ---------------------------------------------------------------------
// EPG source administration & scheduler debug surface
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateEpgSourceRequest {
    name: String,
    url: String,
    refresh_interval: String,
    #[serde(default = "default_true")]
    enabled: bool,
    category: Option<String>,
    secondary_genres: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

async fn create_epg_source(
    State(state): State<AppState>,
    AppJson(request): AppJson<CreateEpgSourceRequest>,
) -> Result<Json<crate::models::EpgSource>, AppError> {
    let now = chrono::Utc::now();
    let source = crate::models::EpgSource {
        id: Uuid::new_v4(),
        name: request.name,
        url: request.url,
        refresh_interval: request.refresh_interval,
        enabled: request.enabled,
        last_refresh: None,
        last_success: None,
        last_error: None,
        category: request.category,
        secondary_genres: request.secondary_genres.map(|g| serde_json::to_string(&g).unwrap_or_default()),
        created_at: now,
        updated_at: now,
    };
    let created = state.db.create_epg_source(source).await?;
    Ok(Json(created))
}

async fn delete_epg_source(State(state): State<AppState>, AppPath(id): AppPath<Uuid>) -> Result<StatusCode, AppError> {
    state.db.delete_epg_source(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn force_refresh(
    State(state): State<AppState>,
    AppPath(id): AppPath<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let outcome = state.scheduler.force_refresh(id).await?;
    Ok(Json(json!({
        "channels_written": outcome.channels_written,
        "programs_written": outcome.programs_written,
    })))
}

#[derive(Debug, Serialize)]
struct JobInfoResponse {
    source_id: Uuid,
    source_name: String,
    refresh_interval: String,
    next_run: Option<chrono::DateTime<chrono::Utc>>,
    last_refresh: Option<chrono::DateTime<chrono::Utc>>,
    last_success: Option<chrono::DateTime<chrono::Utc>>,
    last_error: Option<String>,
}

impl From<crate::ingestor::scheduler::JobInfo> for JobInfoResponse {
    fn from(job: crate::ingestor::scheduler::JobInfo) -> Self {
        Self {
            source_id: job.source_id,
            source_name: job.source_name,
            refresh_interval: job.refresh_interval,
            next_run: job.next_run,
            last_refresh: job.last_refresh,
            last_success: job.last_success,
            last_error: job.last_error,
        }
    }
}

async fn debug_jobs(State(state): State<AppState>) -> Json<Vec<JobInfoResponse>> {
    let jobs = state.scheduler.jobs().await;
    Json(jobs.into_iter().map(JobInfoResponse::from).collect())
}

async fn debug_diagnose_all(State(state): State<AppState>) -> Json<Vec<JobInfoResponse>> {
    let jobs = state.scheduler.diagnose(None).await;
    Json(jobs.into_iter().map(JobInfoResponse::from).collect())
}

async fn debug_diagnose_one(State(state): State<AppState>, AppPath(id): AppPath<Uuid>) -> Json<Vec<JobInfoResponse>> {
    let jobs = state.scheduler.diagnose(Some(id)).await;
    Json(jobs.into_iter().map(JobInfoResponse::from).collect())
}

// ---------------------------------------------------------------------
// Stream admin/debug endpoints
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PreviewQuery {
    #[serde(default)]
    transcode: bool,
}

/// Admin/browser preview of a single stream, bypassing the session
/// manager entirely - this isn't a Plex play endpoint and shouldn't count
/// against the concurrency caps (§6 "admin/browser").
async fn stream_preview(
    State(state): State<AppState>,
    AppPath(stream_id): AppPath<Uuid>,
    AppQuery(query): AppQuery<PreviewQuery>,
) -> Result<Response, AppError> {
    let stream = state
        .db
        .get_stream(stream_id)
        .await?
        .ok_or_else(|| AppError::not_found("stream", stream_id.to_string()))?;

    if query.transcode {
        let mut profile = EncodingProfile::default();
        profile.container = crate::models::ContainerMode::Mp4;
        let (encoder, stdout) =
            EncoderProcess::spawn(&state.config.streaming.encoder_binary, &profile, &stream.url)?;
        let reader = tokio_util::io::ReaderStream::new(stdout);
        let body = axum::body::Body::from_stream(reader);
        tokio::spawn(async move {
            // kept alive only long enough to hand its stdout to the body
            // stream; `kill_on_drop` on the child handles abandonment.
            tokio::time::sleep(std::time::Duration::from_secs(600)).await;
            encoder.shutdown(std::time::Duration::from_secs(2)).await;
        });
        return Ok(([(header::CONTENT_TYPE, "video/mp4")], body).into_response());
    }

    let response = state
        .http
        .get(&stream.url)
        .send()
        .await
        .map_err(|e| AppError::upstream(format!("preview request failed: {e}")))?;
    if !response.status().is_success() {
        return Err(AppError::upstream(format!("upstream returned {}", response.status())));
    }
    let body = axum::body::Body::from_stream(response.bytes_stream());
    Ok(([(header::CONTENT_TYPE, "video/mp2t")], body).into_response())
}

#[derive(Debug, Serialize)]
struct ActiveStreamsResponse {
    active_sessions: usize,
}

async fn streams_active(State(state): State<AppState>) -> Json<ActiveStreamsResponse> {
    Json(ActiveStreamsResponse { active_sessions: state.sessions.active_count().await })
}
