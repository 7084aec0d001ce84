//! Stream gateway handler (C8). `GET /stream/{channel_id}` is Plex's play
//! endpoint; this module ties the session manager (C5), classifier (C6)
//! and encoder supervisor (C7) together into the single streaming
//! response body the web layer returns, following the same
//! stream-then-track idiom as the teacher's `proxy/http_stream.rs`
//! (`bytes_stream().map(...)` into `Body::from_stream`), but routed
//! through an mpsc channel so a client disconnect or an idle-sweep
//! cancellation can stop the relay loop without fighting axum's `Body`
//! for ownership of the upstream stream.

use std::path::PathBuf;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{EncodingProfile, Stream as UpstreamStream, UpstreamMode};
use crate::streaming::classify::{classify, ClassifyContext, ClientKind};
use crate::streaming::encoder::{null_packets, EncoderProcess};
use crate::streaming::session::SessionManager;

/// Upstream stream connect timeout, §4.8 step 4 default.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Encoder grace period on cancel, §4.7/§6 default.
const ENCODER_GRACE: Duration = Duration::from_secs(2);
/// A single deferred-start prologue burst: 200 null packets is ~37 KiB,
/// comfortably under the "few hundred KiB" ceiling in §4.7 while still
/// giving a slow-starting encoder a cushion before real packets arrive.
const DEFERRED_START_PACKET_COUNT: usize = 200;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub encoder_binary: PathBuf,
    pub reliability_threshold: f64,
}

pub struct GatewayOutcome {
    pub body: Body,
    pub mode: UpstreamMode,
}

/// Admits a session for `channel_id`, classifies `stream`, and opens the
/// chosen pipeline. On any failure after admission the session slot is
/// released before the error is returned — callers only see a bare
/// `Err` on the HTTP response path, the slot bookkeeping is handled here.
pub async fn start_stream(
    http_client: reqwest::Client,
    sessions: SessionManager,
    channel_id: Uuid,
    stream: UpstreamStream,
    profile: EncodingProfile,
    client: ClientKind,
    config: GatewayConfig,
) -> Result<GatewayOutcome, AppError> {
    let (handle, cancel) = sessions.admit(channel_id).await?;

    match open_pipeline(&http_client, &sessions, handle.id, cancel, &stream, &profile, client, &config).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            sessions.release(handle.id).await;
            Err(e)
        }
    }
}

async fn open_pipeline(
    http_client: &reqwest::Client,
    sessions: &SessionManager,
    session_id: Uuid,
    cancel: CancellationToken,
    stream: &UpstreamStream,
    profile: &EncodingProfile,
    client: ClientKind,
    config: &GatewayConfig,
) -> Result<GatewayOutcome, AppError> {
    // Best-effort HEAD probe for Content-Type; an unreachable or slow
    // upstream here just leaves the classifier without that signal
    // rather than failing the whole request early.
    let content_type = tokio::time::timeout(CONNECT_TIMEOUT, http_client.head(&stream.url).send())
        .await
        .ok()
        .and_then(|r| r.ok())
        .and_then(|r| {
            r.headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });

    let ctx = ClassifyContext {
        client,
        reliability_score: stream.reliability_score,
        reliability_threshold: config.reliability_threshold,
        content_type: content_type.as_deref(),
    };

    let mode = classify(http_client, &stream.url, stream.kind, &ctx).await?;

    let body = match mode {
        UpstreamMode::Direct | UpstreamMode::Remux => {
            relay_upstream(http_client, &stream.url, sessions.clone(), session_id, cancel).await?
        }
        UpstreamMode::Transcode => {
            relay_transcode(config, &stream.url, profile, sessions.clone(), session_id, cancel).await?
        }
    };

    Ok(GatewayOutcome { body, mode })
}

/// Direct-pass/remux relay: opens the upstream GET and forwards its body
/// chunk by chunk, marking the session alive on every non-empty chunk
/// (§4.8 step 5) and bailing out as soon as the client goes away or the
/// session is cancelled (idle sweep, explicit release).
async fn relay_upstream(
    client: &reqwest::Client,
    url: &str,
    sessions: SessionManager,
    session_id: Uuid,
    cancel: CancellationToken,
) -> Result<Body, AppError> {
    let response = tokio::time::timeout(CONNECT_TIMEOUT, client.get(url).send())
        .await
        .map_err(|_| AppError::upstream(format!("connect timeout opening {url}")))?
        .map_err(|e| AppError::upstream(format!("connect failed: {e}")))?;

    if !response.status().is_success() {
        return Err(AppError::upstream(format!("upstream returned {}", response.status())));
    }

    let mut upstream = response.bytes_stream();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = upstream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            if !bytes.is_empty() {
                                sessions.mark_byte(session_id).await;
                            }
                            if tx.send(Ok(bytes)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(std::io::Error::new(std::io::ErrorKind::Other, e))).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        sessions.release(session_id).await;
    });

    Ok(Body::from_stream(ReceiverStream::new(rx)))
}

/// Transcode relay: spawns the encoder, writes a short null-packet
/// prologue so slow-to-start clients don't time out (§4.7 deferred-start
/// keep-alive), then relays the encoder's stdout the same way
/// `relay_upstream` relays a direct pass. On cancel or natural EOF the
/// encoder is given `ENCODER_GRACE` to exit before being force-killed.
async fn relay_transcode(
    config: &GatewayConfig,
    url: &str,
    profile: &EncodingProfile,
    sessions: SessionManager,
    session_id: Uuid,
    cancel: CancellationToken,
) -> Result<Body, AppError> {
    let (encoder, stdout) = EncoderProcess::spawn(&config.encoder_binary, profile, url)?;
    let mut reader = ReaderStream::new(stdout);

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    let prologue = null_packets(DEFERRED_START_PACKET_COUNT);
    if tx.send(Ok(Bytes::from(prologue))).await.is_err() {
        encoder.shutdown(ENCODER_GRACE).await;
        sessions.release(session_id).await;
        return Ok(Body::from_stream(ReceiverStream::new(rx)));
    }

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = reader.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            if !bytes.is_empty() {
                                sessions.mark_byte(session_id).await;
                            }
                            if tx.send(Ok(bytes)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e)).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        encoder.shutdown(ENCODER_GRACE).await;
        sessions.release(session_id).await;
    });

    Ok(Body::from_stream(ReceiverStream::new(rx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_start_prologue_fits_the_few_hundred_kib_ceiling() {
        let prologue = null_packets(DEFERRED_START_PACKET_COUNT);
        assert!(prologue.len() < 100 * 1024);
    }
}
