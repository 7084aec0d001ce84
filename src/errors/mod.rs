//! Error type definitions for the HDHomeRun/XMLTV bridge.
//!
//! `AppError` is the single error type threaded through the store, the
//! stream gateway and the EPG engine. Handlers convert it to a response via
//! `IntoResponse`; per the operator-facing contract, every error response is
//! JSON, never an HTML error page.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Top-level application error type.
///
/// Each variant maps to one of the operator-visible error kinds: capacity,
/// not-found, upstream, encoder, parse, storage, config, cancelled.
#[derive(Error, Debug)]
pub enum AppError {
    /// No free tuner/session slot (global or per-channel cap reached).
    #[error("capacity exceeded: {message}")]
    Capacity { message: String },

    /// Requested channel, stream, or EPG entity does not exist.
    #[error("not found: {resource} {id}")]
    NotFound { resource: String, id: String },

    /// The upstream IPTV source refused the connection, timed out, or
    /// returned a non-success status.
    #[error("upstream error: {message}")]
    Upstream { message: String },

    /// The encoder process failed to start, exited unexpectedly, or could
    /// not be supervised.
    #[error("encoder error: {message}")]
    Encoder { message: String },

    /// A document (XMLTV, M3U, JSON) failed to parse.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The store (SQLite) failed a read or write.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Configuration is missing or malformed.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The operation was cancelled (client disconnect, shutdown).
    #[error("cancelled: {message}")]
    Cancelled { message: String },

    /// HTTP client errors bubbled up from `reqwest`.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// XML (de)serialization errors bubbled up from `quick-xml`.
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Generic internal errors that don't fit another kind.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn capacity<S: Into<String>>(message: S) -> Self {
        Self::Capacity { message: message.into() }
    }

    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound { resource: resource.into(), id: id.into() }
    }

    pub fn upstream<S: Into<String>>(message: S) -> Self {
        Self::Upstream { message: message.into() }
    }

    pub fn encoder<S: Into<String>>(message: S) -> Self {
        Self::Encoder { message: message.into() }
    }

    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse { message: message.into() }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::Cancelled { message: message.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// The stable, lowercase error kind, as surfaced in the JSON body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Capacity { .. } => "capacity",
            AppError::NotFound { .. } => "not_found",
            AppError::Upstream { .. } => "upstream",
            AppError::Encoder { .. } => "encoder",
            AppError::Parse { .. } => "parse",
            AppError::Storage(_) => "storage",
            AppError::Config { .. } => "config",
            AppError::Cancelled { .. } => "cancelled",
            AppError::Http(_) => "upstream",
            AppError::Xml(_) => "parse",
            AppError::Internal { .. } => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Capacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Upstream { .. } | AppError::Http(_) => StatusCode::BAD_GATEWAY,
            AppError::Encoder { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Parse { .. } | AppError::Xml(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            // 499 ("client closed request") isn't a named axum constant;
            // build it directly rather than inventing a new error kind.
            AppError::Cancelled { .. } => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        tracing::error!(kind, %self, "request failed");
        // §4.8 step 3 / §8 S3 require the capacity body to be exactly
        // `{error:"capacity"}` - the stable slug goes in `error`, with the
        // human-readable detail (which tuner/channel cap was hit) moved to
        // a separate field rather than dropped.
        let (error, detail) = match &self {
            AppError::Capacity { message } => ("capacity".to_string(), Some(message.clone())),
            _ => (self.to_string(), None),
        };
        (status, Json(ErrorBody { error, kind, detail })).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
