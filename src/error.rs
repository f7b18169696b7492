//! Error types for discovery, retry and ingestion.

use serde_json::Value;
use std::io;
use thiserror::Error;

/// Structured error detail parsed from a storage or token endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Numeric code reported inside the error object, if any.
    pub code: Option<u16>,
    /// Short message (`error.message` for storage, `error` for token endpoints).
    pub message: Option<String>,
    /// Long form description, only reported by OAuth token endpoints.
    pub description: Option<String>,
}

/// A failed remote call, normalised away from any particular client library.
///
/// The retry classifier only ever sees this type, so any backend that can
/// describe its failures this way gets the same retry behaviour.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteFailure {
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {}", http_summary(.detail, .body))]
    Http {
        status: u16,
        body: Option<String>,
        detail: Option<ErrorDetail>,
    },

    /// The request never produced a response (DNS, connect, reset, truncated body).
    #[error("transport error: {0}")]
    Transport(String),

    /// Anything that did not come from the remote API itself.
    #[error("{0}")]
    Other(String),
}

fn http_summary(detail: &Option<ErrorDetail>, body: &Option<String>) -> String {
    detail
        .as_ref()
        .and_then(|d| d.description.clone().or_else(|| d.message.clone()))
        .or_else(|| body.clone())
        .unwrap_or_else(|| "<empty body>".to_string())
}

fn parse_detail(map: &serde_json::Map<String, Value>) -> ErrorDetail {
    match map.get("error") {
        Some(Value::Object(inner)) => ErrorDetail {
            code: inner
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok()),
            message: inner
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            description: None,
        },
        other => ErrorDetail {
            code: None,
            message: other.and_then(Value::as_str).map(str::to_string),
            description: map
                .get("error_description")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
    }
}

impl RemoteFailure {
    /// Builds an HTTP failure from a storage API status code and raw body.
    ///
    /// Structured detail is only kept when the body is a JSON object carrying
    /// `error` (nested under it for storage responses) or a top-level
    /// `error_description`. Any other body is kept as opaque text.
    pub fn from_response(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if body.trim().is_empty() {
            return RemoteFailure::Http {
                status,
                body: None,
                detail: None,
            };
        }

        let detail = match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(map))
                if map.contains_key("error") || map.contains_key("error_description") =>
            {
                Some(parse_detail(&map))
            }
            _ => None,
        };

        RemoteFailure::Http {
            status,
            body: Some(body),
            detail,
        }
    }

    /// Builds an HTTP failure from an OAuth token endpoint response.
    ///
    /// Token endpoint failures always carry detail, empty when the body is
    /// not a JSON object, so a 4xx from them is never mistaken for an
    /// unexplained storage hiccup.
    pub fn from_token_response(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let detail = match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(map)) => parse_detail(&map),
            _ => ErrorDetail::default(),
        };

        RemoteFailure::Http {
            status,
            body: Some(body).filter(|b| !b.trim().is_empty()),
            detail: Some(detail),
        }
    }

    /// HTTP status of the failure, if it has one.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteFailure::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors that can occur while planning or running an ingestion.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Missing, contradictory or invalid configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// A remote call failed fatally or ran out of retries.
    #[error("{operation} gave up after {attempts} attempt(s): {source}")]
    GiveUp {
        operation: String,
        attempts: u32,
        #[source]
        source: RemoteFailure,
    },

    /// A caller-imposed deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An encoded file list could not be decoded.
    #[error("failed to decode file list: {0}")]
    Decode(String),

    /// Streamed bytes did not match the checksum reported by the backend.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    /// A single task failed during dispatch.
    #[error("task {index} failed: {source}")]
    Task {
        index: usize,
        #[source]
        source: Box<IngestError>,
    },

    /// The control returned a different number of reports than tasks.
    #[error("expected {expected} task report(s), got {actual}")]
    ReportCount { expected: usize, actual: usize },

    /// The task runtime itself failed (join error, closed semaphore).
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// Configuration source could not be read or extracted.
    #[error(transparent)]
    FigmentError(#[from] Box<figment::Error>),

    /// `path_match_pattern` is not a valid regular expression.
    #[error(transparent)]
    RegexError(#[from] regex::Error),
}

impl From<figment::Error> for IngestError {
    fn from(err: figment::Error) -> Self {
        IngestError::FigmentError(Box::new(err))
    }
}
