use std::error::Error as StdError;
use std::fmt::{self, Formatter};
use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use convert_case::{Case, Casing};
use serde_json::json;

/// Closed taxonomy of domain-level failures, per the error handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidRequest,
    ArchiveEscape,
    UnsupportedEntryType,
    OutputMissing,
    CloneFailed,
    BuildFailed,
    RuntimeUnreachable,
    ImagePullError,
    ContainerCreateError,
    ContainerStartError,
    RuntimeError,
    StoreError,
    AssetsMissing,
    InconsistencyWarning,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_case(Case::Snake))
    }
}

/// A domain error carrying its [`ErrorKind`] plus, where available, the
/// underlying cause. Safe to hand back to an HTTP caller: `IntoResponse`
/// never leaks the wrapped source, only the kind-derived message.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    exit_code: Option<i64>,
}

impl Error {
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            source: None,
            exit_code: None,
        }
    }

    pub fn source<E: StdError + Send + Sync + 'static>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            source: Some(Box::new(err)),
            exit_code: None,
        }
    }

    pub fn custom<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(io::Error::new(
                io::ErrorKind::Other,
                message.as_ref().to_string(),
            ))),
            exit_code: None,
        }
    }

    /// `BuildFailed{exitCode}` per spec §7: an ordinary pipeline outcome,
    /// not an orchestration fault.
    pub fn build_failed(code: i64) -> Self {
        Self {
            kind: ErrorKind::BuildFailed,
            source: None,
            exit_code: Some(code),
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        self.kind
    }

    /// Exit code carried by [`ErrorKind::BuildFailed`], if any.
    pub fn exit_code(&self) -> Option<i64> {
        self.exit_code
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            source: None,
            exit_code: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match self.kind {
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not found"),
            ErrorKind::Conflict => (StatusCode::CONFLICT, "slug already in use"),
            ErrorKind::InvalidRequest => (StatusCode::BAD_REQUEST, "invalid request"),
            ErrorKind::ArchiveEscape => (StatusCode::BAD_REQUEST, "archive entry escapes target directory"),
            ErrorKind::UnsupportedEntryType => (StatusCode::BAD_REQUEST, "unsupported entry type in source tree"),
            ErrorKind::OutputMissing => (StatusCode::BAD_REQUEST, "output directory not found"),
            ErrorKind::CloneFailed => (StatusCode::BAD_REQUEST, "git clone failed"),
            ErrorKind::BuildFailed => (StatusCode::OK, "build command exited non-zero"),
            ErrorKind::RuntimeUnreachable => (StatusCode::SERVICE_UNAVAILABLE, "container runtime unreachable"),
            ErrorKind::ImagePullError => (StatusCode::INTERNAL_SERVER_ERROR, "failed to pull image"),
            ErrorKind::ContainerCreateError => (StatusCode::INTERNAL_SERVER_ERROR, "failed to create container"),
            ErrorKind::ContainerStartError => (StatusCode::INTERNAL_SERVER_ERROR, "failed to start container"),
            ErrorKind::RuntimeError => (StatusCode::INTERNAL_SERVER_ERROR, "container runtime error"),
            ErrorKind::StoreError => (StatusCode::INTERNAL_SERVER_ERROR, "state store error"),
            ErrorKind::AssetsMissing => (StatusCode::CONFLICT, "asset directory missing for redeploy"),
            ErrorKind::InconsistencyWarning => (StatusCode::OK, "container live but status update failed"),
            ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
