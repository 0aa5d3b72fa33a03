use atrium_repo::Cid;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::syntax::{Did, Handle, SyntaxError};

/// Why a handle could not be resolved to a DID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleFailure {
    #[error("neither DNS nor HTTPS returned a DID")]
    NoAnswer,
    #[error("DNS returned {dns} but HTTPS returned {https}")]
    Conflict { dns: Did, https: Did },
}

/// Errors raised while resolving identities or fetching repository data.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    InvalidIdentifier(#[from] SyntaxError),
    #[error("could not resolve DID from handle {handle}: {reason}")]
    HandleResolutionFailed {
        handle: Handle,
        reason: HandleFailure,
    },
    #[error("unsupported DID method: {0}")]
    UnsupportedDidMethod(String),
    #[error("could not resolve DID document for {0}")]
    DidDocumentNotFound(Did),
    #[error("malformed DID document for {did}: {reason}")]
    MalformedDocument { did: Did, reason: String },
    #[error("no PDS service in DID document for {0}")]
    NoPdsService(Did),
    #[error("request failed ({status}): {body}")]
    RecordFetchFailed { status: StatusCode, body: String },
    #[error(transparent)]
    VerificationFailed(#[from] VerificationError),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("network error: {0}")]
    Network(String),
}

impl ResolveError {
    /// The HTTP status this error should be reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidIdentifier(_) | Self::UnsupportedDidMethod(_) => StatusCode::BAD_REQUEST,
            Self::HandleResolutionFailed { .. }
            | Self::DidDocumentNotFound(_)
            | Self::NoPdsService(_) => StatusCode::NOT_FOUND,
            Self::RecordFetchFailed { status, .. } if *status == StatusCode::NOT_FOUND => {
                StatusCode::NOT_FOUND
            }
            Self::RecordFetchFailed { .. }
            | Self::MalformedDocument { .. }
            | Self::VerificationFailed(_)
            | Self::Network(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// A short machine-readable name for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier(_) => "InvalidIdentifier",
            Self::HandleResolutionFailed { .. } => "HandleResolutionFailed",
            Self::UnsupportedDidMethod(_) => "UnsupportedDidMethod",
            Self::DidDocumentNotFound(_) => "DidDocumentNotFound",
            Self::MalformedDocument { .. } => "MalformedDocument",
            Self::NoPdsService(_) => "NoPdsService",
            Self::RecordFetchFailed { .. } => "RecordFetchFailed",
            Self::VerificationFailed(_) => "VerificationFailed",
            Self::Timeout(_) => "Timeout",
            Self::Network(_) => "Network",
        }
    }
}

/// Reasons a record proof fails to verify.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("malformed CAR: {0}")]
    MalformedCar(String),
    #[error("block hash mismatch")]
    HashMismatch,
    #[error("unsupported hash function {code:#x} for {cid}")]
    UnsupportedHash { cid: Cid, code: u64 },
    #[error("missing block {0}")]
    MissingBlock(Cid),
    #[error("malformed block {cid}: {reason}")]
    MalformedBlock { cid: Cid, reason: String },
    #[error("malformed tree node {cid}: {reason}")]
    MalformedTree { cid: Cid, reason: String },
    #[error("commit is for {actual}, expected {expected}")]
    DidMismatch { expected: String, actual: String },
    #[error("unsupported commit version {0}")]
    UnsupportedVersion(u64),
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("bad commit signature: {0}")]
    BadSignature(String),
    #[error("record {0} not found in proof")]
    RecordNotFound(String),
    #[error("record CID mismatch: proof has {proof}, record has {record}")]
    CidMismatch { proof: Cid, record: Cid },
}

/// JSON error body returned by the HTTP API.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// `axum`-compatible error handler.
#[derive(Error)]
pub struct Error {
    status: StatusCode,
    kind: &'static str,
    err: anyhow::Error,
}

impl Error {
    pub fn with_status(status: StatusCode, err: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            kind: "InvalidRequest",
            err: err.into(),
        }
    }
}

impl From<ResolveError> for Error {
    fn from(err: ResolveError) -> Self {
        Self {
            status: err.status(),
            kind: err.kind(),
            err: err.into(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "InternalServerError",
            err,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.status, self.err)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.err.fmt(f)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{:?}", self.err);
        } else {
            warn!("{}", self.err);
        }

        // N.B: Internal errors may carry details about the host, so only forward them out
        // in debug builds. Resolution errors describe the remote identity and are always shown.
        let message = if self.status == StatusCode::INTERNAL_SERVER_ERROR && !cfg!(debug_assertions)
        {
            String::new()
        } else {
            format!("{:#}", self.err)
        };

        (
            self.status,
            Json(ErrorBody {
                error: self.kind,
                message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let did = Did::new("did:plc:abc123").unwrap();
        assert_eq!(
            ResolveError::NoPdsService(did.clone()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ResolveError::Timeout("DID resolution").status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ResolveError::RecordFetchFailed {
                status: StatusCode::NOT_FOUND,
                body: String::new()
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ResolveError::RecordFetchFailed {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: String::new()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ResolveError::from(SyntaxError::Handle("nope".to_owned())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn handle_failure_message() {
        let err = ResolveError::HandleResolutionFailed {
            handle: Handle::new("alice.example.com").unwrap(),
            reason: HandleFailure::Conflict {
                dns: Did::new("did:plc:abc123").unwrap(),
                https: Did::new("did:plc:xyz999").unwrap(),
            },
        };
        assert_eq!(
            err.to_string(),
            "could not resolve DID from handle alice.example.com: \
             DNS returned did:plc:abc123 but HTTPS returned did:plc:xyz999"
        );
        assert_eq!(err.kind(), "HandleResolutionFailed");
    }
}
