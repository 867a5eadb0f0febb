//! Error types for the controller and its backend drivers.

use std::fmt;
use std::time::Duration;

use lbsync_reconcile::ReconcileError;
use thiserror::Error;

/// The kind of routing object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Pool,
    Member,
    Route,
    Monitor,
    VirtualEndpoint,
    Job,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::Pool => "pool",
            ObjectKind::Member => "member",
            ObjectKind::Route => "route",
            ObjectKind::Monitor => "monitor",
            ObjectKind::VirtualEndpoint => "virtual endpoint",
            ObjectKind::Job => "job",
        };
        f.write_str(s)
    }
}

/// Controller and driver errors.
///
/// `AlreadyExists`, `NotFound`, `InvalidReference` and `InUse` are raised by
/// the controller before any backend call is made. Everything else comes out
/// of a backend call and may leave the backend partially changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LbError {
    /// The object is already known to the controller or the backend.
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ObjectKind, name: String },

    /// The object does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: ObjectKind, name: String },

    /// An operation referenced an object that does not exist.
    #[error("{kind} {name} referenced by {referrer} does not exist")]
    InvalidReference {
        kind: ObjectKind,
        name: String,
        referrer: String,
    },

    /// A pool cannot be deleted while a route still points at it.
    #[error("pool {pool} is still referenced by route {route}")]
    InUse { pool: String, route: String },

    /// The backend could not be reached or refused the session.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend answered with an unexpected status.
    #[error("backend rejected {operation} (status={status}): {body}")]
    BackendRejected {
        operation: String,
        status: u16,
        body: String,
    },

    /// The backend answered with something the driver cannot interpret.
    #[error("invalid backend response to {operation}: {detail}")]
    InvalidResponse { operation: String, detail: String },

    /// An asynchronous job ended in failure.
    #[error("job {job_id} failed")]
    JobFailed { job_id: String },

    /// An asynchronous job did not finish within the wait budget.
    #[error("job {job_id} still pending after {elapsed:?}")]
    JobTimeout { job_id: String, elapsed: Duration },
}

impl LbError {
    pub fn already_exists(kind: ObjectKind, name: impl Into<String>) -> Self {
        LbError::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn not_found(kind: ObjectKind, name: impl Into<String>) -> Self {
        LbError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid_reference(
        kind: ObjectKind,
        name: impl Into<String>,
        referrer: impl Into<String>,
    ) -> Self {
        LbError::InvalidReference {
            kind,
            name: name.into(),
            referrer: referrer.into(),
        }
    }

    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            LbError::AlreadyExists { .. } => "already_exists",
            LbError::NotFound { .. } => "not_found",
            LbError::InvalidReference { .. } => "invalid_reference",
            LbError::InUse { .. } => "in_use",
            LbError::BackendUnavailable(_) => "backend_unavailable",
            LbError::BackendRejected { .. } => "backend_rejected",
            LbError::InvalidResponse { .. } => "invalid_response",
            LbError::JobFailed { .. } => "job_failed",
            LbError::JobTimeout { .. } => "job_timeout",
        }
    }

    /// Returns true for pre-check failures raised before any backend call.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            LbError::AlreadyExists { .. }
                | LbError::NotFound { .. }
                | LbError::InvalidReference { .. }
                | LbError::InUse { .. }
        )
    }
}

impl From<ReconcileError> for LbError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::JobFailed { job_id } => LbError::JobFailed { job_id },
            ReconcileError::JobTimeout { job_id, elapsed } => {
                LbError::JobTimeout { job_id, elapsed }
            }
        }
    }
}

impl From<reqwest::Error> for LbError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return LbError::InvalidResponse {
                operation: err
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|| "request".to_string()),
                detail: err.to_string(),
            };
        }
        LbError::BackendUnavailable(err.to_string())
    }
}
