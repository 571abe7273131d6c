use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::backend::BackendError;

/// Closed taxonomy of failure codes surfaced by this crate.
///
/// Backend-native errors are always mapped onto one of these codes before
/// they become observable; callers never see a raw backend error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    PermissionDenied,
    NotFound,
    Unavailable,
    DeadlineExceeded,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    DataLoss,
    Cancelled,
    Unknown,
    CollectionUnavailable,
    ReferenceUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "livequery/permission-denied",
            ErrorCode::NotFound => "livequery/not-found",
            ErrorCode::Unavailable => "livequery/unavailable",
            ErrorCode::DeadlineExceeded => "livequery/deadline-exceeded",
            ErrorCode::Unauthenticated => "livequery/unauthenticated",
            ErrorCode::ResourceExhausted => "livequery/resource-exhausted",
            ErrorCode::FailedPrecondition => "livequery/failed-precondition",
            ErrorCode::Aborted => "livequery/aborted",
            ErrorCode::OutOfRange => "livequery/out-of-range",
            ErrorCode::Unimplemented => "livequery/unimplemented",
            ErrorCode::Internal => "livequery/internal",
            ErrorCode::DataLoss => "livequery/data-loss",
            ErrorCode::Cancelled => "livequery/cancelled",
            ErrorCode::Unknown => "livequery/unknown",
            ErrorCode::CollectionUnavailable => "livequery/collection-unavailable",
            ErrorCode::ReferenceUnavailable => "livequery/reference-unavailable",
        }
    }

    /// Whether a manual retry of the failed operation is sensible.
    ///
    /// This is a static property of the code. The library never retries on
    /// its own; the flag only informs callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable
                | ErrorCode::DeadlineExceeded
                | ErrorCode::ResourceExhausted
                | ErrorCode::Aborted
                | ErrorCode::Internal
        )
    }
}

/// A classified error carrying the code, a human-readable message, the
/// collection or document path it relates to, and the backend-native error
/// it was derived from (when there is one).
#[derive(Clone, Debug)]
pub struct LiveQueryError {
    code: ErrorCode,
    message: String,
    path: Option<String>,
    source: Option<BackendError>,
}

impl LiveQueryError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
            source: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// The backend-native error this classification was derived from.
    pub fn backend_source(&self) -> Option<&BackendError> {
        self.source.as_ref()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl Display for LiveQueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())?;
        if let Some(path) = &self.path {
            write!(f, " at '{path}'")?;
        }
        Ok(())
    }
}

impl Error for LiveQueryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|err| err as &(dyn Error + 'static))
    }
}

pub type LiveQueryResult<T> = Result<T, LiveQueryError>;

pub fn failed_precondition(message: impl Into<String>) -> LiveQueryError {
    LiveQueryError::new(ErrorCode::FailedPrecondition, message)
}

pub fn cancelled(message: impl Into<String>) -> LiveQueryError {
    LiveQueryError::new(ErrorCode::Cancelled, message)
}

pub fn internal_error(message: impl Into<String>) -> LiveQueryError {
    LiveQueryError::new(ErrorCode::Internal, message)
}

pub fn collection_unavailable(path: impl Into<String>) -> LiveQueryError {
    let path = path.into();
    LiveQueryError::new(
        ErrorCode::CollectionUnavailable,
        format!("collection '{path}' is unavailable"),
    )
    .with_path(path)
}

pub fn reference_unavailable(path: impl Into<String>) -> LiveQueryError {
    let path = path.into();
    LiveQueryError::new(
        ErrorCode::ReferenceUnavailable,
        format!("document reference '{path}' is unavailable"),
    )
    .with_path(path)
}

/// Maps a backend-native error onto the closed taxonomy.
///
/// Both `PERMISSION_DENIED` and `permission-denied` status spellings are
/// accepted; service prefixes such as `firestore/` are stripped first.
pub fn classify(error: BackendError, path: impl Into<String>) -> LiveQueryError {
    let code = code_for_status(error.status());
    LiveQueryError {
        code,
        message: error.message().to_string(),
        path: Some(path.into()),
        source: Some(error),
    }
}

fn code_for_status(status: &str) -> ErrorCode {
    let trimmed = status.rsplit('/').next().unwrap_or(status);
    let normalized = trimmed.replace('-', "_").to_ascii_uppercase();
    match normalized.as_str() {
        "PERMISSION_DENIED" => ErrorCode::PermissionDenied,
        "NOT_FOUND" => ErrorCode::NotFound,
        "UNAVAILABLE" => ErrorCode::Unavailable,
        "DEADLINE_EXCEEDED" => ErrorCode::DeadlineExceeded,
        "UNAUTHENTICATED" => ErrorCode::Unauthenticated,
        "RESOURCE_EXHAUSTED" => ErrorCode::ResourceExhausted,
        "FAILED_PRECONDITION" => ErrorCode::FailedPrecondition,
        "ABORTED" => ErrorCode::Aborted,
        "OUT_OF_RANGE" => ErrorCode::OutOfRange,
        "UNIMPLEMENTED" => ErrorCode::Unimplemented,
        "INTERNAL" | "INTERNAL_ERROR" => ErrorCode::Internal,
        "DATA_LOSS" => ErrorCode::DataLoss,
        "CANCELLED" => ErrorCode::Cancelled,
        "UNKNOWN" => ErrorCode::Unknown,
        "COLLECTION_UNAVAILABLE" => ErrorCode::CollectionUnavailable,
        "REFERENCE_UNAVAILABLE" => ErrorCode::ReferenceUnavailable,
        other => {
            log::debug!("unrecognized backend error status '{other}'");
            ErrorCode::Unknown
        }
    }
}
