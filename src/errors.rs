use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

/// The error taxonomy a reconcile step can return.
///
/// `NotFound`/`QuotaExceeded` carry enough structure for callers to branch on
/// without resorting to string matching; see `CloudError::is_quota_exceeded`
/// for the one place a status code still has to be inspected by value.
#[derive(Error, Debug)]
pub enum StdError {
    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("QuotaExceeded: {0}")]
    QuotaExceeded(String),

    #[error("Transient: {0}")]
    Transient(String),

    #[error("ValidationMismatch: {0}")]
    ValidationMismatch(String),

    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("KubeError: {0}")]
    KubeError(#[source] kube::Error),

    #[error("CloudError: {0}")]
    CloudError(#[source] CloudError),

    #[error("Internal: {0}")]
    Internal(String),
}

impl StdError {
    pub fn metric_label(&self) -> String {
        match self {
            StdError::NotFound(_) => "not_found".into(),
            StdError::QuotaExceeded(_) => "quota_exceeded".into(),
            StdError::Transient(_) => "transient".into(),
            StdError::ValidationMismatch(_) => "validation_mismatch".into(),
            StdError::JsonSerializationError(_) => "json_serialization".into(),
            StdError::KubeError(_) => "kube".into(),
            StdError::CloudError(_) => "cloud".into(),
            StdError::Internal(_) => "internal".into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StdError::NotFound(_))
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StdError::QuotaExceeded(_))
    }
}

/// Structured error returned by the cloud SslCertificate backend.
///
/// Preserves the backend's error codes so `is_quota_exceeded` can look for
/// `QUOTA_EXCEEDED` by value instead of matching on the message string.
#[derive(Error, Debug, Clone)]
#[error("cloud error ({codes:?}): {message}")]
pub struct CloudError {
    pub codes: Vec<String>,
    pub message: String,
    pub http_status: Option<u16>,
}

impl CloudError {
    pub fn new(message: impl Into<String>, codes: Vec<String>, http_status: Option<u16>) -> Self {
        CloudError {
            message: message.into(),
            codes,
            http_status,
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        self.codes.iter().any(|c| c == "QUOTA_EXCEEDED")
    }

    pub fn is_not_found(&self) -> bool {
        self.http_status == Some(404)
    }
}

/// An error paired with the delay a caller should wait before retrying.
#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (requeue after {:?})", self.error, self.duration)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    StdError(#[source] StdError),

    #[error("{0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::StdError(e) => e.is_not_found(),
            Error::ErrorWithRequeue(e) => e.error.is_not_found(),
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::ErrorWithRequeue(e) => Some(e.duration),
            Error::StdError(_) => None,
        }
    }
}

impl From<StdError> for Error {
    fn from(e: StdError) -> Self {
        Error::StdError(e)
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::StdError(StdError::KubeError(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::StdError(StdError::JsonSerializationError(e))
    }
}

impl From<CloudError> for Error {
    fn from(e: CloudError) -> Self {
        if e.is_not_found() {
            Error::StdError(StdError::NotFound(e.message))
        } else if e.is_quota_exceeded() {
            Error::StdError(StdError::QuotaExceeded(e.message))
        } else {
            Error::StdError(StdError::CloudError(e))
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
