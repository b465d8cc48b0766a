use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    #[error("UnsupportedVersion: no image known for {component} at version {version}")]
    UnsupportedVersion { component: String, version: String },

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("DecodingError: {0}")]
    DecodingError(String),

    #[error("HttpError: {0}")]
    HttpError(String),

    #[error("RemoteError: status {status}: {body}")]
    RemoteError { status: u16, body: String },
}

impl StdError {
    pub fn metric_label(&self) -> String {
        let label = format!("{self:?}");
        label
            .split(['(', ' ', '{'])
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }

    /// Transient errors are worth retrying without any change to the spec.
    pub fn is_transient(&self) -> bool {
        match self {
            StdError::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            StdError::KubeError(_) => true,
            StdError::HttpError(_) => true,
            StdError::RemoteError { status, .. } => *status == 429 || *status >= 500,
            StdError::FinalizerError(inner) => match inner.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(e)
                | kube::runtime::finalizer::Error::CleanupFailed(e) => e.is_transient(),
                _ => true,
            },
            _ => false,
        }
    }

    /// Conflicts only mean the resource version moved underneath us.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StdError::KubeError(kube::Error::Api(resp)) if resp.code == 409)
    }
}

impl From<kube::Error> for StdError {
    fn from(e: kube::Error) -> Self {
        StdError::KubeError(e)
    }
}

impl From<serde_json::Error> for StdError {
    fn from(e: serde_json::Error) -> Self {
        StdError::JsonSerializationError(e)
    }
}

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
        write!(f, "{}", self.error)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
        }
    }

    pub fn inner(&self) -> &StdError {
        match self {
            Error::StdError(e) => e,
            Error::ErrorWithRequeue(e) => &e.error,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Error::StdError(e) => e.is_transient(),
            Error::ErrorWithRequeue(_) => true,
        }
    }

    /// Condition reason for a failure during `stage`, e.g. `ApplyProjectError`.
    pub fn reason(&self, stage: &str) -> String {
        format!("{stage}Error")
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::ErrorWithRequeue(e) => Some(e.duration),
            Error::StdError(_) => None,
        }
    }

    pub fn with_requeue(error: StdError, duration: Duration) -> Error {
        Error::ErrorWithRequeue(ErrorWithRequeue::new(error, duration))
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

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Returns `Ok(None)` for a 404 from the API server.
pub fn ignore_not_found<T>(res: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}
