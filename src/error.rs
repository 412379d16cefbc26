use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error as ThisError;

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Stable error taxonomy shared by the library, the CLI and the HTTP
/// surfaces. Rendered as its snake_case code.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameter,
    SdkNotInitialized,
    FileNotFound,
    InvalidPath,
    InvalidName,
    AuthTicketDecodeError,
    TooManyRequests,
    TransientRpc,
    ConsensusNotReached,
    ConsensusFailed,
    CorruptedShards,
    WriteMarkerValidationFailed,
    TransactionSendError,
    TransactionVerifyError,
    Cancelled,
    Unauthorized,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TooManyRequests
                | ErrorKind::TransientRpc
                | ErrorKind::ConsensusNotReached
                | ErrorKind::TransactionSendError
                | ErrorKind::TransactionVerifyError
        )
    }

    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::InvalidParameter | ErrorKind::InvalidPath | ErrorKind::InvalidName => 2,
            ErrorKind::SdkNotInitialized => 3,
            ErrorKind::ConsensusNotReached
            | ErrorKind::ConsensusFailed
            | ErrorKind::CorruptedShards => 4,
            ErrorKind::TransactionSendError
            | ErrorKind::TransactionVerifyError
            | ErrorKind::WriteMarkerValidationFailed => 5,
            _ => 1,
        }
    }

    pub fn as_code(self) -> &'static str {
        self.into()
    }
}

#[derive(ThisError, Clone)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Cause>,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Wire envelope used on every transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub msg: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.kind.as_code().to_string(),
            msg: self.message.clone(),
        }
    }

    pub fn from_envelope(envelope: ErrorEnvelope) -> Self {
        let kind = envelope.code.parse().unwrap_or(ErrorKind::Internal);
        Self::new(kind, envelope.msg)
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameter, message)
    }

    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SdkNotInitialized, message)
    }

    pub fn file_not_found(path: impl fmt::Display) -> Self {
        Self::new(ErrorKind::FileNotFound, format!("no such object: {}", path))
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPath, message)
    }

    pub fn invalid_name(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidName, message)
    }

    pub fn auth_ticket(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthTicketDecodeError, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientRpc, message)
    }

    pub fn consensus_not_reached(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConsensusNotReached, message)
    }

    pub fn consensus_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConsensusFailed, message)
    }

    pub fn corrupted_shards(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CorruptedShards, message)
    }

    pub fn marker_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WriteMarkerValidationFailed, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Error");
        s.field("kind", &self.kind).field("message", &self.message);
        if let Some(cause) = &self.cause {
            s.field("cause", &cause.to_string());
        }
        s.finish()
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::TimedOut => ErrorKind::TransientRpc,
            _ => ErrorKind::Internal,
        };
        Error::new(kind, format!("io error: {}", err)).with_cause(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::internal(format!("json error: {}", err)).with_cause(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = match err.status() {
            Some(status) => ErrorKind::from_status(status.as_u16()),
            None if err.is_builder() => ErrorKind::InvalidParameter,
            None => ErrorKind::TransientRpc,
        };
        Error::new(kind, format!("http request failed: {}", err)).with_cause(err)
    }
}

impl From<reqwest::header::InvalidHeaderValue> for Error {
    fn from(err: reqwest::header::InvalidHeaderValue) -> Self {
        Error::invalid_parameter(format!("invalid header value: {}", err)).with_cause(err)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Error::transient("request timed out").with_cause(err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            return Error::cancelled();
        }
        Error::internal(format!("task failed: {}", err)).with_cause(err)
    }
}

impl ErrorKind {
    /// Classification of a non-2xx status returned by a blobber or sharder.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => ErrorKind::InvalidParameter,
            401 | 403 => ErrorKind::Unauthorized,
            404 => ErrorKind::FileNotFound,
            409 => ErrorKind::Conflict,
            429 => ErrorKind::TooManyRequests,
            408 | 500..=599 => ErrorKind::TransientRpc,
            _ => ErrorKind::Internal,
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidParameter
            | ErrorKind::InvalidPath
            | ErrorKind::InvalidName
            | ErrorKind::AuthTicketDecodeError => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::FileNotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::TooManyRequests => 429,
            ErrorKind::SdkNotInitialized => 503,
            ErrorKind::TransientRpc
            | ErrorKind::ConsensusNotReached
            | ErrorKind::TransactionSendError
            | ErrorKind::TransactionVerifyError => 502,
            _ => 500,
        }
    }
}
