use std::{fmt, io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{ack::AckId, config::RecordEncoding};

pub type IngestResult<T> = Result<T, IngestError>;

/// Errors surfaced by the ingestion stream, either directly from a call or through a failed
/// acknowledgment handle.
#[derive(Debug, Clone, Error)]
pub enum IngestError {
    #[error("record payload must not be empty")]
    EmptyRecord,
    #[error("record is not well-formed JSON: {0}")]
    MalformedJson(String),
    #[error("stream accepts {expected} records but received a {actual} record")]
    EncodingMismatch {
        expected: RecordEncoding,
        actual: RecordEncoding,
    },
    #[error("table name must not be empty")]
    EmptyTableName,
    #[error("binary streams require a schema descriptor")]
    MissingDescriptor,
    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("credential provider failed: {0}")]
    Headers(#[from] HeadersError),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: TimeoutKind,
        after: Duration,
    },
    #[error("record {ack_id} was in flight when its session failed: {cause}")]
    InFlightLost {
        ack_id: AckId,
        cause: Box<IngestError>,
    },
    #[error("server requested stream close{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    ServerClosing { reason: Option<String> },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("stream is closed")]
    StreamClosed,
    #[error("stream permanently failed: {cause}")]
    PermanentlyFailed { cause: Box<IngestError> },
    #[error("no pending acknowledgment with id {0}")]
    UnknownAck(AckId),
}

/// Coarse classification used by callers layering their own retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Transport,
    Authentication,
    Schema,
    Timeout,
    Closed,
    Internal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Flush,
    RecoveryAttempt,
    ServerAck,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutKind::Flush => "flush",
            TimeoutKind::RecoveryAttempt => "recovery attempt",
            TimeoutKind::ServerAck => "server acknowledgment",
        })
    }
}

impl IngestError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestError::EmptyRecord
            | IngestError::MalformedJson(_)
            | IngestError::EncodingMismatch { .. }
            | IngestError::EmptyTableName
            | IngestError::MissingDescriptor
            | IngestError::InvalidConfig(_) => ErrorCategory::Validation,
            IngestError::Channel(err) => err.kind.category(),
            IngestError::Headers(_) => ErrorCategory::Authentication,
            IngestError::Timeout { .. } => ErrorCategory::Timeout,
            IngestError::InFlightLost { .. }
            | IngestError::ServerClosing { .. }
            | IngestError::Protocol(_) => ErrorCategory::Transport,
            IngestError::StreamClosed | IngestError::PermanentlyFailed { .. } => {
                ErrorCategory::Closed
            }
            IngestError::UnknownAck(_) => ErrorCategory::Internal,
        }
    }

    /// Whether resubmitting (or reconnecting) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Channel(err) => err.is_retryable(),
            IngestError::Headers(err) => err.retryable,
            IngestError::Timeout { .. }
            | IngestError::InFlightLost { .. }
            | IngestError::ServerClosing { .. }
            | IngestError::Protocol(_) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, IngestError::Timeout { .. })
    }
}

/// Status reported by a channel implementation, modelled on gRPC status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelErrorKind {
    Unavailable,
    ConnectionReset,
    DeadlineExceeded,
    Overloaded,
    Aborted,
    Unauthenticated,
    PermissionDenied,
    SchemaMismatch,
    InvalidArgument,
    NotFound,
    Internal,
}

impl ChannelErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ChannelErrorKind::Unavailable
                | ChannelErrorKind::ConnectionReset
                | ChannelErrorKind::DeadlineExceeded
                | ChannelErrorKind::Overloaded
                | ChannelErrorKind::Aborted
        )
    }

    fn category(self) -> ErrorCategory {
        match self {
            ChannelErrorKind::Unavailable
            | ChannelErrorKind::ConnectionReset
            | ChannelErrorKind::DeadlineExceeded
            | ChannelErrorKind::Overloaded
            | ChannelErrorKind::Aborted => ErrorCategory::Transport,
            ChannelErrorKind::Unauthenticated | ChannelErrorKind::PermissionDenied => {
                ErrorCategory::Authentication
            }
            ChannelErrorKind::SchemaMismatch
            | ChannelErrorKind::InvalidArgument
            | ChannelErrorKind::NotFound => ErrorCategory::Schema,
            ChannelErrorKind::Internal => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ChannelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelErrorKind::Unavailable => "unavailable",
            ChannelErrorKind::ConnectionReset => "connection reset",
            ChannelErrorKind::DeadlineExceeded => "deadline exceeded",
            ChannelErrorKind::Overloaded => "overloaded",
            ChannelErrorKind::Aborted => "aborted",
            ChannelErrorKind::Unauthenticated => "unauthenticated",
            ChannelErrorKind::PermissionDenied => "permission denied",
            ChannelErrorKind::SchemaMismatch => "schema mismatch",
            ChannelErrorKind::InvalidArgument => "invalid argument",
            ChannelErrorKind::NotFound => "not found",
            ChannelErrorKind::Internal => "internal",
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ChannelError {
    pub kind: ChannelErrorKind,
    pub message: String,
}

impl ChannelError {
    pub fn new(kind: ChannelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Failure to obtain handshake headers. Non-retryable unless built with [`HeadersError::retryable`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HeadersError {
    pub message: String,
    pub retryable: bool,
}

impl HeadersError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Errors raised while loading a [`crate::StreamConfiguration`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to decode stream configuration: {0}")]
    Decode(#[source] toml::de::Error),
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}
