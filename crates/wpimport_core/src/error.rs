use serde::Serialize;
use thiserror::Error;

use crate::model::ContentKind;

/// Failure while talking to the migration source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unavailable: {context}")]
    Unavailable {
        context: String,
        status: Option<u16>,
        timed_out: bool,
    },
    #[error("source returned malformed data: {context}")]
    Malformed { context: String },
}

impl SourceError {
    pub fn unavailable(context: impl Into<String>) -> Self {
        Self::Unavailable {
            context: context.into(),
            status: None,
            timed_out: false,
        }
    }

    pub fn timed_out(context: impl Into<String>) -> Self {
        Self::Unavailable {
            context: context.into(),
            status: None,
            timed_out: true,
        }
    }

    pub fn malformed(context: impl Into<String>) -> Self {
        Self::Malformed {
            context: context.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Unavailable { timed_out: true, .. })
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Unavailable { .. } => FailureReason::SourceUnavailable,
            Self::Malformed { .. } => FailureReason::SourceMalformed,
        }
    }
}

/// A source record that could not be turned into a normalized record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("required field `{field}` is missing")]
    MissingField { field: &'static str },
    #[error("field `{field}` has an unparsable date: {value:?}")]
    InvalidDate { field: &'static str, value: String },
    #[error("expected a {expected} record, got a {actual} record")]
    KindMismatch {
        expected: ContentKind,
        actual: ContentKind,
    },
}

/// Failure reported by the destination store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("write conflict: {message}")]
    Conflict { message: String },
    #[error("write rejected: {message}")]
    Rejected { message: String, timed_out: bool },
}

impl WriteError {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            timed_out: true,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Rejected { timed_out: true, .. })
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Conflict { .. } => FailureReason::WriteConflict,
            Self::Rejected { .. } => FailureReason::WriteRejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SourceUnavailable,
    SourceMalformed,
    MappingError,
    WriteConflict,
    WriteRejected,
    DependencyMissing,
    CancellationRequested,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceUnavailable => "source_unavailable",
            Self::SourceMalformed => "source_malformed",
            Self::MappingError => "mapping_error",
            Self::WriteConflict => "write_conflict",
            Self::WriteRejected => "write_rejected",
            Self::DependencyMissing => "dependency_missing",
            Self::CancellationRequested => "cancellation_requested",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::SourceUnavailable | Self::WriteConflict)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single record did not make it into the destination.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{description}: {message}")]
pub struct RecordFailure {
    pub kind: ContentKind,
    pub external_id: Option<u64>,
    pub description: String,
    pub reason: FailureReason,
    pub message: String,
}

impl RecordFailure {
    pub fn new(
        kind: ContentKind,
        external_id: Option<u64>,
        description: impl Into<String>,
        reason: FailureReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            external_id,
            description: description.into(),
            reason,
            message: message.into(),
        }
    }

    pub fn mapping(
        kind: ContentKind,
        external_id: u64,
        description: impl Into<String>,
        error: &MappingError,
    ) -> Self {
        Self::new(
            kind,
            Some(external_id),
            description,
            FailureReason::MappingError,
            error.to_string(),
        )
    }

    pub fn write(
        kind: ContentKind,
        external_id: u64,
        description: impl Into<String>,
        error: &WriteError,
    ) -> Self {
        Self::new(
            kind,
            Some(external_id),
            description,
            error.reason(),
            error.to_string(),
        )
    }
}
