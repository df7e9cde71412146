//! Error types for the stream consumer.
//!
//! The error taxonomy mirrors the recovery paths of batch processing:
//! extraction and task errors are always converted into tracking state and
//! never surface as invocation errors, while configuration and finalization
//! errors are fatal and escalate to the host so the batch is redelivered.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for the stream consumer.
///
/// Only a subset of these variants may ever escape an invocation (see
/// [`ConsumerError::is_fatal`]); the rest are recorded on task tracking
/// state and handled locally.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Missing or invalid configuration, detected eagerly at build time.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem
        message: String,
    },

    /// Malformed task definitions (e.g. duplicate task names).
    #[error("Task definition error: {message}")]
    TaskDefinition {
        /// Description of the definition problem
        message: String,
    },

    /// A record could not be converted into a message.
    ///
    /// Never fatal: the record is routed to the dead record queue instead.
    #[error("Extraction error: {message}")]
    Extraction {
        /// Description of the extraction failure
        message: String,
    },

    /// A discard or resubmit collaborator failed during finalization.
    ///
    /// Fatal: an un-finalized batch risks silent message loss, which is
    /// strictly worse than a duplicate full-batch replay.
    #[error("Finalization error: {message}")]
    Finalization {
        /// Description of the finalization failure
        message: String,
    },

    /// A write was attempted against frozen task tracking.
    ///
    /// Signals a programming error: a task executor writing after the
    /// invocation's deadline fired and tracking was finalized.
    #[error("Frozen state violation: {message}")]
    FrozenState {
        /// Description of the violating write
        message: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {message}")]
    SerDes {
        /// Description of the serialization failure
        message: String,
    },

    /// Internal orchestration defect (e.g. a panicked worker task).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the defect
        message: String,
    },
}

impl ConsumerError {
    /// Creates a new Configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new TaskDefinition error.
    pub fn task_definition(message: impl Into<String>) -> Self {
        Self::TaskDefinition {
            message: message.into(),
        }
    }

    /// Creates a new Extraction error.
    pub fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction {
            message: message.into(),
        }
    }

    /// Creates a new Finalization error.
    pub fn finalization(message: impl Into<String>) -> Self {
        Self::Finalization {
            message: message.into(),
        }
    }

    /// Creates a new FrozenState error.
    pub fn frozen_state(message: impl Into<String>) -> Self {
        Self::FrozenState {
            message: message.into(),
        }
    }

    /// Creates a new SerDes error.
    pub fn serdes(message: impl Into<String>) -> Self {
        Self::SerDes {
            message: message.into(),
        }
    }

    /// Creates a new Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error must escalate to the host and fail the
    /// whole invocation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Extraction { .. })
    }
}

impl From<serde_json::Error> for ConsumerError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerDes {
            message: error.to_string(),
        }
    }
}

/// Serializable error details recorded on task tracking state.
///
/// This is the persisted form of a task's `lastError`: it travels inside
/// resubmitted message bodies and dead message envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// The error type/name
    pub error_type: String,
    /// The error message
    pub message: String,
}

impl ErrorInfo {
    /// Creates a new ErrorInfo.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// The synthetic error recorded when a still-running task is frozen.
    pub fn frozen_while_running() -> Self {
        Self::new(
            "FrozenTaskError",
            "task was still running when tracking was frozen",
        )
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl From<&ConsumerError> for ErrorInfo {
    fn from(error: &ConsumerError) -> Self {
        let error_type = match error {
            ConsumerError::Configuration { .. } => "ConfigurationError",
            ConsumerError::TaskDefinition { .. } => "TaskDefinitionError",
            ConsumerError::Extraction { .. } => "ExtractionError",
            ConsumerError::Finalization { .. } => "FinalizationError",
            ConsumerError::FrozenState { .. } => "FrozenStateError",
            ConsumerError::SerDes { .. } => "SerDesError",
            ConsumerError::Internal { .. } => "InternalError",
        };
        ErrorInfo::new(error_type, error.to_string())
    }
}
