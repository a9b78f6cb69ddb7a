//! Error types for the sequence orchestration domain.
//!
//! Component boundaries surface a single [`Error`] enum; callers that need to
//! decide between retrying, dropping, or failing a sequence classify errors
//! via [`Error::kind`].

/// The result type used throughout slipway-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used to pick a recovery strategy.
///
/// - `Transient` errors are retried by the owning periodic task on its next
///   tick; no state is lost because writes commit before the ack.
/// - `Conflict` errors come from optimistic-concurrency failures and are
///   retried inline with a bounded budget.
/// - `Malformed` events are dropped with a warning; no state is touched.
/// - `Protocol` violations (late or duplicate responses) are tolerated and
///   logged.
/// - `Policy` errors fail the sequence so downstream logic is not hung.
/// - `Fatal` errors abort process startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Store, bus, or configuration store temporarily unreachable.
    Transient,
    /// Compare-and-set failure on the sequence execution document.
    Conflict,
    /// Event could not be interpreted.
    Malformed,
    /// Event arrived out of protocol (late, duplicate, unmatched).
    Protocol,
    /// The pipeline specification rejects the requested operation.
    Policy,
    /// Unrecoverable at boot.
    Fatal,
}

/// Errors that can occur in sequence orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A bus publish or subscribe operation failed.
    #[error("event bus error: {message}")]
    Bus {
        /// Description of the bus failure.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An incoming event could not be interpreted.
    #[error("malformed event: {message}")]
    MalformedEvent {
        /// What made the event unusable.
        message: String,
    },

    /// No pipeline specification exists for the project.
    #[error("no shipyard found for project '{project}'")]
    ShipyardNotFound {
        /// The project that was looked up.
        project: String,
    },

    /// The pipeline specification exists but is unusable.
    #[error("invalid shipyard for project '{project}': {message}")]
    ShipyardInvalid {
        /// The project whose shipyard failed validation.
        project: String,
        /// Description of the defect.
        message: String,
    },

    /// The configuration store could not be reached.
    #[error("configuration store unreachable: {message}")]
    ConfigurationStoreUnreachable {
        /// Description of the transport failure.
        message: String,
    },

    /// No sequence execution exists for the addressed scope.
    #[error("no sequence execution for project '{project}' context '{keptn_context}' stage '{stage}'")]
    ExecutionNotFound {
        /// The project that was addressed.
        project: String,
        /// The delivery context that was addressed.
        keptn_context: String,
        /// The stage that was addressed.
        stage: String,
    },

    /// Optimistic-concurrency retries were exhausted.
    #[error("revision conflict persisted after {retries} retries")]
    RevisionConflict {
        /// How many compare-and-set attempts were made.
        retries: u32,
    },

    /// A control request addressed a sequence in an incompatible state.
    #[error("invalid sequence state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// Why the transition is invalid.
        reason: String,
    },

    /// An error from slipway-core.
    #[error("core error: {0}")]
    Core(#[from] slipway_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new bus error.
    #[must_use]
    pub fn bus(message: impl Into<String>) -> Self {
        Self::Bus {
            message: message.into(),
        }
    }

    /// Creates a new malformed-event error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEvent {
            message: message.into(),
        }
    }

    /// Classifies this error for recovery decisions.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage { .. }
            | Self::Bus { .. }
            | Self::ConfigurationStoreUnreachable { .. } => ErrorKind::Transient,
            Self::RevisionConflict { .. } => ErrorKind::Conflict,
            Self::MalformedEvent { .. } | Self::Serialization { .. } => ErrorKind::Malformed,
            Self::ExecutionNotFound { .. } | Self::InvalidStateTransition { .. } => {
                ErrorKind::Protocol
            }
            Self::ShipyardNotFound { .. } | Self::ShipyardInvalid { .. } => ErrorKind::Policy,
            Self::Core(_) => ErrorKind::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display() {
        let err = Error::storage("connection refused");
        assert!(err.to_string().contains("storage error"));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn conflict_classification() {
        let err = Error::RevisionConflict { retries: 10 };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn policy_classification() {
        let err = Error::ShipyardNotFound {
            project: "sockshop".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Policy);
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::storage_with_source("failed to load document", source);
        assert!(std::error::Error::source(&err).is_some());
    }
}
