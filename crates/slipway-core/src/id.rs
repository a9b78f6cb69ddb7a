//! Strongly-typed identifiers for Slipway entities.
//!
//! All identifiers are:
//! - **Strongly typed**: Prevents mixing up different id kinds at compile time
//! - **Lexicographically sortable**: ULID-backed ids encode creation time and
//!   sort naturally, which keeps the append-only event log in chronological
//!   order when sorted by id
//! - **Globally unique**: No coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use slipway_core::id::{EventId, KeptnContext};
//!
//! let event = EventId::generate();
//! let context = KeptnContext::new("3f9640c6");
//!
//! // Ids are different types - this won't compile:
//! // let wrong: EventId = context;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for an event on the delivery bus.
///
/// Every published or persisted event carries exactly one `EventId`.
/// `started` and `finished` responses reference the id of the `triggered`
/// event they answer (the "triggered id").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Ulid);

impl EventId {
    /// Generates a new unique event id.
    ///
    /// Uses ULID generation which is:
    /// - Lexicographically sortable by creation time
    /// - Globally unique without coordination
    /// - URL-safe and case-insensitive
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates an event id from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the id.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = self.0.timestamp_ms();
        i64::try_from(ms)
            .ok()
            .and_then(chrono::DateTime::from_timestamp_millis)
            .unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid event id '{s}': {e}"),
            })
    }
}

/// The correlation id binding all events of one end-to-end delivery flow.
///
/// A context is chosen by whoever triggers the root sequence and is
/// propagated verbatim through every derived event, across stages. The wire
/// name is `shkeptncontext`. The value is opaque to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeptnContext(String);

impl KeptnContext {
    /// Wraps an externally chosen context value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh context for a root sequence trigger.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Returns the context as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the context value is empty.
    ///
    /// Events without a context are rejected as malformed by the engine.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for KeptnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for KeptnContext {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_roundtrip() {
        let id = EventId::generate();
        let s = id.to_string();
        let parsed: EventId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn event_id_rejects_garbage() {
        let result: Result<EventId> = "not-a-ulid!".parse();
        assert!(result.is_err());
    }

    #[test]
    fn event_ids_sort_chronologically() {
        let a = EventId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = EventId::generate();
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn event_id_serde_transparent() {
        let id = EventId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn keptn_context_is_opaque() {
        let context = KeptnContext::new("my-funky-context");
        assert_eq!(context.as_str(), "my-funky-context");
        assert!(!context.is_empty());
    }

    #[test]
    fn keptn_context_generate_is_unique() {
        assert_ne!(KeptnContext::generate(), KeptnContext::generate());
    }
}
