//! # slipway-core
//!
//! Core abstractions for the Slipway delivery-pipeline control plane.
//!
//! This crate provides the foundational types used across all Slipway
//! components:
//!
//! - **Identifiers**: Strongly-typed ids for events and delivery contexts
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span constructors
//!
//! ## Crate Boundary
//!
//! `slipway-core` is the **only** crate allowed to define shared primitives.
//! All cross-component interaction happens via contracts defined here or in
//! the engine crate's seam traits.
//!
//! ## Example
//!
//! ```rust
//! use slipway_core::prelude::*;
//!
//! let context = KeptnContext::new("c1");
//! let event_id = EventId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use slipway_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{EventId, KeptnContext};
    pub use crate::observability::{init_logging, LogFormat};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{EventId, KeptnContext};
pub use observability::{init_logging, LogFormat};
