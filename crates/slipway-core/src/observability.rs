//! Observability infrastructure for Slipway.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors for consistent observability
//! across all Slipway components.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// `default_directives` is used when `RUST_LOG` is not set; the service
/// binary maps the `LOG_LEVEL` environment variable onto it.
///
/// # Example
///
/// ```rust
/// use slipway_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty, "info");
/// ```
pub fn init_logging(format: LogFormat, default_directives: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for sequence orchestration operations with standard fields.
///
/// # Example
///
/// ```rust
/// use slipway_core::observability::sequence_span;
///
/// let span = sequence_span("handle_event", "sockshop", "c1", "dev");
/// let _guard = span.enter();
/// // ... process the event
/// ```
#[must_use]
pub fn sequence_span(operation: &str, project: &str, keptn_context: &str, stage: &str) -> Span {
    tracing::info_span!(
        "sequence",
        op = operation,
        project = project,
        keptn_context = keptn_context,
        stage = stage,
    )
}

/// Creates a span for dispatcher tick processing.
#[must_use]
pub fn dispatcher_span(dispatcher: &str) -> Span {
    tracing::info_span!("dispatcher", name = dispatcher)
}
