//! Observability infrastructure for Tollgate.
//!
//! Structured logging with consistent spans. This module provides the
//! subscriber initialization and the span constructors shared by the
//! billing and task execution paths.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name, falling back to [`LogFormat::Pretty`].
    #[must_use]
    pub fn parse_or_default(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tollgate_flow=debug`)
///
/// # Example
///
/// ```rust
/// use tollgate_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

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

/// Creates a span for billing operations with standard fields.
///
/// # Example
///
/// ```rust
/// use tollgate_core::observability::billing_span;
///
/// let span = billing_span("reserve", "01J0000000000000000000USER");
/// let _guard = span.enter();
/// // ... reserve funds
/// ```
#[must_use]
pub fn billing_span(operation: &str, user_id: &str) -> Span {
    tracing::info_span!("billing", op = operation, user_id = user_id)
}

/// Creates a span for task execution with standard fields.
#[must_use]
pub fn task_span(operation: &str, task_id: &str, user_id: &str) -> Span {
    tracing::info_span!(
        "task",
        op = operation,
        task_id = task_id,
        user_id = user_id,
    )
}
