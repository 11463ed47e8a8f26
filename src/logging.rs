//! # Tracing Module
//!
//! Console logging for the mailroom service using the tracing ecosystem.
//! Logs go to stdout; containers and process supervisors collect them from there.
//!
//! - `RUST_LOG` overrides the configured level when set
//! - ANSI colors only when stdout is a terminal
//! - JSON output when `log_format = "json"`

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogFormat;

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber. Safe to call more than once; only the first call
/// has any effect.
pub fn init_tracing(level: &str, format: LogFormat) {
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let use_ansi = IsTerminal::is_terminal(&std::io::stdout());

        let console_layer = match format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_filter(filter)
                .boxed(),
            LogFormat::Text => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(use_ansi)
                .with_filter(filter)
                .boxed(),
        };

        let subscriber = tracing_subscriber::registry().with(console_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        } else {
            tracing::info!(
                level = level,
                format = ?format,
                ansi_colors = use_ansi,
                "Console logging initialized"
            );
        }
    });
}
