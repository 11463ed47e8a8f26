//! # Task Engine Metrics
//!
//! OpenTelemetry instruments for task execution, contact queue draining and
//! cron runs. Instruments come from the global meter provider, so they are
//! no-ops until the embedding process installs one.
//!
//! ```rust
//! use mailroom_core::metrics;
//! use opentelemetry::KeyValue;
//!
//! metrics::tasks_executed_total().add(
//!     1,
//!     &[
//!         KeyValue::new("queue", "batch"),
//!         KeyValue::new("task_type", "send_broadcast"),
//!         KeyValue::new("result", "success"),
//!     ],
//! );
//! ```

use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::sync::OnceLock;

static MAILROOM_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    MAILROOM_METER.get_or_init(|| opentelemetry::global::meter_provider().meter("mailroom"))
}

/// Tasks executed by workers
///
/// Labels:
/// - queue: realtime, batch, throttled
/// - task_type: registered task type
/// - result: success, error, panic, timeout, unknown_type, decode_error, assets_error
pub fn tasks_executed_total() -> Counter<u64> {
    meter()
        .u64_counter("mailroom.tasks.executed.total")
        .with_description("Tasks executed by workers")
        .build()
}

/// Task execution time in milliseconds
///
/// Labels:
/// - queue
/// - task_type
pub fn task_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("mailroom.tasks.duration")
        .with_description("Task execution time in milliseconds")
        .with_unit("ms")
        .build()
}

/// Tasks whose perform panicked
///
/// Labels:
/// - task_type
pub fn task_panics_total() -> Counter<u64> {
    meter()
        .u64_counter("mailroom.tasks.panics.total")
        .with_description("Tasks whose execution panicked")
        .build()
}

/// Contact queue drains that could not acquire the contact lock
pub fn contact_lock_failures_total() -> Counter<u64> {
    meter()
        .u64_counter("mailroom.contacts.lock_failures.total")
        .with_description("Contact queue drains that failed to acquire the contact lock")
        .build()
}

/// Contact tasks dropped after exhausting their attempts
///
/// Labels:
/// - task_type
pub fn contact_tasks_dropped_total() -> Counter<u64> {
    meter()
        .u64_counter("mailroom.contacts.tasks_dropped.total")
        .with_description("Contact tasks dropped after exhausting their attempts")
        .build()
}

/// Cron executions
///
/// Labels:
/// - cron: cron name
/// - result: success, error, timeout
pub fn cron_runs_total() -> Counter<u64> {
    meter()
        .u64_counter("mailroom.crons.runs.total")
        .with_description("Cron executions")
        .build()
}

/// Cron execution time in milliseconds
///
/// Labels:
/// - cron
pub fn cron_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("mailroom.crons.duration")
        .with_description("Cron execution time in milliseconds")
        .with_unit("ms")
        .build()
}
