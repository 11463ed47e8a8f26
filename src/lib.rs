#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, Redis in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Mailroom Core
//!
//! The back-end task engine of a multi-tenant messaging and flow platform.
//!
//! ## Overview
//!
//! Work arrives as small JSON tasks pushed onto Redis-backed queues by the web tier
//! and by this service itself. Each queue is fair across orgs: an org that floods a
//! queue with thousands of tasks cannot starve a quieter org, and no single org may
//! occupy more than a configured share of a queue's workers.
//!
//! Events for a single contact (incoming messages, channel events, flow timers) are
//! serialized through a per-contact queue drained under a distributed lock, so a
//! contact never has two flow runs in progress at once.
//!
//! ## Module Organization
//!
//! - [`queue`] - Fair multi-tenant task queues (Redis and in-process)
//! - [`foreman`] - Worker pools that drain one queue each
//! - [`tasks`] - Task types run by the workers and their registry
//! - [`contact_tasks`] - Events serialized per contact
//! - [`contacts`] - Per-contact event queues
//! - [`locks`] - Distributed locks with owner tokens
//! - [`crons`] - Periodic jobs aligned across nodes
//! - [`runner`] - Running the flow engine for contacts under their locks
//! - [`recipients`] - Resolving broadcast and flow start recipients
//! - [`service`] - Service lifecycle and dependency checks
//! - [`web`] - Health and queue status endpoints
//! - [`runtime`] - The handles every task runs against
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mailroom_core::config::ConfigManager;
//! use mailroom_core::runtime::Runtime;
//! use mailroom_core::service::Service;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let rt = Arc::new(Runtime::from_config(manager.config().clone()).await?);
//!
//! let mut service = Service::new(rt);
//! service.start().await?;
//! // ... wait for a shutdown signal
//! service.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                          # Unit and in-process integration tests
//! cargo test --features test-services # Also run against live Redis
//! ```

pub mod config;
pub mod constants;
pub mod contact_tasks;
pub mod contacts;
pub mod crons;
pub mod database;
pub mod error;
pub mod foreman;
pub mod kv;
pub mod locks;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod recipients;
pub mod runner;
pub mod runtime;
pub mod service;
pub mod services;
pub mod tasks;
pub mod web;

pub use config::{ConfigManager, LogFormat, MailroomConfig};
pub use error::{MailroomError, MailroomResult};
pub use foreman::{Foreman, TaskOutcome};
pub use queue::{Priority, Queues, TaskEnvelope, TaskQueue};
pub use runtime::{Runtime, RuntimeBuilder};
pub use service::Service;
pub use tasks::{queue_task, Task, TaskRegistry, TaskType};
