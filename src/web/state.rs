use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::runtime::Runtime;

/// Shared state of the web handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub rt: Arc<Runtime>,
    pub started_on: DateTime<Utc>,
}

impl AppState {
    pub fn new(rt: Arc<Runtime>) -> Self {
        Self {
            rt,
            started_on: Utc::now(),
        }
    }
}
