//! # Status Web Server
//!
//! A small axum server exposing liveness, readiness and queue state. It shuts
//! down gracefully when the service's shutdown token is cancelled.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{MailroomError, MailroomResult};
use crate::runtime::Runtime;

pub mod routes;
pub mod state;

pub use self::routes::router;
pub use self::state::AppState;

/// Bind the configured address and serve until `shutdown` is cancelled
pub async fn start(rt: Arc<Runtime>, shutdown: CancellationToken) -> MailroomResult<JoinHandle<()>> {
    let address = format!("{}:{}", rt.config.address, rt.config.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| MailroomError::Unavailable(format!("unable to bind {address}: {e}")))?;

    let app = router(AppState::new(rt));
    info!(address, "Web server listening");

    Ok(tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(e) = served {
            error!(error = %e, "Web server error");
        }
        info!("Web server stopped");
    }))
}
