//! # Service Lifecycle
//!
//! Starts and stops everything a node runs: one foreman per fair queue, the
//! status web server and the cron loops. A node records itself in the
//! `app-nodes:running` hash while up; finding its own entry at startup means the
//! last run did not shut down cleanly.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::constants::{keys, SERVICE_NAME};
use crate::crons::{self, CronScheduler};
use crate::error::MailroomResult;
use crate::foreman::Foreman;
use crate::runtime::Runtime;
use crate::web;

/// Reachability of one dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyCheck {
    pub name: &'static str,
    pub healthy: bool,
    pub message: Option<String>,
    pub duration_ms: u64,
}

async fn check<F>(name: &'static str, probe: F) -> DependencyCheck
where
    F: std::future::Future<Output = MailroomResult<()>>,
{
    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(5), probe).await;
    let message = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some("timed out".to_string()),
    };
    DependencyCheck {
        name,
        healthy: message.is_none(),
        message,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// Probe every dependency the runtime was built with
pub async fn check_dependencies(rt: &Runtime) -> Vec<DependencyCheck> {
    let mut checks = vec![check("kv", rt.kv.ping()).await];
    if let Some(pg) = rt.postgres() {
        checks.push(check("db", pg.health_check()).await);
    }
    checks.push(check("search", rt.search.ping()).await);
    checks
}

/// Field of this node in the running-nodes ledger
pub fn node_id(rt: &Runtime) -> String {
    format!("{SERVICE_NAME}:{}", rt.config.instance_name)
}

pub struct Service {
    rt: Arc<Runtime>,
    shutdown: CancellationToken,
    foremen: Vec<Foreman>,
    crons: Option<CronScheduler>,
    web: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("node", &node_id(&self.rt))
            .field("foremen", &self.foremen)
            .field("crons", &self.crons)
            .field("web", &self.web.is_some())
            .finish()
    }
}

impl Service {
    pub fn new(rt: Arc<Runtime>) -> Self {
        Self {
            rt,
            shutdown: CancellationToken::new(),
            foremen: Vec::new(),
            crons: None,
            web: None,
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    /// Token cancelled when the service stops
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn start(&mut self) -> MailroomResult<()> {
        let rt = self.rt.clone();

        // a node with unhealthy dependencies still serves what it can
        for dependency in check_dependencies(&rt).await {
            match &dependency.message {
                None => info!(dependency = dependency.name, duration_ms = dependency.duration_ms, "Dependency healthy"),
                Some(message) => warn!(dependency = dependency.name, error = %message, "Dependency unhealthy"),
            }
        }

        for queue in rt.queues.all() {
            let workers = rt.config.workers_for(queue.name());
            self.foremen
                .push(Foreman::start(rt.clone(), queue.clone(), workers));
        }

        self.web = Some(web::start(rt.clone(), self.shutdown.clone()).await?);

        self.crons = Some(CronScheduler::start(
            rt.clone(),
            crons::default_crons(&rt),
            self.shutdown.clone(),
        ));

        let node = node_id(&rt);
        if rt.kv.hexists(keys::RUNNING_NODES, &node).await? {
            error!(node = %node, "Node is already marked running, the last shutdown was not clean");
        } else {
            rt.kv
                .hset(keys::RUNNING_NODES, &node, &Utc::now().to_rfc3339())
                .await?;
        }

        info!(node = %node, "Service started");
        Ok(())
    }

    pub async fn stop(&mut self) {
        let node = node_id(&self.rt);
        info!(node = %node, "Service stopping");

        for foreman in self.foremen.drain(..) {
            foreman.stop().await;
        }

        self.shutdown.cancel();

        if let Some(web) = self.web.take() {
            if let Err(e) = web.await {
                error!(error = %e, "Web server ended abnormally");
            }
        }
        if let Some(crons) = self.crons.take() {
            crons.join().await;
        }

        if let Err(e) = self.rt.kv.hdel(keys::RUNNING_NODES, &node).await {
            error!(node = %node, error = %e, "Failed to remove node from running nodes");
        }
        self.rt.close().await;
        info!(node = %node, "Service stopped");
    }
}
