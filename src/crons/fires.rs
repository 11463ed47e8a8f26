//! Turns due contact fires into bulk tasks.
//!
//! Fires are fetched oldest first, grouped by org and kind, chunked and queued as
//! one bulk task per chunk. A chunk's rows are deleted only once its task is
//! queued, so a failure part way leaves the rest for the next run. Bulk tasks check
//! the contact's current session or the point's fire version, which makes
//! reprocessing a fire harmless.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{Cron, CronStats};
use crate::error::{MailroomError, MailroomResult};
use crate::models::contact_fire::parse_campaign_scope;
use crate::models::{ContactFire, ContactId, FireId, FireType, OrgId, PointId, SessionStatus};
use crate::queue::Priority;
use crate::runtime::Runtime;
use crate::tasks::interrupts::SessionRef;
use crate::tasks::{
    queue_task, BulkCampaignTrigger, BulkWaitExpire, BulkWaitTimeout, InterruptSessionBatch,
    TimedSession,
};

/// Stop fetching once a run has gone on this long, well inside the 30 s cadence
pub const DEFAULT_SOFT_DEADLINE: Duration = Duration::from_secs(25);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Grouping {
    WaitTimeouts,
    WaitExpires,
    SessionExpires,
    Campaign { point_id: PointId, fire_version: i32 },
}

fn grouping(fire: &ContactFire) -> MailroomResult<Grouping> {
    match fire.kind() {
        Some(FireType::WaitTimeout) => Ok(Grouping::WaitTimeouts),
        Some(FireType::WaitExpiration) => Ok(Grouping::WaitExpires),
        Some(FireType::SessionExpiration) => Ok(Grouping::SessionExpires),
        Some(FireType::Campaign) => {
            let (point_id, fire_version) = parse_campaign_scope(&fire.scope).ok_or_else(|| {
                MailroomError::InvalidState(format!(
                    "contact fire {} has invalid campaign scope '{}'",
                    fire.id, fire.scope
                ))
            })?;
            Ok(Grouping::Campaign {
                point_id,
                fire_version,
            })
        }
        None => Err(MailroomError::InvalidState(format!(
            "contact fire {} has unknown type '{}'",
            fire.id, fire.fire_type
        ))),
    }
}

fn timed_sessions(fires: &[ContactFire]) -> Vec<TimedSession> {
    fires
        .iter()
        .filter_map(|fire| match (fire.session_uuid, fire.sprint_uuid) {
            (Some(session_uuid), Some(sprint_uuid)) => Some(TimedSession {
                contact_id: fire.contact_id,
                session_uuid,
                sprint_uuid,
            }),
            _ => {
                warn!(fire_id = %fire.id, "Session fire without session or sprint, dropping");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct FireContactFires {
    fetch_batch_size: usize,
    task_batch_size: usize,
    soft_deadline: Duration,
}

impl FireContactFires {
    pub fn new(fetch_batch_size: usize, task_batch_size: usize) -> Self {
        Self {
            fetch_batch_size: fetch_batch_size.max(1),
            task_batch_size: task_batch_size.max(1),
            soft_deadline: DEFAULT_SOFT_DEADLINE,
        }
    }

    pub fn with_soft_deadline(mut self, soft_deadline: Duration) -> Self {
        self.soft_deadline = soft_deadline;
        self
    }

    /// Queue the bulk task for one chunk. Returns the counter it adds to and how
    /// many fires made it into the task; nothing is queued when none did.
    async fn queue_chunk(
        &self,
        rt: &Runtime,
        org_id: OrgId,
        grouping: &Grouping,
        chunk: &[ContactFire],
    ) -> MailroomResult<(&'static str, usize)> {
        match grouping {
            Grouping::WaitTimeouts => {
                let task = BulkWaitTimeout {
                    timeouts: timed_sessions(chunk),
                };
                let count = task.timeouts.len();
                if count > 0 {
                    queue_task(rt.queues.throttled.as_ref(), org_id, &task, Priority::High).await?;
                }
                Ok(("wait_timeouts", count))
            }
            Grouping::WaitExpires => {
                let task = BulkWaitExpire {
                    expirations: timed_sessions(chunk),
                };
                let count = task.expirations.len();
                if count > 0 {
                    queue_task(rt.queues.throttled.as_ref(), org_id, &task, Priority::High).await?;
                }
                Ok(("wait_expires", count))
            }
            Grouping::SessionExpires => {
                // expiring a session never sends anything so it can wait its turn
                let task = InterruptSessionBatch {
                    sessions: chunk
                        .iter()
                        .filter_map(|fire| {
                            fire.session_uuid.map(|session_uuid| SessionRef {
                                session_uuid,
                                contact_id: fire.contact_id,
                            })
                        })
                        .collect(),
                    status: SessionStatus::Expired,
                };
                let count = task.sessions.len();
                if count > 0 {
                    queue_task(rt.queues.batch.as_ref(), org_id, &task, Priority::Bulk).await?;
                }
                Ok(("session_expires", count))
            }
            Grouping::Campaign {
                point_id,
                fire_version,
            } => {
                let task = BulkCampaignTrigger {
                    point_id: *point_id,
                    fire_version: *fire_version,
                    contact_ids: chunk.iter().map(|fire| fire.contact_id).collect::<Vec<ContactId>>(),
                };
                let count = task.contact_ids.len();
                queue_task(rt.queues.throttled.as_ref(), org_id, &task, Priority::High).await?;
                Ok(("campaign_points", count))
            }
        }
    }
}

#[async_trait]
impl Cron for FireContactFires {
    fn name(&self) -> &'static str {
        "fire_contact_fires"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn run(&self, rt: &Runtime) -> MailroomResult<CronStats> {
        let started = Instant::now();
        let mut stats = CronStats::from([
            ("wait_timeouts", 0),
            ("wait_expires", 0),
            ("session_expires", 0),
            ("campaign_points", 0),
        ]);

        loop {
            let fires = rt
                .db
                .fires
                .load_due(Utc::now(), self.fetch_batch_size)
                .await?;
            if fires.is_empty() {
                break;
            }
            let fetched = fires.len();

            let mut groups: BTreeMap<(OrgId, Grouping), Vec<ContactFire>> = BTreeMap::new();
            for fire in fires {
                let grouping = grouping(&fire)?;
                groups.entry((fire.org_id, grouping)).or_default().push(fire);
            }

            for ((org_id, grouping), fires) in &groups {
                for chunk in fires.chunks(self.task_batch_size) {
                    let (counter, queued) = self.queue_chunk(rt, *org_id, grouping, chunk).await?;

                    let ids: Vec<FireId> = chunk.iter().map(|fire| fire.id).collect();
                    rt.db.fires.delete_fires(&ids).await?;
                    *stats.entry(counter).or_default() += queued as u64;
                }
            }

            debug!(fetched, groups = groups.len(), "Contact fires queued");

            if fetched < self.fetch_batch_size {
                break;
            }
            if started.elapsed() >= self.soft_deadline {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Soft deadline reached, leaving remaining fires for next run");
                break;
            }
        }

        Ok(stats)
    }
}
