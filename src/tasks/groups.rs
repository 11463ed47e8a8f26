use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use super::{Task, TaskType};
use crate::constants::{keys, LONG_JOB_LOCK_TTL, LONG_JOB_LOCK_WAIT};
use crate::error::{MailroomError, MailroomResult};
use crate::locks::with_lock;
use crate::models::{GroupId, GroupStatus};
use crate::runtime::Runtime;
use crate::services::{OrgAssets, Refresh};

/// Re-evaluates a query-based group and replaces its membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulateDynamicGroup {
    pub group_id: GroupId,
    pub query: String,
}

impl TaskType for PopulateDynamicGroup {
    const TYPE: &'static str = "populate_dynamic_group";
}

#[async_trait]
impl Task for PopulateDynamicGroup {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        LONG_JOB_LOCK_TTL
    }

    fn with_assets(&self) -> Refresh {
        Refresh::GROUPS
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let lock_key = keys::group_population_lock(self.group_id.0);

        let populated = with_lock(
            rt.locker.as_ref(),
            &lock_key,
            LONG_JOB_LOCK_TTL,
            LONG_JOB_LOCK_WAIT,
            |_token| self.populate(rt, oa),
        )
        .await?;

        populated.ok_or_else(|| {
            MailroomError::LockError(format!("group {} is being populated elsewhere", self.group_id))
        })
    }
}

impl PopulateDynamicGroup {
    async fn populate(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let org_id = oa.org_id();
        if oa.group(self.group_id).is_none() {
            return Err(MailroomError::NotFound(format!("group {}", self.group_id)));
        }

        rt.db
            .groups
            .set_status(self.group_id, GroupStatus::Evaluating)
            .await?;

        let contact_ids = rt.search.query_contact_ids(oa, &self.query).await?;
        rt.db
            .groups
            .set_members(org_id, self.group_id, &contact_ids)
            .await?;
        rt.db.groups.set_status(self.group_id, GroupStatus::Ready).await?;

        info!(org_id = %org_id, group_id = %self.group_id, members = contact_ids.len(), "Group populated");
        Ok(())
    }
}
