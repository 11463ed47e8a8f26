use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{coded_enum, ContactId, FlowId, OrgId};

coded_enum!(
    SessionStatus {
        Waiting = "W",
        Completed = "C",
        Interrupted = "I",
        Expired = "X",
        Failed = "F",
    }
);

/// A flow session. Maps to `flows_flowsession`.
///
/// Every resume of a session produces a new sprint; timers carry the sprint they were
/// created in so a timer that fires after the session moved on can be recognised as stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub current_flow_id: Option<FlowId>,
    pub last_sprint_uuid: Option<Uuid>,
    pub created_on: DateTime<Utc>,
}

impl Session {
    pub fn is_waiting(&self) -> bool {
        self.status == SessionStatus::Waiting
    }

    /// Whether a timer created for the given session and sprint still applies
    pub fn matches_timer(&self, session_uuid: Uuid, sprint_uuid: Uuid) -> bool {
        self.is_waiting()
            && self.uuid == session_uuid
            && self.last_sprint_uuid == Some(sprint_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting() -> Session {
        Session {
            uuid: Uuid::new_v4(),
            org_id: OrgId(1),
            contact_id: ContactId(2),
            status: SessionStatus::Waiting,
            current_flow_id: Some(FlowId(3)),
            last_sprint_uuid: Some(Uuid::new_v4()),
            created_on: Utc::now(),
        }
    }

    #[test]
    fn test_timer_matching() {
        let session = waiting();
        let sprint = session.last_sprint_uuid.unwrap();
        assert!(session.matches_timer(session.uuid, sprint));
        assert!(!session.matches_timer(session.uuid, Uuid::new_v4()));
        assert!(!session.matches_timer(Uuid::new_v4(), sprint));

        let ended = Session {
            status: SessionStatus::Completed,
            ..session.clone()
        };
        assert!(!ended.matches_timer(session.uuid, sprint));
    }
}
