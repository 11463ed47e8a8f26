use async_trait::async_trait;

use super::OrgAssets;
use crate::error::MailroomResult;
use crate::models::{Call, Channel};

/// Result of asking a channel to place a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Requested,
    /// The channel refused because it is at capacity; try again later
    Throttled,
    Failed(String),
}

#[async_trait]
pub trait IvrService: Send + Sync {
    async fn request_call(
        &self,
        oa: &OrgAssets,
        channel: &Channel,
        call: &Call,
    ) -> MailroomResult<CallOutcome>;
}
