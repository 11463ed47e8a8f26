//! Waking Android relayer channels through Firebase Cloud Messaging so they sync.

use async_trait::async_trait;
use serde_json::json;

use crate::error::{MailroomError, MailroomResult};
use crate::models::Channel;

pub const FCM_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

#[async_trait]
pub trait AndroidSyncer: Send + Sync {
    async fn sync(&self, channel: &Channel) -> MailroomResult<()>;
}

#[derive(Debug, Clone)]
pub struct FcmSyncer {
    client: reqwest::Client,
    endpoint: String,
    key: String,
}

impl FcmSyncer {
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_endpoint(FCM_ENDPOINT, key)
    }

    pub fn with_endpoint(endpoint: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl AndroidSyncer for FcmSyncer {
    async fn sync(&self, channel: &Channel) -> MailroomResult<()> {
        let fcm_id = channel.fcm_id.as_deref().ok_or_else(|| {
            MailroomError::ValidationError(format!("channel {} has no FCM id", channel.uuid))
        })?;

        let body = json!({
            "to": fcm_id,
            "priority": "high",
            "data": {"msg": "sync"}
        });

        self.client
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.key))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
