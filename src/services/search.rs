//! Contact search: resolving contact queries and removing deleted orgs' documents.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::OrgAssets;
use crate::error::{MailroomError, MailroomResult};
use crate::models::{ContactId, OrgId};

/// Most contact ids a single query resolves to
pub const MAX_QUERY_RESULTS: usize = 10_000;

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn ping(&self) -> MailroomResult<()>;

    /// Ids of the org's contacts matching a contact query
    async fn query_contact_ids(&self, oa: &OrgAssets, query: &str)
        -> MailroomResult<Vec<ContactId>>;

    /// Remove up to `limit` of the org's contact documents, returns how many were removed
    async fn deindex_org_contacts(&self, org_id: OrgId, limit: usize) -> MailroomResult<usize>;
}

/// Elasticsearch-compatible search over the contact index
#[derive(Debug, Clone)]
pub struct ElasticSearchClient {
    client: reqwest::Client,
    base_url: String,
    index: String,
}

impl ElasticSearchClient {
    pub fn new(base_url: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            index: index.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.index, path)
    }
}

#[async_trait]
impl SearchClient for ElasticSearchClient {
    async fn ping(&self) -> MailroomResult<()> {
        self.client
            .get(&self.base_url)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn query_contact_ids(
        &self,
        oa: &OrgAssets,
        query: &str,
    ) -> MailroomResult<Vec<ContactId>> {
        let body = json!({
            "_source": false,
            "size": MAX_QUERY_RESULTS,
            "sort": [{"id": "asc"}],
            "query": {
                "bool": {
                    "filter": [
                        {"term": {"org_id": oa.org_id().0}},
                        {"term": {"is_active": true}}
                    ],
                    "must": {"query_string": {"query": query}}
                }
            }
        });

        let response: serde_json::Value = self
            .client
            .post(self.url("_search"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let hits = response["hits"]["hits"]
            .as_array()
            .ok_or_else(|| MailroomError::SearchError("response has no hits".to_string()))?;

        let ids = hits
            .iter()
            .filter_map(|hit| hit["_id"].as_str())
            .map(|id| {
                id.parse::<ContactId>()
                    .map_err(|e| MailroomError::SearchError(e.to_string()))
            })
            .collect::<MailroomResult<Vec<_>>>()?;

        debug!(org_id = %oa.org_id(), query, matches = ids.len(), "Contact query resolved");
        Ok(ids)
    }

    async fn deindex_org_contacts(&self, org_id: OrgId, limit: usize) -> MailroomResult<usize> {
        let body = json!({"query": {"term": {"org_id": org_id.0}}});

        let response: serde_json::Value = self
            .client
            .post(self.url(&format!("_delete_by_query?max_docs={limit}&conflicts=proceed")))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response["deleted"].as_u64().unwrap_or(0) as usize)
    }
}

/// Search that is switched off: queries fail, there is never anything to deindex
#[derive(Debug, Default, Clone)]
pub struct DisabledSearch;

#[async_trait]
impl SearchClient for DisabledSearch {
    async fn ping(&self) -> MailroomResult<()> {
        Ok(())
    }

    async fn query_contact_ids(
        &self,
        _oa: &OrgAssets,
        _query: &str,
    ) -> MailroomResult<Vec<ContactId>> {
        Err(MailroomError::Unavailable("search is not configured".to_string()))
    }

    async fn deindex_org_contacts(&self, _org_id: OrgId, _limit: usize) -> MailroomResult<usize> {
        Ok(0)
    }
}
