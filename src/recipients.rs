//! Recipient resolution for broadcasts and flow starts.

use chrono::{Duration, Utc};
use std::collections::HashSet;
use tracing::debug;

use crate::error::MailroomResult;
use crate::models::{ContactId, FlowId, Recipients};
use crate::runtime::Runtime;
use crate::services::OrgAssets;

/// Resolve recipients to contact ids, each once, in the order they were found.
///
/// Sources are unioned in this order: explicit contacts, group members, contacts
/// matching the query, then contacts owning the URNs (created when unknown).
/// Exclusions are applied to the union; `started_previously` only applies when a
/// flow is given.
pub async fn resolve(
    rt: &Runtime,
    oa: &OrgAssets,
    recipients: &Recipients,
    flow_id: Option<FlowId>,
) -> MailroomResult<Vec<ContactId>> {
    let org_id = oa.org_id();
    let mut seen: HashSet<ContactId> = HashSet::new();
    let mut contact_ids: Vec<ContactId> = Vec::new();
    let mut add = |ids: Vec<ContactId>| {
        for id in ids {
            if seen.insert(id) {
                contact_ids.push(id);
            }
        }
    };

    add(recipients.contact_ids.clone());

    if !recipients.group_ids.is_empty() {
        add(rt.db.groups.member_ids(org_id, &recipients.group_ids).await?);
    }

    if let Some(query) = recipients.query.as_deref().filter(|q| !q.trim().is_empty()) {
        add(rt.search.query_contact_ids(oa, query).await?);
    }

    if !recipients.urns.is_empty() {
        add(rt.db.contacts.get_or_create_by_urns(org_id, &recipients.urns).await?);
    }

    let found = contact_ids.len();
    let exclusions = &recipients.exclusions;

    if exclusions.non_active && !contact_ids.is_empty() {
        let active: HashSet<ContactId> = rt
            .db
            .contacts
            .filter_active(org_id, &contact_ids)
            .await?
            .into_iter()
            .collect();
        contact_ids.retain(|id| active.contains(id));
    }

    if exclusions.in_a_flow && !contact_ids.is_empty() {
        let in_flow: HashSet<ContactId> = rt
            .db
            .sessions
            .filter_in_flow(org_id, &contact_ids)
            .await?
            .into_iter()
            .collect();
        contact_ids.retain(|id| !in_flow.contains(id));
    }

    if let Some(flow_id) = flow_id.filter(|_| exclusions.started_previously) {
        if !contact_ids.is_empty() {
            let started: HashSet<ContactId> = rt
                .db
                .sessions
                .filter_started_previously(org_id, flow_id, &contact_ids)
                .await?
                .into_iter()
                .collect();
            contact_ids.retain(|id| !started.contains(id));
        }
    }

    if exclusions.not_seen_since_days > 0 && !contact_ids.is_empty() {
        let since = Utc::now() - Duration::days(i64::from(exclusions.not_seen_since_days));
        let seen_since: HashSet<ContactId> = rt
            .db
            .contacts
            .filter_seen_since(org_id, &contact_ids, since)
            .await?
            .into_iter()
            .collect();
        contact_ids.retain(|id| seen_since.contains(id));
    }

    debug!(org_id = %org_id, found, resolved = contact_ids.len(), "Resolved recipients");
    Ok(contact_ids)
}
