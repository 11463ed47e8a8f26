use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

use super::ContactQueueStore;
use crate::error::MailroomResult;
use crate::models::{ContactId, OrgId};

#[derive(Debug, Default)]
struct State {
    lists: HashMap<(OrgId, ContactId), VecDeque<String>>,
    dispatching: HashSet<(OrgId, ContactId)>,
}

/// In-process contact queues, markers never expire
#[derive(Debug, Default)]
pub struct MemoryContactQueue {
    state: Mutex<State>,
}

impl MemoryContactQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContactQueueStore for MemoryContactQueue {
    async fn push_back(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        payload: &str,
    ) -> MailroomResult<bool> {
        let mut state = self.state.lock();
        state
            .lists
            .entry((org_id, contact_id))
            .or_default()
            .push_back(payload.to_string());
        Ok(state.dispatching.insert((org_id, contact_id)))
    }

    async fn push_front(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        payload: &str,
    ) -> MailroomResult<()> {
        self.state
            .lock()
            .lists
            .entry((org_id, contact_id))
            .or_default()
            .push_front(payload.to_string());
        Ok(())
    }

    async fn pop(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<Option<String>> {
        let mut state = self.state.lock();
        let key = (org_id, contact_id);
        let payload = state.lists.get_mut(&key).and_then(VecDeque::pop_front);
        if state.lists.get(&key).is_some_and(VecDeque::is_empty) {
            state.lists.remove(&key);
        }
        Ok(payload)
    }

    async fn mark_dispatch(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<bool> {
        Ok(self.state.lock().dispatching.insert((org_id, contact_id)))
    }

    async fn clear_dispatch(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<()> {
        self.state.lock().dispatching.remove(&(org_id, contact_id));
        Ok(())
    }

    async fn size(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<usize> {
        Ok(self
            .state
            .lock()
            .lists
            .get(&(org_id, contact_id))
            .map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_first_push_needs_dispatch() {
        let queue = MemoryContactQueue::new();
        assert!(queue.push_back(OrgId(1), ContactId(2), "a").await.unwrap());
        assert!(!queue.push_back(OrgId(1), ContactId(2), "b").await.unwrap());
        assert!(queue.push_back(OrgId(1), ContactId(3), "c").await.unwrap());

        queue.clear_dispatch(OrgId(1), ContactId(2)).await.unwrap();
        assert!(queue.push_back(OrgId(1), ContactId(2), "d").await.unwrap());
    }

    #[tokio::test]
    async fn test_push_front_jumps_the_line() {
        let queue = MemoryContactQueue::new();
        queue.push_back(OrgId(1), ContactId(2), "a").await.unwrap();
        queue.push_back(OrgId(1), ContactId(2), "b").await.unwrap();
        queue.push_front(OrgId(1), ContactId(2), "retry").await.unwrap();

        let mut order = Vec::new();
        while let Some(p) = queue.pop(OrgId(1), ContactId(2)).await.unwrap() {
            order.push(p);
        }
        assert_eq!(order, vec!["retry", "a", "b"]);
        assert_eq!(queue.size(OrgId(1), ContactId(2)).await.unwrap(), 0);
    }
}
