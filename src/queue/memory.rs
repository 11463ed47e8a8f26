//! In-process fair queue
//!
//! Same algorithm as the Redis scripts, with a logical clock standing in for
//! wall-clock scores so that ordering is deterministic.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

use super::{PoppedTask, Priority, TaskEnvelope, TaskQueue};
use crate::error::MailroomResult;
use crate::models::OrgId;

#[derive(Debug, Default)]
struct State {
    clock: u64,
    /// owner -> position in line
    queued: HashMap<OrgId, u64>,
    active: HashMap<OrgId, usize>,
    paused: HashSet<OrgId>,
    lanes: HashMap<(OrgId, u8), VecDeque<String>>,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lane_len(&self, owner: OrgId, priority: Priority) -> usize {
        self.lanes
            .get(&(owner, priority.lane()))
            .map_or(0, VecDeque::len)
    }

    fn pop_lane(&mut self, owner: OrgId, priority: Priority) -> Option<String> {
        self.lanes
            .get_mut(&(owner, priority.lane()))
            .and_then(VecDeque::pop_front)
    }

    /// Owners in line order
    fn line(&self) -> Vec<OrgId> {
        let mut line: Vec<(u64, OrgId)> = self.queued.iter().map(|(o, s)| (*s, *o)).collect();
        line.sort_unstable();
        line.into_iter().map(|(_, owner)| owner).collect()
    }
}

#[derive(Debug)]
pub struct MemoryFairQueue {
    name: String,
    max_active_per_owner: usize,
    state: Mutex<State>,
}

impl MemoryFairQueue {
    pub fn new(name: impl Into<String>, max_active_per_owner: usize) -> Self {
        Self {
            name: name.into(),
            max_active_per_owner: max_active_per_owner.max(1),
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryFairQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_active_per_owner(&self) -> usize {
        self.max_active_per_owner
    }

    async fn push(
        &self,
        owner_id: OrgId,
        envelope: &TaskEnvelope,
        priority: Priority,
    ) -> MailroomResult<()> {
        let payload = envelope.to_json()?;
        let mut state = self.state.lock();
        state
            .lanes
            .entry((owner_id, priority.lane()))
            .or_default()
            .push_back(payload);

        if !state.queued.contains_key(&owner_id) {
            let now = state.tick();
            state.queued.insert(owner_id, now);
        }
        Ok(())
    }

    async fn pop(&self) -> MailroomResult<Option<PoppedTask>> {
        let mut state = self.state.lock();

        for owner in state.line() {
            if state.paused.contains(&owner) {
                continue;
            }
            if state.active.get(&owner).copied().unwrap_or(0) >= self.max_active_per_owner {
                continue;
            }

            let Some(payload) = state
                .pop_lane(owner, Priority::High)
                .or_else(|| state.pop_lane(owner, Priority::Bulk))
            else {
                state.queued.remove(&owner);
                continue;
            };

            if state.lane_len(owner, Priority::High) + state.lane_len(owner, Priority::Bulk) == 0 {
                state.queued.remove(&owner);
            } else {
                let now = state.tick();
                state.queued.insert(owner, now);
            }
            *state.active.entry(owner).or_insert(0) += 1;

            return Ok(Some(PoppedTask {
                queue: self.name.clone(),
                owner_id: owner,
                payload,
            }));
        }

        Ok(None)
    }

    async fn done(&self, owner_id: OrgId) -> MailroomResult<()> {
        let mut state = self.state.lock();
        if let Some(count) = state.active.get_mut(&owner_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.active.remove(&owner_id);
            }
        }
        Ok(())
    }

    async fn pause(&self, owner_id: OrgId) -> MailroomResult<()> {
        self.state.lock().paused.insert(owner_id);
        Ok(())
    }

    async fn resume(&self, owner_id: OrgId) -> MailroomResult<()> {
        self.state.lock().paused.remove(&owner_id);
        Ok(())
    }

    async fn paused(&self) -> MailroomResult<Vec<OrgId>> {
        let mut paused: Vec<OrgId> = self.state.lock().paused.iter().copied().collect();
        paused.sort_unstable();
        Ok(paused)
    }

    async fn owners(&self) -> MailroomResult<Vec<OrgId>> {
        Ok(self.state.lock().line())
    }

    async fn active(&self, owner_id: OrgId) -> MailroomResult<usize> {
        Ok(self
            .state
            .lock()
            .active
            .get(&owner_id)
            .copied()
            .unwrap_or(0))
    }

    async fn size(&self) -> MailroomResult<usize> {
        let state = self.state.lock();
        Ok(state
            .queued
            .keys()
            .map(|o| state.lane_len(*o, Priority::High) + state.lane_len(*o, Priority::Bulk))
            .sum())
    }

    async fn owner_size(&self, owner_id: OrgId) -> MailroomResult<usize> {
        let state = self.state.lock();
        Ok(state.lane_len(owner_id, Priority::High) + state.lane_len(owner_id, Priority::Bulk))
    }
}
