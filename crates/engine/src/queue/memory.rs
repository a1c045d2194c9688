use std::collections::{BTreeSet, HashMap, HashSet};

use jobqueue_core::{JobId, SessionId, Timestamp};

use super::{Candidate, JobQueue};
use crate::constraint::Constraints;
use crate::holder::{JobHolder, ReadyKey};
use crate::persistence::PersistenceError;
use crate::tags::{TagConstraint, TagQuery};

/// In-memory queue for transient jobs.
///
/// Holders wait in `delayed` (keyed by ready time) until a peek at or after
/// that time promotes them into `ready` (keyed by priority and seniority).
/// Time only moves forward, so promotion is one-way.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    holders: HashMap<JobId, JobHolder>,
    ready: BTreeSet<(ReadyKey, JobId)>,
    delayed: BTreeSet<(Timestamp, JobId)>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn promote(&mut self, now: Timestamp) {
        while let Some(&(ready_at, id)) = self.delayed.first() {
            if ready_at > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(holder) = self.holders.get(&id) {
                self.ready.insert((holder.ready_key(), id));
            }
        }
    }

    fn unindex(&mut self, holder: &JobHolder) {
        let id = holder.id();
        if !self.ready.remove(&(holder.ready_key(), id)) {
            self.delayed.remove(&(holder.ready_at(), id));
        }
    }

    fn detach(&mut self, id: JobId) -> Option<JobHolder> {
        let holder = self.holders.remove(&id)?;
        self.unindex(&holder);
        Some(holder)
    }
}

impl JobQueue for MemoryQueue {
    fn insert(&mut self, holder: JobHolder) -> Result<(), PersistenceError> {
        let id = holder.id();
        if let Some(previous) = self.holders.remove(&id) {
            self.unindex(&previous);
        }
        self.delayed.insert((holder.ready_at(), id));
        self.holders.insert(id, holder);
        Ok(())
    }

    fn peek_next_eligible(&mut self, constraints: &Constraints<'_>) -> Option<Candidate> {
        self.promote(constraints.now);
        self.ready.iter().find_map(|&(key, id)| {
            let holder = self.holders.get(&id)?;
            constraints
                .is_eligible(holder)
                .then_some(Candidate { key, id })
        })
    }

    fn take(&mut self, id: JobId, session: SessionId) -> Option<JobHolder> {
        let mut holder = self.detach(id)?;
        holder.mark_running(session);
        Some(holder)
    }

    fn remove(&mut self, id: JobId) -> Option<JobHolder> {
        self.detach(id)
    }

    fn finish(&mut self, _id: JobId) {}

    fn count(&self) -> usize {
        self.holders.len()
    }

    fn count_ready(&mut self, constraints: &Constraints<'_>) -> usize {
        self.promote(constraints.now);
        let mut groups = HashSet::new();
        self.ready
            .iter()
            .filter_map(|(_, id)| self.holders.get(id))
            .filter(|holder| constraints.is_eligible(holder))
            .filter(|holder| match holder.group_id() {
                Some(group) => groups.insert(group.to_string()),
                None => true,
            })
            .count()
    }

    fn next_ready_at(&self) -> Option<Timestamp> {
        self.delayed.first().map(|&(ready_at, _)| ready_at)
    }

    fn find_by_tags(&self, constraint: TagConstraint, query: &TagQuery) -> Vec<JobId> {
        let mut matched: Vec<&JobHolder> = self
            .holders
            .values()
            .filter(|holder| constraint.matches(query, holder.tags()))
            .collect();
        matched.sort_by_key(|holder| holder.sequence());
        matched.into_iter().map(JobHolder::id).collect()
    }

    fn get(&self, id: JobId) -> Option<&JobHolder> {
        self.holders.get(&id)
    }

    fn ids(&self) -> Vec<JobId> {
        self.holders.keys().copied().collect()
    }

    fn clear(&mut self) {
        self.holders.clear();
        self.ready.clear();
        self.delayed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FnJob;
    use crate::params::Params;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn holder(params: Params, now: u64, sequence: u64) -> JobHolder {
        JobHolder::new(
            Arc::new(FnJob::new(params.clone(), || Ok(()))),
            &params,
            Timestamp::from_nanos(now),
            sequence,
        )
    }

    struct Env {
        groups: HashSet<String>,
        held: HashSet<JobId>,
        network: bool,
    }

    impl Env {
        fn new() -> Self {
            Self {
                groups: HashSet::new(),
                held: HashSet::new(),
                network: true,
            }
        }

        fn at(&self, now: u64) -> Constraints<'_> {
            Constraints {
                now: Timestamp::from_nanos(now),
                network_available: self.network,
                running_groups: &self.groups,
                held_back: &self.held,
            }
        }
    }

    fn drain(queue: &mut MemoryQueue, env: &Env, now: u64) -> Vec<JobId> {
        let session = SessionId::new();
        let mut order = Vec::new();
        while let Some(candidate) = queue.peek_next_eligible(&env.at(now)) {
            queue.take(candidate.id, session).unwrap();
            order.push(candidate.id);
        }
        order
    }

    #[test]
    fn priority_then_fifo() {
        let mut queue = MemoryQueue::new();
        let a = holder(Params::new(1), 10, 0);
        let b = holder(Params::new(2), 20, 1);
        let c = holder(Params::new(1), 30, 2);
        let expected = vec![b.id(), a.id(), c.id()];
        for h in [c, a, b] {
            queue.insert(h).unwrap();
        }

        assert_eq!(drain(&mut queue, &Env::new(), 100), expected);
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn delayed_holders_wait_for_their_time() {
        let mut queue = MemoryQueue::new();
        let h = holder(Params::new(5).delay_in(Duration::from_nanos(50)), 0, 0);
        let id = h.id();
        queue.insert(h).unwrap();
        let env = Env::new();

        assert_eq!(queue.next_ready_at(), Some(Timestamp::from_nanos(50)));
        assert!(queue.peek_next_eligible(&env.at(49)).is_none());
        assert_eq!(queue.count_ready(&env.at(49)), 0);
        assert_eq!(queue.peek_next_eligible(&env.at(50)).map(|c| c.id), Some(id));
        assert_eq!(queue.next_ready_at(), None);
    }

    #[test]
    fn busy_group_is_skipped() {
        let mut queue = MemoryQueue::new();
        let grouped = holder(Params::new(9).group_by("g"), 0, 0);
        let free = holder(Params::new(1), 0, 1);
        let free_id = free.id();
        queue.insert(grouped).unwrap();
        queue.insert(free).unwrap();

        let mut env = Env::new();
        env.groups.insert("g".to_string());

        assert_eq!(queue.peek_next_eligible(&env.at(0)).map(|c| c.id), Some(free_id));
    }

    #[test]
    fn network_gated_holders_wait_offline() {
        let mut queue = MemoryQueue::new();
        let online = holder(Params::new(9).require_network(), 0, 0);
        let online_id = online.id();
        queue.insert(online).unwrap();

        let mut env = Env::new();
        env.network = false;
        assert!(queue.peek_next_eligible(&env.at(0)).is_none());

        env.network = true;
        assert_eq!(queue.peek_next_eligible(&env.at(0)).map(|c| c.id), Some(online_id));
    }

    #[test]
    fn count_ready_counts_groups_once() {
        let mut queue = MemoryQueue::new();
        queue.insert(holder(Params::new(1).group_by("g"), 0, 0)).unwrap();
        queue.insert(holder(Params::new(1).group_by("g"), 0, 1)).unwrap();
        queue.insert(holder(Params::new(1), 0, 2)).unwrap();

        assert_eq!(queue.count_ready(&Env::new().at(0)), 2);
        assert_eq!(queue.count(), 3);
    }

    #[test]
    fn reinsert_replaces_by_id() {
        let mut queue = MemoryQueue::new();
        let mut h = holder(Params::new(5), 0, 0);
        queue.insert(h.clone()).unwrap();
        h.requeue(Timestamp::from_nanos(40), Some(3));
        queue.insert(h.clone()).unwrap();

        assert_eq!(queue.count(), 1);
        assert!(queue.peek_next_eligible(&Env::new().at(39)).is_none());
        assert_eq!(queue.get(h.id()).map(JobHolder::priority), Some(3));
    }

    #[test]
    fn remove_and_tags() {
        let mut queue = MemoryQueue::new();
        let tagged = holder(Params::new(1).add_tags(["a", "b"]), 0, 0);
        let other = holder(Params::new(1).add_tags(["c"]), 0, 1);
        let tagged_id = tagged.id();
        queue.insert(tagged).unwrap();
        queue.insert(other).unwrap();

        let query = TagQuery::new(["a", "c"]).unwrap();
        assert_eq!(queue.find_by_tags(TagConstraint::Any, &query).len(), 2);
        assert!(queue.find_by_tags(TagConstraint::All, &query).is_empty());

        let only_a = TagQuery::new(["a"]).unwrap();
        assert_eq!(queue.find_by_tags(TagConstraint::All, &only_a), vec![tagged_id]);

        assert!(queue.remove(tagged_id).is_some());
        assert!(queue.remove(tagged_id).is_none());
        assert_eq!(queue.count(), 1);
    }

    proptest! {
        /// Property: draining yields non-increasing priority, FIFO within a priority.
        #[test]
        fn drain_respects_priority_and_fifo(priorities in prop::collection::vec(0i32..5, 1..40)) {
            let mut queue = MemoryQueue::new();
            for (seq, p) in priorities.iter().enumerate() {
                queue.insert(holder(Params::new(*p), seq as u64, seq as u64)).unwrap();
            }
            let env = Env::new();
            let session = SessionId::new();
            let mut drained = Vec::new();
            while let Some(candidate) = queue.peek_next_eligible(&env.at(1_000)) {
                let h = queue.take(candidate.id, session).unwrap();
                drained.push((h.priority(), h.sequence()));
            }

            prop_assert_eq!(drained.len(), priorities.len());
            for pair in drained.windows(2) {
                let (p0, s0) = pair[0];
                let (p1, s1) = pair[1];
                prop_assert!(p0 > p1 || (p0 == p1 && s0 < s1));
            }
        }
    }
}
