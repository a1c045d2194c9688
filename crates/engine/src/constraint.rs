//! Eligibility filter applied when picking the next job.

use std::collections::HashSet;

use jobqueue_core::{JobId, Timestamp};

use crate::holder::JobHolder;

/// Snapshot of the conditions a holder must satisfy to be handed out.
#[derive(Debug, Clone, Copy)]
pub struct Constraints<'a> {
    pub now: Timestamp,
    pub network_available: bool,
    /// Groups with a job currently running.
    pub running_groups: &'a HashSet<String>,
    /// Holders that are not yet visible to consumers (their add notification
    /// is still being delivered).
    pub held_back: &'a HashSet<JobId>,
}

impl Constraints<'_> {
    /// Every condition except readiness time.
    pub fn is_eligible(&self, holder: &JobHolder) -> bool {
        self.network_ok(holder) && !self.group_busy(holder) && !self.held_back.contains(&holder.id())
    }

    pub fn is_ready(&self, holder: &JobHolder) -> bool {
        holder.is_ready(self.now) && self.is_eligible(holder)
    }

    pub fn group_busy(&self, holder: &JobHolder) -> bool {
        holder
            .group_id()
            .is_some_and(|group| self.running_groups.contains(group))
    }

    pub fn network_ok(&self, holder: &JobHolder) -> bool {
        self.network_available || !holder.requires_network()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FnJob;
    use crate::params::Params;
    use std::sync::Arc;
    use std::time::Duration;

    fn holder(params: Params) -> JobHolder {
        JobHolder::new(
            Arc::new(FnJob::new(params.clone(), || Ok(()))),
            &params,
            Timestamp::from_nanos(100),
            0,
        )
    }

    #[test]
    fn network_gate() {
        let groups = HashSet::new();
        let held = HashSet::new();
        let offline = Constraints {
            now: Timestamp::from_nanos(100),
            network_available: false,
            running_groups: &groups,
            held_back: &held,
        };

        assert!(!offline.is_ready(&holder(Params::new(1).require_network())));
        assert!(offline.is_ready(&holder(Params::new(1))));
    }

    #[test]
    fn busy_group_blocks_members_only() {
        let groups: HashSet<String> = ["uploads".to_string()].into();
        let held = HashSet::new();
        let c = Constraints {
            now: Timestamp::from_nanos(100),
            network_available: true,
            running_groups: &groups,
            held_back: &held,
        };

        assert!(c.group_busy(&holder(Params::new(1).group_by("uploads"))));
        assert!(!c.group_busy(&holder(Params::new(1).group_by("downloads"))));
        assert!(!c.group_busy(&holder(Params::new(1))));
    }

    #[test]
    fn delayed_holder_is_eligible_but_not_ready() {
        let groups = HashSet::new();
        let held = HashSet::new();
        let c = Constraints {
            now: Timestamp::from_nanos(100),
            network_available: true,
            running_groups: &groups,
            held_back: &held,
        };
        let h = holder(Params::new(1).delay_in(Duration::from_nanos(10)));

        assert!(c.is_eligible(&h));
        assert!(!c.is_ready(&h));
    }

    #[test]
    fn held_back_holder_is_hidden() {
        let groups = HashSet::new();
        let h = holder(Params::new(1));
        let held: HashSet<JobId> = [h.id()].into();
        let c = Constraints {
            now: Timestamp::from_nanos(100),
            network_available: true,
            running_groups: &groups,
            held_back: &held,
        };

        assert!(!c.is_ready(&h));
    }
}
