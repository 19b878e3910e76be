//! Per-core scheduler: strict priority with quota, plus fill rotation
//!
//! # Policy
//!
//! Time is divided into periods. Every job may own a *quota*: microseconds it
//! is guaranteed per period. The unspent part of a quota in the current period
//! is the job's *claim*.
//!
//! ```text
//!  priority 0   ready claims: [A:700] [B:0]        unready claims: [D]
//!  priority 1   ready claims: [C:300]              unready claims: []
//!  ...
//!  fill rotation (all ready jobs):  A -> B -> C -> E
//!  idle job (never listed, always runnable)
//! ```
//!
//! 1. The first job with a non-zero claim at the most important priority runs
//!    until its claim is spent. Within a priority, claimants rotate FIFO.
//! 2. When no ready job has claim left, ready jobs share the remaining time
//!    round-robin in fill slices, regardless of priority.
//! 3. When nothing is ready the idle job runs.
//! 4. When the period elapses every claim is reset to its quota.
//!
//! Jobs without quota are fill-only.
//!
//! # Yield
//!
//! A yielding job keeps whatever claim it has not spent, but goes to the tail
//! of its claim list and of the fill rotation.
//!
//! # Failure semantics
//!
//! Operations never fail. Inserting a job twice, inserting or removing the
//! idle job, or naming a job the scheduler does not know are corrupt-kernel
//! conditions and panic.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::types::{JobId, Priority, PRIORITY_LEVELS};

/// Scheduling parameters of one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Share {
    pub(crate) prio: Priority,
    pub(crate) quota: u64,
    pub(crate) claim: u64,
    pub(crate) fill: u64,
    pub(crate) ready: bool,
}

/// Per-core scheduler.
pub struct Scheduler {
    pub(crate) shares: BTreeMap<JobId, Share>,
    /// Ready jobs with quota, per priority
    pub(crate) ready_claims: Vec<VecDeque<JobId>>,
    /// Blocked jobs with quota, per priority
    pub(crate) unready_claims: Vec<VecDeque<JobId>>,
    /// Every ready job, in fill order
    pub(crate) fills: VecDeque<JobId>,
    pub(crate) idle: JobId,
    /// `None` after the current job was removed, until the next update
    head: Option<JobId>,
    head_quota: u64,
    head_claims: bool,
    head_yields: bool,
    period: u64,
    residual: u64,
    fill: u64,
    need_to_schedule: bool,
    last_time: u64,
}

fn unlink(list: &mut VecDeque<JobId>, job: JobId) -> bool {
    match list.iter().position(|j| *j == job) {
        Some(pos) => {
            list.remove(pos);
            true
        }
        None => false,
    }
}

fn rotate(list: &mut VecDeque<JobId>, job: JobId) {
    if unlink(list, job) {
        list.push_back(job);
    }
}

impl Scheduler {
    /// Create a scheduler whose idle job is `idle`.
    ///
    /// `period` is the length of one accounting period and `fill` the slice
    /// granted per turn in the fill rotation, both in microseconds.
    pub fn new(idle: JobId, period: u64, fill: u64) -> Self {
        assert!(period > 0 && fill > 0, "scheduler needs a period and a fill slice");
        Self {
            shares: BTreeMap::new(),
            ready_claims: (0..PRIORITY_LEVELS).map(|_| VecDeque::new()).collect(),
            unready_claims: (0..PRIORITY_LEVELS).map(|_| VecDeque::new()).collect(),
            fills: VecDeque::new(),
            idle,
            head: None,
            head_quota: fill,
            head_claims: false,
            head_yields: false,
            period,
            residual: period,
            fill,
            need_to_schedule: true,
            last_time: 0,
        }
    }

    fn share(&self, job: JobId) -> &Share {
        match self.shares.get(&job) {
            Some(share) => share,
            None => panic!("scheduler: unknown job {:?}", job),
        }
    }

    fn share_mut(&mut self, job: JobId) -> &mut Share {
        match self.shares.get_mut(&job) {
            Some(share) => share,
            None => panic!("scheduler: unknown job {:?}", job),
        }
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Add a blocked job.
    pub fn insert(&mut self, job: JobId, prio: Priority, quota: u64) {
        assert!(job != self.idle, "scheduler: idle job is never inserted");
        assert!(
            !self.shares.contains_key(&job),
            "scheduler: job {:?} inserted twice",
            job
        );
        self.shares.insert(
            job,
            Share {
                prio,
                quota,
                claim: quota,
                fill: self.fill,
                ready: false,
            },
        );
        if quota > 0 {
            self.unready_claims[prio.level()].push_back(job);
        }
    }

    /// Drop a job from every list.
    ///
    /// Removing the current job forces a reschedule; `head()` reports the idle
    /// job until the next `update`.
    pub fn remove(&mut self, job: JobId) {
        assert!(job != self.idle, "scheduler: idle job is never removed");
        let share = match self.shares.remove(&job) {
            Some(share) => share,
            None => panic!("scheduler: removing unknown job {:?}", job),
        };
        if self.head == Some(job) {
            self.head = None;
            self.need_to_schedule = true;
        }
        if share.ready {
            unlink(&mut self.fills, job);
        }
        if share.quota > 0 {
            let lists = if share.ready {
                &mut self.ready_claims
            } else {
                &mut self.unready_claims
            };
            unlink(&mut lists[share.prio.level()], job);
        }
    }

    /// Mark a job runnable. No-op if it already is.
    pub fn ready(&mut self, job: JobId) {
        assert!(job != self.idle, "scheduler: idle job is always ready");
        let fill = self.fill;
        let share = self.share_mut(job);
        if share.ready {
            return;
        }
        share.ready = true;
        share.fill = fill;
        let (prio, quota) = (share.prio, share.quota);

        self.fills.push_back(job);
        if quota > 0 {
            unlink(&mut self.unready_claims[prio.level()], job);
            self.ready_claims[prio.level()].push_back(job);
        }
        if self.ready_check(job) {
            self.need_to_schedule = true;
        }
    }

    /// Withdraw a job from competition. No-op if it is not ready.
    pub fn unready(&mut self, job: JobId) {
        assert!(job != self.idle, "scheduler: idle job is always ready");
        let share = self.share_mut(job);
        if !share.ready {
            return;
        }
        share.ready = false;
        let (prio, quota) = (share.prio, share.quota);

        if self.head == Some(job) {
            self.need_to_schedule = true;
        }
        unlink(&mut self.fills, job);
        if quota > 0 {
            unlink(&mut self.ready_claims[prio.level()], job);
            self.unready_claims[prio.level()].push_back(job);
        }
    }

    /// End the current job's turn at the next `update`.
    pub fn yield_now(&mut self) {
        self.head_yields = true;
        self.need_to_schedule = true;
    }

    /// Whether a newly ready `job` should preempt the current head.
    fn ready_check(&self, job: JobId) -> bool {
        let head = match self.head {
            Some(head) if head != self.idle => head,
            _ => return true,
        };
        let s1 = self.share(job);
        if s1.claim == 0 {
            return false;
        }
        if !self.head_claims {
            return true;
        }
        let s2 = self.share(head);
        if s1.prio != s2.prio {
            return s1.prio.outranks(s2.prio);
        }
        let list = &self.ready_claims[s1.prio.level()];
        let pos = |j: JobId| list.iter().position(|x| *x == j);
        match (pos(head), pos(job)) {
            (Some(h), Some(s)) => s < h,
            _ => true,
        }
    }

    // ========================================================================
    // Parameters
    // ========================================================================

    /// Change a job's quota.
    ///
    /// Lowering the quota trims the current claim. A job gaining its first
    /// quota joins the claim lists and is granted a claim with the next
    /// period. Setting zero makes the job fill-only.
    pub fn set_quota(&mut self, job: JobId, quota: u64) {
        assert!(job != self.idle, "scheduler: idle job has no quota");
        let share = self.share_mut(job);
        let (prio, ready, old) = (share.prio, share.ready, share.quota);
        share.quota = quota;

        if old > 0 && quota > 0 {
            share.claim = share.claim.min(quota);
        } else if old > 0 {
            share.claim = 0;
            let lists = if ready {
                &mut self.ready_claims
            } else {
                &mut self.unready_claims
            };
            unlink(&mut lists[prio.level()], job);
        } else if quota > 0 {
            share.claim = 0;
            let lists = if ready {
                &mut self.ready_claims
            } else {
                &mut self.unready_claims
            };
            lists[prio.level()].push_back(job);
        }
        if self.head == Some(job) {
            self.need_to_schedule = true;
        }
    }

    /// Move a job to another priority.
    pub fn set_priority(&mut self, job: JobId, prio: Priority) {
        assert!(job != self.idle, "scheduler: idle job has no priority");
        let share = self.share_mut(job);
        let (old, ready, quota) = (share.prio, share.ready, share.quota);
        if old == prio {
            return;
        }
        share.prio = prio;
        if quota > 0 {
            let lists = if ready {
                &mut self.ready_claims
            } else {
                &mut self.unready_claims
            };
            unlink(&mut lists[old.level()], job);
            lists[prio.level()].push_back(job);
        }
        if ready || self.head == Some(job) {
            self.need_to_schedule = true;
        }
    }

    // ========================================================================
    // Accounting
    // ========================================================================

    /// Account the time since the last update and pick the next head.
    ///
    /// `now` is the core's monotonic time in microseconds.
    pub fn update(&mut self, now: u64) {
        let mut consumed = now.saturating_sub(self.last_time);
        self.last_time = now;
        self.need_to_schedule = false;

        if let Some(head) = self.head {
            let yielded = core::mem::take(&mut self.head_yields);
            let left = self.trim_consumption(&mut consumed);
            if self.head_claims {
                self.head_claimed(head, left, yielded);
            } else {
                self.head_filled(head, left, yielded);
            }
        }
        self.head_yields = false;
        self.consumed(consumed);

        if self.claim_for_head() {
            return;
        }
        if self.fill_for_head() {
            return;
        }
        self.set_head(self.idle, self.fill, false);
    }

    /// Clip `consumed` to what the head was granted; returns the unused rest.
    fn trim_consumption(&self, consumed: &mut u64) -> u64 {
        *consumed = (*consumed).min(self.head_quota).min(self.residual);
        self.head_quota - *consumed
    }

    fn head_claimed(&mut self, head: JobId, left: u64, yielded: bool) {
        let Some(share) = self.shares.get_mut(&head) else {
            return;
        };
        if share.quota == 0 {
            return;
        }
        share.claim = left.min(share.quota);
        if share.ready && (share.claim == 0 || yielded) {
            rotate(&mut self.ready_claims[share.prio.level()], head);
        }
        if yielded {
            self.head_filled(head, 0, true);
        }
    }

    fn head_filled(&mut self, head: JobId, left: u64, yielded: bool) {
        if self.fills.front() != Some(&head) {
            return;
        }
        if left > 0 && !yielded {
            if let Some(share) = self.shares.get_mut(&head) {
                share.fill = left;
            }
            return;
        }
        self.next_fill();
    }

    fn next_fill(&mut self) {
        if let Some(job) = self.fills.pop_front() {
            if let Some(share) = self.shares.get_mut(&job) {
                share.fill = self.fill;
            }
            self.fills.push_back(job);
        }
    }

    fn consumed(&mut self, consumed: u64) {
        if self.residual > consumed {
            self.residual -= consumed;
        } else {
            self.next_round();
        }
    }

    fn next_round(&mut self) {
        self.residual = self.period;
        for share in self.shares.values_mut() {
            share.claim = share.quota;
        }
    }

    fn claim_for_head(&mut self) -> bool {
        for level in 0..PRIORITY_LEVELS {
            let found = self.ready_claims[level]
                .iter()
                .map(|job| (*job, self.share(*job).claim))
                .find(|(_, claim)| *claim > 0);
            if let Some((job, claim)) = found {
                self.set_head(job, claim, true);
                return true;
            }
        }
        false
    }

    fn fill_for_head(&mut self) -> bool {
        let Some(&job) = self.fills.front() else {
            return false;
        };
        let fill = self.share(job).fill;
        self.set_head(job, fill, false);
        true
    }

    fn set_head(&mut self, job: JobId, quota: u64, claims: bool) {
        self.head = Some(job);
        self.head_quota = quota;
        self.head_claims = claims;
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Job chosen by the last update.
    pub fn head(&self) -> JobId {
        self.head.unwrap_or(self.idle)
    }

    /// Time to grant the head before the next update.
    pub fn head_quota(&self) -> u64 {
        self.head_quota.min(self.residual)
    }

    /// Whether the head runs on its claim (as opposed to a fill slice).
    pub fn head_is_claiming(&self) -> bool {
        self.head_claims
    }

    /// Whether the current head is no longer the best choice.
    pub fn need_to_schedule(&self) -> bool {
        self.need_to_schedule
    }

    /// The core's idle job.
    pub fn idle(&self) -> JobId {
        self.idle
    }

    /// Time left in the current period.
    pub fn residual(&self) -> u64 {
        self.residual
    }

    /// Configured period length.
    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn contains(&self, job: JobId) -> bool {
        self.shares.contains_key(&job)
    }

    pub fn is_ready(&self, job: JobId) -> bool {
        job == self.idle || self.shares.get(&job).is_some_and(|s| s.ready)
    }

    pub fn claim(&self, job: JobId) -> Option<u64> {
        self.shares.get(&job).map(|s| s.claim)
    }

    pub fn quota(&self, job: JobId) -> Option<u64> {
        self.shares.get(&job).map(|s| s.quota)
    }

    pub fn priority(&self, job: JobId) -> Option<Priority> {
        self.shares.get(&job).map(|s| s.prio)
    }

    /// Number of jobs, not counting idle.
    pub fn len(&self) -> usize {
        self.shares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }
}

// ============================================================================
// Kani Proofs
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: the granted slice never outlasts the period
    #[kani::proof]
    #[kani::unwind(4)]
    fn head_quota_bounded_by_residual() {
        let period: u64 = kani::any();
        let fill: u64 = kani::any();
        kani::assume(period > 0 && period < 10_000);
        kani::assume(fill > 0 && fill <= period);
        let quota: u64 = kani::any();
        kani::assume(quota <= period);

        let mut sched = Scheduler::new(JobId(0), period, fill);
        sched.insert(JobId(1), Priority::HIGHEST, quota);
        sched.ready(JobId(1));

        let t: u64 = kani::any();
        kani::assume(t < 2 * period);
        sched.update(t);

        kani::assert(
            sched.head_quota() <= sched.residual(),
            "head quota must fit into the period",
        );
    }
}
