//! Formal invariants for kernel verification
//!
//! Runtime-checkable invariants of the scheduler and the capability space.
//! They are used for:
//! 1. Assertions in tests after every operation sequence
//! 2. Formal verification with Kani
//!
//! # Invariants
//!
//! 1. **List Membership**: every ready job is in the fill rotation exactly
//!    once; every job with quota is in exactly one claim list, the ready one
//!    iff it is ready, at its own priority
//! 2. **Idle Exclusion**: the idle job never appears in any list
//! 3. **Index Uniqueness**: no two capability ids share a selector
//! 4. **Allocator Consistency**: every bound selector is marked used, and no
//!    dynamic selector is marked used without an index

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::capability::CapabilitySpace;
use crate::scheduler::Scheduler;
use crate::types::{CapId, JobId, Kcap, PRIORITY_LEVELS};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

fn violation(invariant: &'static str, description: String) -> InvariantViolation {
    InvariantViolation {
        invariant,
        description,
    }
}

/// Check all scheduler invariants.
pub fn check_scheduler(sched: &Scheduler) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    violations.extend(check_list_membership(sched));
    violations.extend(check_idle_exclusion(sched));
    violations
}

/// Invariant 1: list membership matches readiness and quota
fn check_list_membership(sched: &Scheduler) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (job, share) in &sched.shares {
        let fills = sched.fills.iter().filter(|j| *j == job).count();
        let expected_fills = usize::from(share.ready);
        if fills != expected_fills {
            violations.push(violation(
                "list_membership",
                alloc::format!("{:?} appears {} times in fill rotation", job, fills),
            ));
        }

        let mut ready_hits = 0;
        let mut unready_hits = 0;
        for level in 0..PRIORITY_LEVELS {
            let r = sched.ready_claims[level].iter().filter(|j| *j == job).count();
            let u = sched.unready_claims[level].iter().filter(|j| *j == job).count();
            if (r > 0 || u > 0) && level != share.prio.level() {
                violations.push(violation(
                    "list_membership",
                    alloc::format!("{:?} listed at foreign priority {}", job, level),
                ));
            }
            ready_hits += r;
            unready_hits += u;
        }

        let expected = if share.quota == 0 {
            (0, 0)
        } else if share.ready {
            (1, 0)
        } else {
            (0, 1)
        };
        if (ready_hits, unready_hits) != expected {
            violations.push(violation(
                "list_membership",
                alloc::format!(
                    "{:?} (quota {}, ready {}) in {} ready / {} unready claim lists",
                    job,
                    share.quota,
                    share.ready,
                    ready_hits,
                    unready_hits
                ),
            ));
        }
    }

    let listed = sched
        .fills
        .iter()
        .chain(sched.ready_claims.iter().flatten())
        .chain(sched.unready_claims.iter().flatten());
    for job in listed {
        if *job != sched.idle && !sched.shares.contains_key(job) {
            violations.push(violation(
                "list_membership",
                alloc::format!("{:?} listed but unknown", job),
            ));
        }
    }

    violations
}

/// Invariant 2: the idle job is never listed
fn check_idle_exclusion(sched: &Scheduler) -> Vec<InvariantViolation> {
    let idle: JobId = sched.idle;
    let listed = sched.shares.contains_key(&idle)
        || sched.fills.contains(&idle)
        || sched.ready_claims.iter().any(|l| l.contains(&idle))
        || sched.unready_claims.iter().any(|l| l.contains(&idle));
    if listed {
        alloc::vec![violation(
            "idle_exclusion",
            alloc::format!("idle job {:?} is listed", idle),
        )]
    } else {
        Vec::new()
    }
}

/// Check all capability-space invariants (3 and 4).
pub fn check_capability_space(space: &CapabilitySpace) -> Vec<InvariantViolation> {
    space.inner.with(|map| {
        let mut violations = Vec::new();
        let mut owners: BTreeMap<Kcap, CapId> = BTreeMap::new();

        for (id, entry) in &map.entries {
            if let Some(other) = owners.insert(entry.kcap, *id) {
                violations.push(violation(
                    "index_uniqueness",
                    alloc::format!("{:?} and {:?} share {:?}", other, id, entry.kcap),
                ));
            }
            if !map.alloc.is_used(entry.kcap) {
                violations.push(violation(
                    "allocator_consistency",
                    alloc::format!("{:?} bound to free {:?}", id, entry.kcap),
                ));
            }
        }

        for slot in 0..map.alloc.capacity() {
            let kcap = Kcap(slot as u32);
            if map.alloc.is_used(kcap) && !map.alloc.is_static(kcap) && !owners.contains_key(&kcap) {
                violations.push(violation(
                    "allocator_consistency",
                    alloc::format!("{:?} used without an index", kcap),
                ));
            }
        }

        violations
    })
}
