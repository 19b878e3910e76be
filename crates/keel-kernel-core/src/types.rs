//! Core kernel types
//!
//! Identifiers are plain newtypes over integers: they are handles into
//! kernel-owned tables, never pointers, so a job migrating between cores or a
//! destroyed object can never leave a dangling reference behind.

use serde::{Deserialize, Serialize};

/// Stable handle of a schedulable job (thread or virtual CPU).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

/// Protection domain identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u64);

/// Name of a capability as used in a domain's capability space.
///
/// The kernel assigns one id per kernel object when the object is created.
/// Every domain holding a capability to the object files it under this id,
/// which is what lets a receiver recognise a capability it already owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapId(pub u64);

/// Selector in a domain's kernel capability table.
///
/// This is where the kernel keeps the actual reference to the target object.
/// It is meaningless outside the domain that owns the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Kcap(pub u32);

/// Caller identity attached to an IPC request by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Badge(pub u64);

impl From<JobId> for Badge {
    fn from(job: JobId) -> Self {
        Badge(job.0)
    }
}

/// Number of scheduling priority levels.
pub const PRIORITY_LEVELS: usize = 4;

/// Scheduling priority. Lower values are more important.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    /// Most important priority
    pub const HIGHEST: Priority = Priority(0);
    /// Least important priority
    pub const LOWEST: Priority = Priority(PRIORITY_LEVELS as u8 - 1);

    /// Exact priority, or `None` if out of range.
    pub fn new(level: u8) -> Option<Self> {
        if (level as usize) < PRIORITY_LEVELS {
            Some(Priority(level))
        } else {
            None
        }
    }

    /// Priority clamped into the valid range.
    pub fn clamped(level: u32) -> Self {
        Priority(level.min(Self::LOWEST.0 as u32) as u8)
    }

    /// Index of this priority's lists.
    pub fn level(self) -> usize {
        self.0 as usize
    }

    /// Whether `self` is strictly more important than `other`.
    pub fn outranks(self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::LOWEST
    }
}
