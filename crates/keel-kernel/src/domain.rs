//! Protection domains and their kernel capability tables
//!
//! Every domain owns two views of the capabilities it holds:
//!
//! - a [`CapabilitySpace`]: object name ([`CapId`]) to selector ([`Kcap`]),
//!   the view the domain's threads use
//! - a [`KcapTable`]: selector to kernel object, the kernel's authoritative
//!   record and the thing that costs kernel metadata
//!
//! A [`DomainView`] ties a domain's table to the global object registry and
//! validates capabilities for the space's anti-spoofing checks.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;

use keel_kernel_core::{
    CapError, CapId, CapValidator, CapabilitySpace, DomainId, IpcError, JobId, Kcap,
    MAX_CAPS_PER_MESSAGE,
};

/// First selector used as a receive window. Windows sit far above any
/// space's selector range so they never collide with allocated indices.
pub const RECEIVE_WINDOW_BASE: u32 = 0xFFFF_0000;

/// Kernel objects a capability can name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelObject {
    Thread(JobId),
    Domain(DomainId),
}

/// Per-domain map from selector to kernel object.
#[derive(Debug)]
pub struct KcapTable {
    slots: BTreeMap<Kcap, CapId>,
    limit: usize,
    reserved: usize,
    next_window: u32,
}

impl KcapTable {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: BTreeMap::new(),
            limit,
            reserved: 0,
            next_window: 0,
        }
    }

    /// Record a kernel-created object under `kcap`.
    pub fn install(&mut self, kcap: Kcap, object: CapId) {
        self.slots.insert(kcap, object);
    }

    pub fn get(&self, kcap: Kcap) -> Option<CapId> {
        self.slots.get(&kcap).copied()
    }

    pub fn remove(&mut self, kcap: Kcap) -> Option<CapId> {
        self.slots.remove(&kcap)
    }

    /// Reserve metadata for `count` capabilities still to arrive.
    pub fn reserve(&mut self, count: usize) -> Result<(), IpcError> {
        if self.slots.len() + self.reserved + count > self.limit {
            return Err(IpcError::OutOfMetadata);
        }
        self.reserved += count;
        Ok(())
    }

    pub fn release(&mut self, count: usize) {
        self.reserved = self.reserved.saturating_sub(count);
    }

    /// Grow the metadata limit by `slots`.
    pub fn upgrade(&mut self, slots: usize) {
        self.limit += slots;
    }

    /// Place an incoming object into a fresh receive window.
    pub fn place_window(&mut self, object: CapId) -> Kcap {
        let kcap = Kcap(RECEIVE_WINDOW_BASE + self.next_window);
        self.next_window = (self.next_window + 1) % MAX_CAPS_PER_MESSAGE as u32;
        self.slots.insert(kcap, object);
        kcap
    }

    /// Metadata slots neither used nor reserved.
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.slots.len() + self.reserved)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }
}

/// Validator over one domain's table and the live objects.
pub struct DomainView<'a> {
    pub table: &'a mut KcapTable,
    pub objects: &'a BTreeMap<CapId, KernelObject>,
}

impl DomainView<'_> {
    fn live(&self, kcap: Kcap) -> Option<CapId> {
        self.table
            .get(kcap)
            .filter(|object| self.objects.contains_key(object))
    }
}

impl CapValidator for DomainView<'_> {
    fn equal(&self, a: Kcap, b: Kcap) -> bool {
        match (self.live(a), self.live(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    fn valid(&self, kcap: Kcap) -> bool {
        self.live(kcap).is_some()
    }

    fn map(&mut self, from: Kcap, to: Kcap) -> Result<(), CapError> {
        if self.table.get(to).is_some() {
            return Err(CapError::MapFailed);
        }
        let object = self.table.remove(from).ok_or(CapError::MapFailed)?;
        self.table.install(to, object);
        Ok(())
    }

    fn unmap(&mut self, kcap: Kcap) {
        self.table.remove(kcap);
    }
}

/// A protection domain.
pub struct Domain {
    pub id: DomainId,
    pub name: String,
    /// Object name of the domain itself
    pub cap_id: CapId,
    pub space: CapabilitySpace,
    pub table: KcapTable,
    /// Execution time per period available to all threads (microseconds)
    pub quota_ceiling: u64,
    /// Execution time per period handed out to threads
    pub quota_assigned: u64,
    /// Metadata slots still obtainable through upgrades
    pub metadata_budget: usize,
    pub threads: BTreeSet<JobId>,
    /// Exception handler for threads without their own
    pub exception_handler: Option<JobId>,
}

impl Domain {
    /// Quota still available for new or growing threads.
    pub fn quota_headroom(&self) -> u64 {
        self.quota_ceiling.saturating_sub(self.quota_assigned)
    }

    /// Resolve a capability held by this domain to its live object.
    pub fn resolve(&self, id: CapId, objects: &BTreeMap<CapId, KernelObject>) -> Option<CapId> {
        let index = self.space.find(id)?;
        self.table
            .get(index.kcap)
            .filter(|object| objects.contains_key(object))
    }
}
