//! Per-domain capability space
//!
//! A domain names kernel objects by [`CapId`]. The capability space maps each
//! id to a *capability index*: a selector ([`Kcap`]) in the domain's kernel
//! capability table plus a reference count.
//!
//! ```text
//!   CapabilitySpace (one per domain, behind a SpinLock)
//!   ┌───────────────────────────────────────────┐
//!   │ BTreeMap<CapId, Entry { kcap, refs }>     │      kernel capability table
//!   │   CapId(17) ──▶ Kcap(9)  refs 2  ─────────┼────▶ [9] → object 17
//!   │   CapId(40) ──▶ Kcap(12) refs 1  ─────────┼────▶ [12] → object 40
//!   │ CapIndexAllocator (which selectors are    │
//!   │   taken, which are kernel-owned)          │
//!   └───────────────────────────────────────────┘
//! ```
//!
//! # Security Properties (Verification Targets)
//!
//! 1. **Uniqueness**: an id maps to exactly one index and no two ids share a
//!    selector.
//! 2. **No Spoofing**: a delegated capability claiming an id the domain already
//!    holds is only accepted if the kernel confirms both name the same object.
//! 3. **Clean Failure**: a failed delegation leaves the space unchanged.
//!
//! The table itself belongs to the kernel and is reached through the
//! [`CapValidator`] trait, so this module stays free of kernel object types.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::sync::SpinLock;
use crate::types::{CapId, Kcap};

/// Reference count reported for kernel-owned indices.
pub const STATIC_REF_COUNT: u32 = 1;

/// Errors returned by capability-space operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CapError {
    /// Id already has an index in this space
    #[error("capability id already bound")]
    AlreadyBound,
    /// No free selector left
    #[error("capability space exhausted")]
    Exhausted,
    /// Requested selector is held by another index
    #[error("selector already in use")]
    SlotInUse,
    /// Selector outside the space's range
    #[error("selector out of range")]
    OutOfRange,
    /// Id has no index in this space
    #[error("capability not found")]
    NotFound,
    /// Delegated capability claims an id bound to a different live object
    #[error("forged capability")]
    Forged,
    /// Kernel refused to map the delegated capability
    #[error("low-level map failed")]
    MapFailed,
    /// Reference count would overflow
    #[error("reference count overflow")]
    RefCountOverflow,
}

/// Kernel-side checks and mapping behind a domain's capability table.
pub trait CapValidator {
    /// Whether both selectors reference the same live kernel object.
    fn equal(&self, a: Kcap, b: Kcap) -> bool;

    /// Whether the selector references a live kernel object.
    fn valid(&self, kcap: Kcap) -> bool;

    /// Move the capability at `from` to the empty selector `to`.
    fn map(&mut self, from: Kcap, to: Kcap) -> Result<(), CapError>;

    /// Drop whatever the selector references.
    fn unmap(&mut self, kcap: Kcap);
}

/// Snapshot of one capability index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapIndex {
    /// Id the index is filed under
    pub id: CapId,
    /// Selector in the kernel capability table
    pub kcap: Kcap,
}

// ============================================================================
// Index allocator
// ============================================================================

/// Tracks which selectors of a space are in use.
///
/// Selectors `0..static_slots` are kernel-owned: they are only handed out by
/// [`CapIndexAllocator::alloc_at`] and are exempt from reference counting.
pub struct CapIndexAllocator {
    used: Vec<bool>,
    static_slots: usize,
    /// Lowest selector that may be free
    hint: usize,
}

impl CapIndexAllocator {
    /// Allocator for `capacity` selectors, the first `static_slots` reserved.
    pub fn new(capacity: usize, static_slots: usize) -> Self {
        assert!(static_slots <= capacity, "static range larger than space");
        Self {
            used: vec![false; capacity],
            static_slots,
            hint: static_slots,
        }
    }

    /// Take the lowest free dynamic selector.
    pub fn alloc(&mut self) -> Result<Kcap, CapError> {
        let start = self.hint.max(self.static_slots);
        let slot = (start..self.used.len())
            .find(|&i| !self.used[i])
            .ok_or(CapError::Exhausted)?;
        self.used[slot] = true;
        self.hint = slot + 1;
        Ok(Kcap(slot as u32))
    }

    /// Take a specific selector, static or dynamic.
    pub fn alloc_at(&mut self, kcap: Kcap) -> Result<(), CapError> {
        let slot = kcap.0 as usize;
        match self.used.get_mut(slot) {
            None => Err(CapError::OutOfRange),
            Some(true) => Err(CapError::SlotInUse),
            Some(used) => {
                *used = true;
                Ok(())
            }
        }
    }

    /// Return a selector.
    pub fn free(&mut self, kcap: Kcap) {
        let slot = kcap.0 as usize;
        if let Some(used) = self.used.get_mut(slot) {
            *used = false;
            if slot >= self.static_slots {
                self.hint = self.hint.min(slot);
            }
        }
    }

    /// Whether the selector is kernel-owned.
    pub fn is_static(&self, kcap: Kcap) -> bool {
        (kcap.0 as usize) < self.static_slots
    }

    pub fn is_used(&self, kcap: Kcap) -> bool {
        self.used.get(kcap.0 as usize).copied().unwrap_or(false)
    }

    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    /// Selectors currently handed out.
    pub fn in_use(&self) -> usize {
        self.used.iter().filter(|u| **u).count()
    }
}

// ============================================================================
// Capability space
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub(crate) struct Entry {
    pub(crate) kcap: Kcap,
    pub(crate) refs: u32,
}

pub(crate) struct CapMap {
    pub(crate) entries: BTreeMap<CapId, Entry>,
    pub(crate) alloc: CapIndexAllocator,
}

impl CapMap {
    fn index(id: CapId, entry: &Entry) -> CapIndex {
        CapIndex {
            id,
            kcap: entry.kcap,
        }
    }

    /// Remove the entry for `id`, releasing its selector.
    fn drop_entry(&mut self, id: CapId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.alloc.free(entry.kcap);
        Some(entry)
    }
}

/// Per-domain capability space.
///
/// All operations take `&self` and serialize on an internal spinlock. No
/// operation blocks or calls out of the module while holding it, except for
/// the short [`CapValidator`] callbacks.
pub struct CapabilitySpace {
    pub(crate) inner: SpinLock<CapMap>,
}

impl CapabilitySpace {
    /// Space with `capacity` selectors, the first `static_slots` kernel-owned.
    pub fn new(capacity: usize, static_slots: usize) -> Self {
        Self {
            inner: SpinLock::new(CapMap {
                entries: BTreeMap::new(),
                alloc: CapIndexAllocator::new(capacity, static_slots),
            }),
        }
    }

    /// Look up the index filed under `id`.
    pub fn find(&self, id: CapId) -> Option<CapIndex> {
        self.inner
            .with(|map| map.entries.get(&id).map(|e| CapMap::index(id, e)))
    }

    /// Bind `id` to a fresh selector.
    pub fn insert(&self, id: CapId) -> Result<CapIndex, CapError> {
        self.inner.with(|map| {
            if map.entries.contains_key(&id) {
                return Err(CapError::AlreadyBound);
            }
            let kcap = map.alloc.alloc()?;
            let entry = Entry { kcap, refs: 1 };
            map.entries.insert(id, entry);
            Ok(CapMap::index(id, &entry))
        })
    }

    /// Bind `id` to the selector `kcap`, which the kernel already filled.
    ///
    /// Any previous index for `id` is replaced, and a replaced dynamic
    /// selector is unmapped through `validator`. Used for capabilities the
    /// kernel constructs itself, typically in the static range.
    pub fn insert_kcap<V>(&self, id: CapId, kcap: Kcap, validator: &mut V) -> Result<CapIndex, CapError>
    where
        V: CapValidator + ?Sized,
    {
        self.inner.with(|map| {
            let previous = map.drop_entry(id);
            if let Err(e) = map.alloc.alloc_at(kcap) {
                if let Some(prev) = previous {
                    let _ = map.alloc.alloc_at(prev.kcap);
                    map.entries.insert(id, prev);
                }
                return Err(e);
            }
            if let Some(prev) = previous.filter(|p| p.kcap != kcap && !map.alloc.is_static(p.kcap)) {
                validator.unmap(prev.kcap);
            }
            let entry = Entry { kcap, refs: 1 };
            map.entries.insert(id, entry);
            Ok(CapMap::index(id, &entry))
        })
    }

    /// Accept a capability delegated from another domain.
    ///
    /// `kcap` is the selector the kernel placed the incoming capability at
    /// (the receive window). The outcome is one of:
    ///
    /// - `id` is known and the kernel confirms it names the same object: the
    ///   existing index is returned unchanged
    /// - `id` is known, names a different object, and that object is still
    ///   alive: the delegation is a spoof and fails with [`CapError::Forged`]
    /// - `id` is unknown, or known but stale: a new selector is allocated and
    ///   the capability is mapped there, replacing the stale index
    ///
    /// The receive window stays owned by the caller. On any error the space
    /// is unchanged.
    pub fn insert_map<V>(&self, id: CapId, kcap: Kcap, validator: &mut V) -> Result<CapIndex, CapError>
    where
        V: CapValidator + ?Sized,
    {
        self.inner.with(|map| {
            let stale = match map.entries.get(&id) {
                Some(entry) if validator.equal(entry.kcap, kcap) => {
                    return Ok(CapMap::index(id, entry));
                }
                Some(entry) if validator.valid(entry.kcap) => {
                    return Err(CapError::Forged);
                }
                Some(entry) => Some(entry.kcap),
                None => None,
            };

            let slot = map.alloc.alloc()?;
            if let Err(e) = validator.map(kcap, slot) {
                map.alloc.free(slot);
                return Err(e);
            }

            if let Some(old) = stale {
                map.drop_entry(id);
                if !map.alloc.is_static(old) {
                    validator.unmap(old);
                }
            }
            let entry = Entry { kcap: slot, refs: 1 };
            map.entries.insert(id, entry);
            Ok(CapMap::index(id, &entry))
        })
    }

    /// Take an additional reference. Returns the new count.
    pub fn inc(&self, id: CapId) -> Result<u32, CapError> {
        self.inner.with(|map| {
            let entry = map.entries.get_mut(&id).ok_or(CapError::NotFound)?;
            if map.alloc.is_static(entry.kcap) {
                return Ok(STATIC_REF_COUNT);
            }
            entry.refs = entry.refs.checked_add(1).ok_or(CapError::RefCountOverflow)?;
            Ok(entry.refs)
        })
    }

    /// Drop a reference. Returns the remaining count.
    ///
    /// At zero the index is removed and its selector unmapped.
    pub fn dec<V>(&self, id: CapId, validator: &mut V) -> Result<u32, CapError>
    where
        V: CapValidator + ?Sized,
    {
        self.inner.with(|map| {
            let entry = map.entries.get_mut(&id).ok_or(CapError::NotFound)?;
            let kcap = entry.kcap;
            if map.alloc.is_static(kcap) {
                return Ok(STATIC_REF_COUNT);
            }
            entry.refs = entry.refs.saturating_sub(1);
            let refs = entry.refs;
            if refs == 0 {
                map.drop_entry(id);
                validator.unmap(kcap);
            }
            Ok(refs)
        })
    }

    /// Remove the index for `id` regardless of its count.
    ///
    /// The caller is responsible for the selector's table entry.
    pub fn remove(&self, id: CapId) -> Option<CapIndex> {
        self.inner
            .with(|map| map.drop_entry(id).map(|e| CapMap::index(id, &e)))
    }

    /// Current reference count of `id`.
    pub fn ref_count(&self, id: CapId) -> Option<u32> {
        self.inner.with(|map| {
            let entry = map.entries.get(&id)?;
            if map.alloc.is_static(entry.kcap) {
                Some(STATIC_REF_COUNT)
            } else {
                Some(entry.refs)
            }
        })
    }

    /// Whether `kcap` is in the kernel-owned range.
    pub fn is_static(&self, kcap: Kcap) -> bool {
        self.inner.with(|map| map.alloc.is_static(kcap))
    }

    /// All ids, ascending.
    pub fn ids(&self) -> Vec<CapId> {
        self.inner.with(|map| map.entries.keys().copied().collect())
    }

    /// All indices, ascending by id.
    pub fn list(&self) -> Vec<CapIndex> {
        self.inner.with(|map| {
            map.entries
                .iter()
                .map(|(id, e)| CapMap::index(*id, e))
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.inner.with(|map| map.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Kani Proofs
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    struct NeverEqual;

    impl CapValidator for NeverEqual {
        fn equal(&self, _a: Kcap, _b: Kcap) -> bool {
            false
        }
        fn valid(&self, _kcap: Kcap) -> bool {
            true
        }
        fn map(&mut self, _from: Kcap, _to: Kcap) -> Result<(), CapError> {
            Ok(())
        }
        fn unmap(&mut self, _kcap: Kcap) {}
    }

    /// Proof: a live binding can never be overwritten by a delegation
    #[kani::proof]
    #[kani::unwind(6)]
    fn no_spoofed_rebinding() {
        let space = CapabilitySpace::new(4, 1);
        let id = CapId(kani::any());
        let original = space.insert(id);
        kani::assume(original.is_ok());

        let window = Kcap(kani::any());
        let result = space.insert_map(id, window, &mut NeverEqual);

        kani::assert(
            matches!(result, Err(CapError::Forged)),
            "live binding must reject foreign delegation",
        );
        kani::assert(
            space.find(id).map(|i| i.kcap) == original.ok().map(|i| i.kcap),
            "space must be unchanged",
        );
    }
}
