//! Loom tests for the capability-space locking protocol
//!
//! Loom explores every interleaving of the modelled threads. The capability
//! space is shared by all threads of a domain, so the properties that matter
//! are the ones two threads can race on:
//!
//! - two deliveries of the same capability must end up in one index
//! - of two deliveries claiming one id for different objects, exactly one
//!   wins and the other is rejected as forged
//! - concurrent `inc`/`dec` must never release an index that is still held
//!
//! With the `loom` feature [`SpinLock`](crate::sync::SpinLock) is backed by
//! loom's mutex, so these models run the real [`CapabilitySpace`].
//!
//! # Running Loom Tests
//!
//! ```bash
//! cargo test --package keel-kernel-core --features loom -- --test-threads=1 loom
//! ```

#[cfg(all(test, feature = "loom"))]
mod tests {
    use alloc::collections::BTreeMap;

    use loom::sync::{Arc, Mutex};
    use loom::thread;

    use crate::capability::{CapError, CapValidator, CapabilitySpace};
    use crate::types::{CapId, Kcap};

    const WINDOW_A: Kcap = Kcap(100);
    const WINDOW_B: Kcap = Kcap(101);

    /// Kernel table shared by the racing threads: selector -> object.
    #[derive(Clone)]
    struct SharedTable(Arc<Mutex<BTreeMap<Kcap, u64>>>);

    impl SharedTable {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(BTreeMap::new())))
        }

        fn place(&self, kcap: Kcap, object: u64) {
            self.0.lock().unwrap().insert(kcap, object);
        }

        fn get(&self, kcap: Kcap) -> Option<u64> {
            self.0.lock().unwrap().get(&kcap).copied()
        }
    }

    impl CapValidator for SharedTable {
        fn equal(&self, a: Kcap, b: Kcap) -> bool {
            let table = self.0.lock().unwrap();
            match (table.get(&a), table.get(&b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }

        fn valid(&self, kcap: Kcap) -> bool {
            self.0.lock().unwrap().contains_key(&kcap)
        }

        fn map(&mut self, from: Kcap, to: Kcap) -> Result<(), CapError> {
            let mut table = self.0.lock().unwrap();
            if table.contains_key(&to) {
                return Err(CapError::MapFailed);
            }
            let object = table.remove(&from).ok_or(CapError::MapFailed)?;
            table.insert(to, object);
            Ok(())
        }

        fn unmap(&mut self, kcap: Kcap) {
            self.0.lock().unwrap().remove(&kcap);
        }
    }

    fn deliver(
        space: &CapabilitySpace,
        table: &SharedTable,
        id: u64,
        object: u64,
        window: Kcap,
    ) -> Result<crate::CapIndex, CapError> {
        table.place(window, object);
        space.insert_map(CapId(id), window, &mut table.clone())
    }

    /// Test: racing deliveries of one capability share a single index
    #[test]
    fn loom_concurrent_insert_map_single_index() {
        loom::model(|| {
            let space = Arc::new(CapabilitySpace::new(8, 1));
            let table = SharedTable::new();

            let (s1, t1) = (space.clone(), table.clone());
            let (s2, t2) = (space.clone(), table.clone());
            let a = thread::spawn(move || deliver(&s1, &t1, 7, 7, WINDOW_A));
            let b = thread::spawn(move || deliver(&s2, &t2, 7, 7, WINDOW_B));

            let ia = a.join().unwrap().unwrap();
            let ib = b.join().unwrap().unwrap();

            assert_eq!(ia, ib, "same capability must resolve to one index");
            assert_eq!(space.len(), 1);
            assert_eq!(table.get(ia.kcap), Some(7));
        });
    }

    /// Test: one id claimed for two objects, the later claim is forged
    #[test]
    fn loom_conflicting_deliveries_one_forged() {
        loom::model(|| {
            let space = Arc::new(CapabilitySpace::new(8, 1));
            let table = SharedTable::new();

            let (s1, t1) = (space.clone(), table.clone());
            let (s2, t2) = (space.clone(), table.clone());
            let a = thread::spawn(move || deliver(&s1, &t1, 4, 4, WINDOW_A));
            let b = thread::spawn(move || deliver(&s2, &t2, 4, 99, WINDOW_B));

            let ra = a.join().unwrap();
            let rb = b.join().unwrap();

            let (winner, object) = match (ra, rb) {
                (Ok(index), Err(CapError::Forged)) => (index, 4),
                (Err(CapError::Forged), Ok(index)) => (index, 99),
                other => panic!("expected exactly one forged delivery: {:?}", other),
            };
            assert_eq!(space.len(), 1);
            assert_eq!(space.find(CapId(4)), Some(winner));
            assert_eq!(table.get(winner.kcap), Some(object));
        });
    }

    /// Test: an index held by another thread is never released
    #[test]
    fn loom_inc_dec_never_releases_held_index() {
        loom::model(|| {
            let space = Arc::new(CapabilitySpace::new(8, 1));
            let table = SharedTable::new();
            let index = deliver(&space, &table, 3, 3, WINDOW_A).unwrap();

            let s1 = space.clone();
            let (s2, mut t2) = (space.clone(), table.clone());

            // One thread takes a reference, the other drops the original one
            let a = thread::spawn(move || s1.inc(CapId(3)));
            let b = thread::spawn(move || s2.dec(CapId(3), &mut t2));

            let inc = a.join().unwrap();
            let dec = b.join().unwrap();

            match inc {
                // inc ran first: the index survives with one reference
                Ok(2) => {
                    assert_eq!(dec, Ok(1));
                    assert_eq!(space.ref_count(CapId(3)), Some(1));
                    assert_eq!(table.get(index.kcap), Some(3));
                }
                // dec ran first: the index is gone and its selector unmapped
                Err(CapError::NotFound) => {
                    assert_eq!(dec, Ok(0));
                    assert!(space.is_empty());
                    assert_eq!(table.get(index.kcap), None);
                }
                other => panic!("unexpected inc result {:?}", other),
            }
        });
    }
}
