//! Committed row versions.

use std::collections::HashMap;

use bytes::Bytes;
use commitlock_common::types::{Oid, Tid};
use parking_lot::RwLock;

/// The committed state of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Version that wrote the data.
    pub tid: Tid,
    /// Object data.
    pub data: Bytes,
}

#[derive(Debug, Default)]
struct StoreInner {
    rows: HashMap<Oid, StoredRow>,
    last_tid: Tid,
}

/// Committed rows, versioned by a monotonically increasing [`Tid`].
#[derive(Debug, Default)]
pub struct RowStore {
    inner: RwLock<StoreInner>,
}

impl RowStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed version of `oid`, if it exists.
    pub fn current_tid(&self, oid: Oid) -> Option<Tid> {
        self.inner.read().rows.get(&oid).map(|row| row.tid)
    }

    /// Returns the committed versions of `oids`, in order.
    pub fn current_tids(&self, oids: &[Oid]) -> Vec<(Oid, Option<Tid>)> {
        let inner = self.inner.read();
        oids.iter()
            .map(|oid| (*oid, inner.rows.get(oid).map(|row| row.tid)))
            .collect()
    }

    /// Returns the committed row for `oid`.
    pub fn get(&self, oid: Oid) -> Option<StoredRow> {
        self.inner.read().rows.get(&oid).cloned()
    }

    /// Writes every row under one newly allocated version.
    pub fn apply(&self, writes: &[(Oid, Bytes)]) -> Tid {
        let mut inner = self.inner.write();
        let tid = inner.last_tid.next();
        inner.last_tid = tid;
        for (oid, data) in writes {
            inner.rows.insert(
                *oid,
                StoredRow {
                    tid,
                    data: data.clone(),
                },
            );
        }
        tid
    }

    /// Returns the most recently allocated version.
    pub fn last_tid(&self) -> Tid {
        self.inner.read().last_tid
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.inner.read().rows.len()
    }

    /// Returns true if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_allocates_monotonic_tids() {
        let store = RowStore::new();
        assert!(store.is_empty());
        assert_eq!(store.current_tid(Oid::new(1)), None);

        let first = store.apply(&[(Oid::new(1), Bytes::from_static(b"a"))]);
        let second = store.apply(&[
            (Oid::new(1), Bytes::from_static(b"b")),
            (Oid::new(2), Bytes::from_static(b"c")),
        ]);
        assert!(second > first);
        assert_eq!(store.last_tid(), second);
        assert_eq!(store.current_tid(Oid::new(1)), Some(second));
        assert_eq!(store.get(Oid::new(1)).unwrap().data, Bytes::from_static(b"b"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_current_tids_keeps_order() {
        let store = RowStore::new();
        let tid = store.apply(&[(Oid::new(2), Bytes::new())]);
        assert_eq!(
            store.current_tids(&[Oid::new(2), Oid::new(1)]),
            vec![(Oid::new(2), Some(tid)), (Oid::new(1), None)]
        );
    }
}
