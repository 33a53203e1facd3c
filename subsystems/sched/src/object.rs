//! # Kernel Object Table
//!
//! Reference-counted storage for scheduling contexts and constraints.
//! Handles are plain keys; the table owns the objects and their lifecycle.

use crate::{SchedError, SchedResult};
use alloc::collections::BTreeMap;

/// Handle type usable as an object-table key
pub trait ObjectKey: Copy + Ord {
    /// Build a handle from its raw value
    fn from_raw(raw: u64) -> Self;

    /// Raw handle value
    fn raw(self) -> u64;
}

/// Lifecycle of a table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Referenced and usable
    Live,
    /// Last user reference dropped; torn down once no internal users remain
    Dying,
}

#[derive(Debug)]
struct Slot<T> {
    object: T,
    refs: usize,
    lifecycle: Lifecycle,
}

/// Table of reference-counted objects with a creation quota
#[derive(Debug)]
pub struct ObjectTable<K, T> {
    slots: BTreeMap<K, Slot<T>>,
    next: u64,
    limit: usize,
}

impl<K: ObjectKey, T> ObjectTable<K, T> {
    /// Create an empty table holding at most `limit` objects
    pub fn new(limit: usize) -> Self {
        Self {
            slots: BTreeMap::new(),
            next: 1,
            limit,
        }
    }

    /// Store a new object with one reference
    pub fn insert(&mut self, object: T) -> SchedResult<K> {
        if self.slots.len() >= self.limit {
            return Err(SchedError::OutOfMemory);
        }
        let key = K::from_raw(self.next);
        self.next += 1;
        self.slots.insert(
            key,
            Slot {
                object,
                refs: 1,
                lifecycle: Lifecycle::Live,
            },
        );
        Ok(key)
    }

    /// Look up an object
    pub fn get(&self, key: K) -> Option<&T> {
        self.slots.get(&key).map(|slot| &slot.object)
    }

    /// Look up an object mutably
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.slots.get_mut(&key).map(|slot| &mut slot.object)
    }

    /// Check whether a handle is valid
    pub fn contains(&self, key: K) -> bool {
        self.slots.contains_key(&key)
    }

    /// Current reference count
    pub fn refs(&self, key: K) -> Option<usize> {
        self.slots.get(&key).map(|slot| slot.refs)
    }

    /// Current lifecycle state
    pub fn lifecycle(&self, key: K) -> Option<Lifecycle> {
        self.slots.get(&key).map(|slot| slot.lifecycle)
    }

    /// Take a reference
    pub fn inc_ref(&mut self, key: K) -> SchedResult<()> {
        let slot = self.slots.get_mut(&key).ok_or(SchedError::NotFound)?;
        slot.refs += 1;
        Ok(())
    }

    /// Drop a reference, returning how many remain
    pub fn dec_ref(&mut self, key: K) -> SchedResult<usize> {
        let slot = self.slots.get_mut(&key).ok_or(SchedError::NotFound)?;
        assert!(slot.refs > 0, "object reference count underflow");
        slot.refs -= 1;
        Ok(slot.refs)
    }

    /// Move an object into the dying state
    pub fn mark_dying(&mut self, key: K) {
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.lifecycle = Lifecycle::Dying;
        }
    }

    /// Remove an object from the table
    pub fn remove(&mut self, key: K) -> Option<T> {
        self.slots.remove(&key).map(|slot| slot.object)
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate over handles and objects in handle order
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().map(|(&key, slot)| (key, &slot.object))
    }

    /// Iterate mutably over handles and objects in handle order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.slots.iter_mut().map(|(&key, slot)| (key, &mut slot.object))
    }
}
