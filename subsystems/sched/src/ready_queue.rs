//! # Ready Queue
//!
//! Per-CPU priority-indexed queue of runnable scheduling contexts.
//!
//! Each priority owns a doubly linked bucket. Links live in a table keyed by
//! the context handle, so a context is queued exactly when it has a link
//! entry; there is no separate "queued" flag to get out of sync. The highest
//! non-empty priority is cached and only ever walks downwards on dequeue.

use crate::priority::{Priority, PRIORITIES};
use crate::ScId;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

/// Where to insert into a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Head of the bucket (runs next among its peers)
    Front,
    /// Tail of the bucket
    Back,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    prio: Priority,
    prev: Option<ScId>,
    next: Option<ScId>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    head: Option<ScId>,
    tail: Option<ScId>,
    len: usize,
}

/// Ready queue of one CPU
#[derive(Debug)]
pub struct ReadyQueue {
    links: BTreeMap<ScId, Link>,
    buckets: Vec<Bucket>,
    highest: u8,
    active: Option<(ScId, Priority)>,
}

impl ReadyQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            links: BTreeMap::new(),
            buckets: vec![Bucket::default(); PRIORITIES],
            highest: 0,
            active: None,
        }
    }

    /// Check whether `sc` is queued here
    #[inline]
    pub fn is_queued(&self, sc: ScId) -> bool {
        self.links.contains_key(&sc)
    }

    /// Number of queued contexts
    #[inline]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Check whether nothing is queued
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Cached highest non-empty priority (0 when empty)
    #[inline]
    pub fn highest(&self) -> Priority {
        Priority::new(self.highest)
    }

    /// Priority under which `sc` is queued
    pub fn queued_prio(&self, sc: ScId) -> Option<Priority> {
        self.links.get(&sc).map(|link| link.prio)
    }

    /// Insert `sc` into the bucket of `prio`
    ///
    /// Returns `false` (and changes nothing) if `sc` is already queued.
    pub fn enqueue(&mut self, sc: ScId, prio: Priority, pos: Position) -> bool {
        if self.is_queued(sc) {
            return false;
        }

        let bucket = self.buckets[prio.index()];
        let link = match pos {
            Position::Front => Link {
                prio,
                prev: None,
                next: bucket.head,
            },
            Position::Back => Link {
                prio,
                prev: bucket.tail,
                next: None,
            },
        };
        match pos {
            Position::Front => match bucket.head {
                Some(head) => self.link_mut(head).prev = Some(sc),
                None => self.buckets[prio.index()].tail = Some(sc),
            },
            Position::Back => match bucket.tail {
                Some(tail) => self.link_mut(tail).next = Some(sc),
                None => self.buckets[prio.index()].head = Some(sc),
            },
        }
        let bucket = &mut self.buckets[prio.index()];
        match pos {
            Position::Front => bucket.head = Some(sc),
            Position::Back => bucket.tail = Some(sc),
        }
        bucket.len += 1;
        self.links.insert(sc, link);

        if prio.value() > self.highest {
            self.highest = prio.value();
        }
        true
    }

    /// Remove `sc` from its bucket
    ///
    /// Returns `false` if `sc` was not queued.
    pub fn dequeue(&mut self, sc: ScId) -> bool {
        let Some(link) = self.links.remove(&sc) else {
            return false;
        };

        match link.prev {
            Some(prev) => self.link_mut(prev).next = link.next,
            None => self.buckets[link.prio.index()].head = link.next,
        }
        match link.next {
            Some(next) => self.link_mut(next).prev = link.prev,
            None => self.buckets[link.prio.index()].tail = link.prev,
        }
        self.buckets[link.prio.index()].len -= 1;

        if link.prio.value() == self.highest {
            while self.highest > 0 && self.buckets[self.highest as usize].len == 0 {
                self.highest -= 1;
            }
        }
        true
    }

    /// Head of the highest non-empty bucket; does not dequeue
    pub fn next_to_run(&self) -> Option<ScId> {
        self.buckets[self.highest as usize].head
    }

    /// Rotate the bucket of `sc` so that its successor becomes the head
    ///
    /// With `sc` at the head this moves it behind all of its peers. A
    /// context that is not queued is appended instead.
    pub fn requeue(&mut self, sc: ScId, prio: Priority) {
        let Some(link) = self.links.get(&sc).copied() else {
            self.enqueue(sc, prio, Position::Back);
            return;
        };

        let bucket = self.buckets[link.prio.index()];
        let Some(successor) = link.next.or(bucket.head) else {
            return;
        };
        while self.buckets[link.prio.index()].head != Some(successor) {
            let Some(head) = self.buckets[link.prio.index()].head else {
                break;
            };
            self.dequeue(head);
            self.enqueue(head, link.prio, Position::Back);
        }
    }

    /// Preemption decision for a context becoming ready
    ///
    /// `crs` is the priority of the context currently running on behalf of
    /// the caller, if any. Returns whether a reschedule is warranted. With
    /// `lazy` set and a positive decision, `sc` is *not* enqueued; the caller
    /// must switch to it directly.
    pub fn deblock(
        &mut self,
        sc: ScId,
        prio: Priority,
        crs: Option<Priority>,
        lazy: bool,
    ) -> bool {
        let is_active = self.active.map(|(active, _)| active) == Some(sc);
        let dominated_by_crs = crs.is_some_and(|crs| crs.dominates(prio));

        let preempt = if is_active {
            !dominated_by_crs
        } else {
            let dominated_by_active = self
                .active
                .is_some_and(|(_, active_prio)| active_prio.dominates(prio));
            !dominated_by_active && !dominated_by_crs
        };

        if preempt && lazy {
            return true;
        }

        let pos = if is_active {
            Position::Front
        } else {
            Position::Back
        };
        self.enqueue(sc, prio, pos);
        preempt
    }

    /// Context marked as running on this CPU
    #[inline]
    pub fn active(&self) -> Option<ScId> {
        self.active.map(|(sc, _)| sc)
    }

    /// Priority of the running context
    #[inline]
    pub fn active_prio(&self) -> Option<Priority> {
        self.active.map(|(_, prio)| prio)
    }

    /// Mark `sc` as running
    pub fn activate(&mut self, sc: ScId, prio: Priority) {
        self.active = Some((sc, prio));
    }

    /// Update the cached priority of the running context
    pub fn set_active_prio(&mut self, sc: ScId, prio: Priority) {
        if self.active() == Some(sc) {
            self.active = Some((sc, prio));
        }
    }

    /// Nothing is running any more
    pub fn invalidate(&mut self) {
        self.active = None;
    }

    /// Contexts of one bucket, head first
    pub fn bucket(&self, prio: Priority) -> Vec<ScId> {
        let mut out = Vec::with_capacity(self.buckets[prio.index()].len);
        let mut cursor = self.buckets[prio.index()].head;
        while let Some(sc) = cursor {
            out.push(sc);
            cursor = self.links.get(&sc).and_then(|link| link.next);
        }
        out
    }

    /// Iterate over queued contexts, highest priority first
    pub fn iter(&self) -> impl Iterator<Item = ScId> + '_ {
        (0..=self.highest)
            .rev()
            .flat_map(move |prio| self.bucket(Priority::new(prio)))
    }

    fn link_mut(&mut self, sc: ScId) -> &mut Link {
        match self.links.get_mut(&sc) {
            Some(link) => link,
            None => panic!("ready queue link of {} missing", sc),
        }
    }

    /// Check the structural invariants
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut total = 0;
        let mut true_max = 0;
        for (prio, bucket) in self.buckets.iter().enumerate() {
            let members = self.bucket(Priority::new(prio as u8));
            assert_eq!(members.len(), bucket.len);
            assert_eq!(members.last().copied(), bucket.tail);
            for sc in &members {
                assert_eq!(self.links[sc].prio.index(), prio);
            }
            if bucket.len > 0 {
                true_max = prio;
            }
            total += bucket.len;
        }
        assert_eq!(total, self.links.len());
        assert_eq!(self.highest as usize, true_max);
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}
