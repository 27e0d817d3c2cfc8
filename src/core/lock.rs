//! Lock model: levels, requests, batches and the coordinator.
//!
//! Every independently-lockable aspect of a neuron is a [`LockLevel`]. An
//! operation gathers all the `(neuron, level, writeable)` requests it will
//! ever need into one [`LockBatch`] *before* taking any lock, then asks the
//! [`LockCoordinator`] to grant the whole batch at once.
//!
//! ## Why this cannot deadlock
//!
//! `acquire` evaluates the entire batch under the coordinator's single table
//! mutex and either grants every request or grants nothing and waits. A
//! blocked batch therefore holds no grant at all, so no waits-for cycle can
//! form between batches: the classic hold-and-wait condition is structurally
//! absent. Call sites uphold the complementary discipline of never expanding
//! a held batch through a second, unrelated acquisition (gather-then-acquire).
//!
//! Batches are canonicalized (sorted by registered id, then level rank) so
//! that two overlapping batches collapse duplicates identically and conflict
//! resolution does not depend on insertion order.
//!
//! Same-thread re-entrant acquisition of a conflicting grant is unsupported;
//! the snapshot protocol in [`crate::function`] releases its read lock before
//! batch assembly precisely so that no call path needs it.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::neuron::{Neuron, NeuronId};
use crate::pool::Recycle;

/// An independently-lockable aspect of a neuron.
///
/// `All` is the whole-node level: it overlaps every other level on the same
/// node. All other levels are disjoint from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LockLevel {
    Value,
    Children,
    Parents,
    LinksIn,
    LinksOut,
    Processors,
    All,
}

const LEVEL_COUNT: usize = 7;
const ALL: usize = LockLevel::All as usize;

impl LockLevel {
    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    /// Stable rank used when canonicalizing a batch.
    #[inline]
    pub(crate) fn rank(self) -> u8 {
        self as u8
    }

    /// Does a grant at `self` cover a request at `other` on the same node?
    #[inline]
    pub fn covers(self, other: LockLevel) -> bool {
        self == other || self == LockLevel::All
    }
}

/// One lock request: a node, an aspect of it, and the intent to write.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub neuron: Arc<Neuron>,
    pub level: LockLevel,
    pub writeable: bool,
}

/// An ordered, deduplicated set of lock requests acquired and released as
/// one atomic unit.
#[derive(Debug, Default)]
pub struct LockBatch {
    requests: Vec<LockRequest>,
}

impl LockBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request, applying the dedup rule:
    ///
    /// - an existing request on the same node at an equal-or-broader level
    ///   absorbs the new one (OR-merging writeability);
    /// - an incoming `All` absorbs every narrower request on the node.
    ///
    /// Unregistered neurons are skipped: a temp node is single-owner by
    /// contract and has no identity the coordinator could order by. Mutation
    /// algorithms register their targets before assembly.
    pub fn add(&mut self, neuron: &Arc<Neuron>, level: LockLevel, writeable: bool) {
        if !neuron.is_registered() {
            return;
        }
        let id = neuron.id();

        if level == LockLevel::All {
            let mut merged = writeable;
            self.requests.retain(|r| {
                if r.neuron.id() == id {
                    merged |= r.writeable;
                    false
                } else {
                    true
                }
            });
            self.requests.push(LockRequest {
                neuron: Arc::clone(neuron),
                level,
                writeable: merged,
            });
            return;
        }

        for r in &mut self.requests {
            if r.neuron.id() == id && r.level.covers(level) {
                r.writeable |= writeable;
                return;
            }
        }
        self.requests.push(LockRequest {
            neuron: Arc::clone(neuron),
            level,
            writeable,
        });
    }

    pub fn requests(&self) -> &[LockRequest] {
        &self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }

    /// Sort into the coordinator's deterministic global order: registered id
    /// first, level rank second.
    fn canonicalize(&mut self) {
        self.requests
            .sort_unstable_by_key(|r| (r.neuron.id(), r.level.rank()));
        debug_assert!(
            self.requests
                .windows(2)
                .all(|w| (w[0].neuron.id(), w[0].level) != (w[1].neuron.id(), w[1].level)),
            "duplicate request survived dedup"
        );
    }

    /// Mark every writeable-locked node dirty. Called *after* release to
    /// keep time-under-lock minimal. With `unfreeze`, also wake anything
    /// suspended on those nodes (deletion semantics); without it, frozen
    /// state is left untouched (duplication semantics).
    pub fn mark_changed(&self, unfreeze: bool) {
        for r in &self.requests {
            if r.writeable {
                r.neuron.mark_changed();
                if unfreeze {
                    r.neuron.unfreeze();
                }
            }
        }
    }
}

impl Recycle for LockBatch {
    fn reset(&mut self) {
        self.requests.clear();
    }
}

/// Per-node grant bookkeeping: reader counts and writer flags per level.
#[derive(Default)]
struct NodeGrants {
    readers: [u32; LEVEL_COUNT],
    writers: [bool; LEVEL_COUNT],
}

impl NodeGrants {
    #[inline]
    fn held(&self, level: usize) -> bool {
        self.writers[level] || self.readers[level] > 0
    }

    fn any_held(&self) -> bool {
        (0..LEVEL_COUNT).any(|l| self.held(l))
    }

    fn any_writer(&self) -> bool {
        self.writers.iter().any(|w| *w)
    }

    fn grant_count(&self) -> usize {
        self.readers.iter().map(|&c| c as usize).sum::<usize>()
            + self.writers.iter().filter(|w| **w).count()
    }
}

#[derive(Default)]
struct LockTable {
    nodes: HashMap<NeuronId, NodeGrants>,
}

impl LockTable {
    /// Conflict rule: two grants on one node conflict iff their levels
    /// overlap (equal, or either is `All`) and at least one is writeable.
    fn grantable(&self, id: NeuronId, level: LockLevel, writeable: bool) -> bool {
        let Some(g) = self.nodes.get(&id) else {
            return true;
        };
        let l = level.index();
        if writeable {
            if level == LockLevel::All {
                !g.any_held()
            } else {
                !g.held(l) && !g.held(ALL)
            }
        } else if level == LockLevel::All {
            !g.any_writer()
        } else {
            !g.writers[l] && !g.writers[ALL]
        }
    }

    fn grant(&mut self, id: NeuronId, level: LockLevel, writeable: bool) {
        let g = self.nodes.entry(id).or_default();
        let l = level.index();
        if writeable {
            debug_assert!(!g.writers[l], "double writer grant on one level");
            g.writers[l] = true;
        } else {
            g.readers[l] += 1;
        }
    }

    fn revoke(&mut self, id: NeuronId, level: LockLevel, writeable: bool) {
        let l = level.index();
        let empty = {
            let Some(g) = self.nodes.get_mut(&id) else {
                debug_assert!(false, "revoking a grant that was never taken");
                return;
            };
            if writeable {
                debug_assert!(g.writers[l]);
                g.writers[l] = false;
            } else {
                debug_assert!(g.readers[l] > 0);
                g.readers[l] -= 1;
            }
            !g.any_held()
        };
        if empty {
            self.nodes.remove(&id);
        }
    }
}

/// Grants and releases lock batches atomically.
///
/// One coordinator instance belongs to one [`crate::brain::Brain`]; there is
/// no process-global instance, so tests can run isolated graphs side by side.
#[derive(Default)]
pub struct LockCoordinator {
    table: Mutex<LockTable>,
    ready: Condvar,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every request in the batch can be granted simultaneously,
    /// then grant them all. Never holds a strict subset while waiting.
    pub fn acquire(&self, batch: &mut LockBatch) {
        batch.canonicalize();
        if batch.is_empty() {
            return;
        }
        let mut table = self.table.lock();
        loop {
            let all_free = batch
                .requests()
                .iter()
                .all(|r| table.grantable(r.neuron.id(), r.level, r.writeable));
            if all_free {
                for r in batch.requests() {
                    table.grant(r.neuron.id(), r.level, r.writeable);
                }
                return;
            }
            self.ready.wait(&mut table);
        }
    }

    /// Release every grant of the batch atomically and wake waiters.
    ///
    /// Dirty marking is the caller's next step, via
    /// [`LockBatch::mark_changed`], after this returns.
    pub fn release(&self, batch: &LockBatch) {
        if batch.is_empty() {
            return;
        }
        let mut table = self.table.lock();
        for r in batch.requests() {
            table.revoke(r.neuron.id(), r.level, r.writeable);
        }
        drop(table);
        self.ready.notify_all();
    }

    /// Single-request fast path for short snapshot reads. No-op on
    /// unregistered (single-owner) neurons.
    pub fn lock_one(&self, neuron: &Arc<Neuron>, level: LockLevel, writeable: bool) {
        if !neuron.is_registered() {
            return;
        }
        let id = neuron.id();
        let mut table = self.table.lock();
        while !table.grantable(id, level, writeable) {
            self.ready.wait(&mut table);
        }
        table.grant(id, level, writeable);
    }

    /// Counterpart of [`lock_one`](Self::lock_one).
    pub fn unlock_one(&self, neuron: &Arc<Neuron>, level: LockLevel, writeable: bool) {
        if !neuron.is_registered() {
            return;
        }
        let mut table = self.table.lock();
        table.revoke(neuron.id(), level, writeable);
        drop(table);
        self.ready.notify_all();
    }

    /// Outstanding grant count on one node. Zero after every well-behaved
    /// operation completes (the lock-balance property).
    pub fn held_on(&self, id: NeuronId) -> usize {
        self.table
            .lock()
            .nodes
            .get(&id)
            .map(NodeGrants::grant_count)
            .unwrap_or(0)
    }

    /// Is some grant covering `(id, level)` currently outstanding? Used by
    /// the debug assertions guarding the accessors' `direct_*` entry points.
    pub(crate) fn covered(&self, id: NeuronId, level: LockLevel) -> bool {
        let table = self.table.lock();
        let Some(g) = table.nodes.get(&id) else {
            return false;
        };
        g.held(level.index()) || g.held(ALL)
    }
}
