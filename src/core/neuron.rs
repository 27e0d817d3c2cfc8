//! Data model: neurons, links, clusters.
//!
//! A [`Neuron`] is a node with a stable identity once registered. A [`Link`]
//! is a directed edge labeled by a third "meaning" neuron; one `Arc<Link>` is
//! shared by the `links_out` list of its `from` endpoint and the `links_in`
//! list of its `to` endpoint. A cluster is a neuron that additionally owns an
//! ordered `children` list and a meaning reference; each child's
//! `clustered_by` list is the inverse of that relation.
//!
//! Relation collections live behind short-hold `RwLock`s for memory safety;
//! *logical* exclusion across nodes is the lock coordinator's job
//! (see [`crate::lock`]). The only sanctioned mutation paths are the scoped
//! accessors and the mutation algorithms.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::pool::Recycle;

/// Stable identity of a registered neuron.
pub type NeuronId = u64;

/// Identity of an external worker/execution context.
pub type ProcessorId = u64;

/// Placeholder identity shared by all not-yet-registered neurons.
///
/// A temp neuron is implicitly single-owner: no other thread can resolve it,
/// so no lock can (or needs to) be taken on it.
pub const UNREGISTERED: NeuronId = 0;

/// The concrete shape of a neuron.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NeuronKind {
    /// A plain value-carrying node.
    Value,
    /// A node that additionally owns an ordered child list and a meaning.
    Cluster,
}

/// The scalar payload of a neuron.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NeuronValue {
    #[default]
    Empty,
    Int(i64),
    Double(f64),
    Text(String),
}

/// A node of the graph.
///
/// Atomic flags are freely readable; the relation collections must only be
/// touched through an accessor or a mutation algorithm holding the covering
/// lock batch.
#[derive(Debug)]
pub struct Neuron {
    id: AtomicU64,
    kind: NeuronKind,

    /// False once the deletion algorithm has retired this node. Checked by
    /// snapshot consumers instead of re-locking ("liveness flag").
    alive: AtomicBool,

    /// Dirty bit consumed by the external persistence layer. Set after lock
    /// release, never while holding locks.
    changed: AtomicBool,

    /// Suspended-execution marker carried for the caller layer. Duplication
    /// must not disturb it; deletion clears it ("wake").
    frozen: AtomicBool,

    /// How many live links/clusters reference this node as their meaning.
    usage: AtomicU32,

    pub(crate) value: RwLock<NeuronValue>,

    /// Meaning of this cluster; `UNREGISTERED` when none or not a cluster.
    pub(crate) meaning: RwLock<NeuronId>,

    /// Ordered child list (clusters only). May contain the cluster itself.
    pub(crate) children: RwLock<Vec<NeuronId>>,

    /// Inverse of `children`: the clusters this node belongs to.
    pub(crate) clustered_by: RwLock<Vec<NeuronId>>,

    pub(crate) links_in: RwLock<Vec<Arc<Link>>>,
    pub(crate) links_out: RwLock<Vec<Arc<Link>>>,

    /// Processors currently attached to this node.
    pub(crate) processors: RwLock<Vec<ProcessorId>>,
}

impl Neuron {
    fn with_kind(kind: NeuronKind) -> Self {
        Self {
            id: AtomicU64::new(UNREGISTERED),
            kind,
            alive: AtomicBool::new(true),
            changed: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            usage: AtomicU32::new(0),
            value: RwLock::new(NeuronValue::Empty),
            meaning: RwLock::new(UNREGISTERED),
            children: RwLock::new(Vec::new()),
            clustered_by: RwLock::new(Vec::new()),
            links_in: RwLock::new(Vec::new()),
            links_out: RwLock::new(Vec::new()),
            processors: RwLock::new(Vec::new()),
        }
    }

    /// A fresh value neuron carrying `value`.
    pub fn value(value: NeuronValue) -> Self {
        let n = Self::with_kind(NeuronKind::Value);
        *n.value.write() = value;
        n
    }

    /// A fresh, empty cluster.
    pub fn cluster() -> Self {
        Self::with_kind(NeuronKind::Cluster)
    }

    pub fn kind(&self) -> NeuronKind {
        self.kind
    }

    pub fn is_cluster(&self) -> bool {
        self.kind == NeuronKind::Cluster
    }

    /// The registered identity, or [`UNREGISTERED`].
    #[inline]
    pub fn id(&self) -> NeuronId {
        self.id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.id() != UNREGISTERED
    }

    /// Assign the permanent identity. Returns the winning id, which differs
    /// from `id` only if another caller registered this node first.
    pub(crate) fn claim_id(&self, id: NeuronId) -> NeuronId {
        match self
            .id
            .compare_exchange(UNREGISTERED, id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => id,
            Err(winner) => winner,
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Retire this node. Snapshot consumers skip retired nodes instead of
    /// re-locking them.
    pub(crate) fn retire(&self) {
        self.alive.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }

    /// Read and clear the dirty bit (persistence layer hook).
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn unfreeze(&self) {
        self.frozen.store(false, Ordering::Release);
    }

    /// Number of live links/clusters referencing this node as meaning.
    #[inline]
    pub fn usage(&self) -> u32 {
        self.usage.load(Ordering::Acquire)
    }

    pub(crate) fn bump_usage(&self) {
        self.usage.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturating decrement; never wraps below zero.
    pub(crate) fn drop_usage(&self) {
        let _ = self
            .usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| u.checked_sub(1));
    }

    /// Set the payload of a not-yet-shared neuron.
    pub fn with_value(mut self, value: NeuronValue) -> Self {
        *self.value.get_mut() = value;
        self
    }
}

impl Default for Neuron {
    fn default() -> Self {
        Self::with_kind(NeuronKind::Value)
    }
}

impl Recycle for Neuron {
    /// Reset every field a previous owner could have touched. The kind is
    /// kept: pools are per concrete node type.
    fn reset(&mut self) {
        *self.id.get_mut() = UNREGISTERED;
        *self.alive.get_mut() = true;
        *self.changed.get_mut() = false;
        *self.frozen.get_mut() = false;
        *self.usage.get_mut() = 0;
        *self.value.get_mut() = NeuronValue::Empty;
        *self.meaning.get_mut() = UNREGISTERED;
        self.children.get_mut().clear();
        self.clustered_by.get_mut().clear();
        self.links_in.get_mut().clear();
        self.links_out.get_mut().clear();
        self.processors.get_mut().clear();
    }
}

/// A directed, meaning-labeled edge.
///
/// Conceptually owned by both endpoints: the same `Arc<Link>` sits in
/// `from.links_out` and `to.links_in`.
#[derive(Debug)]
pub struct Link {
    pub(crate) from: NeuronId,
    pub(crate) to: NeuronId,
    pub(crate) meaning: NeuronId,

    /// Ordered annotation nodes.
    pub(crate) info: RwLock<Vec<NeuronId>>,

    /// Cleared exactly once when the link is destroyed; late observers skip
    /// invalid links instead of re-locking their endpoints.
    valid: AtomicBool,
}

impl Link {
    pub(crate) fn wire(mut self, from: NeuronId, to: NeuronId, meaning: NeuronId) -> Self {
        self.from = from;
        self.to = to;
        self.meaning = meaning;
        self
    }

    #[inline]
    pub fn from(&self) -> NeuronId {
        self.from
    }

    #[inline]
    pub fn to(&self) -> NeuronId {
        self.to
    }

    #[inline]
    pub fn meaning(&self) -> NeuronId {
        self.meaning
    }

    /// Snapshot of the annotation list.
    pub fn info(&self) -> Vec<NeuronId> {
        self.info.read().clone()
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark destroyed. Returns true for exactly one caller, so a link racing
    /// through two overlapping deletions is processed once.
    pub(crate) fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }
}

impl Default for Link {
    fn default() -> Self {
        Self {
            from: UNREGISTERED,
            to: UNREGISTERED,
            meaning: UNREGISTERED,
            info: RwLock::new(Vec::new()),
            valid: AtomicBool::new(true),
        }
    }
}

impl Recycle for Link {
    fn reset(&mut self) {
        self.from = UNREGISTERED;
        self.to = UNREGISTERED;
        self.meaning = UNREGISTERED;
        self.info.get_mut().clear();
        *self.valid.get_mut() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_neuron_is_unregistered_and_alive() {
        let n = Neuron::value(NeuronValue::Int(7));
        assert_eq!(n.id(), UNREGISTERED);
        assert!(!n.is_registered());
        assert!(n.is_alive());
        assert!(!n.is_changed());
        assert_eq!(*n.value.read(), NeuronValue::Int(7));
    }

    #[test]
    fn claim_id_is_first_writer_wins() {
        let n = Neuron::cluster();
        assert_eq!(n.claim_id(41), 41);
        assert_eq!(n.claim_id(99), 41);
        assert_eq!(n.id(), 41);
    }

    #[test]
    fn usage_never_wraps_below_zero() {
        let n = Neuron::value(NeuronValue::Empty);
        n.drop_usage();
        assert_eq!(n.usage(), 0);
        n.bump_usage();
        n.bump_usage();
        n.drop_usage();
        assert_eq!(n.usage(), 1);
    }

    #[test]
    fn take_changed_clears_the_dirty_bit() {
        let n = Neuron::default();
        n.mark_changed();
        assert!(n.take_changed());
        assert!(!n.take_changed());
    }

    #[test]
    fn link_invalidates_exactly_once() {
        let link = Link::default().wire(1, 2, 3);
        assert!(link.is_valid());
        assert!(link.invalidate());
        assert!(!link.invalidate());
        assert!(!link.is_valid());
    }

    #[test]
    fn recycled_neuron_leaks_nothing() {
        let mut n = Neuron::value(NeuronValue::Int(5));
        n.claim_id(10);
        n.mark_changed();
        n.freeze();
        n.bump_usage();
        n.children.get_mut().push(3);
        n.reset();

        assert_eq!(n.id(), UNREGISTERED);
        assert!(n.is_alive());
        assert!(!n.is_changed());
        assert!(!n.is_frozen());
        assert_eq!(n.usage(), 0);
        assert_eq!(*n.value.read(), NeuronValue::Empty);
        assert!(n.children.read().is_empty());
    }
}
