//! The graph context: registry, lock coordinator and pools in one handle.
//!
//! Everything that used to be a global singleton in systems of this shape
//! (the coordinator, the pool registry, the id registry) hangs off one
//! [`Brain`] instance passed explicitly into accessors and algorithms, so
//! isolated graphs can run side by side in tests and embedders.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::lock::{LockBatch, LockCoordinator, LockLevel};
use crate::neuron::{Link, Neuron, NeuronId, UNREGISTERED};
use crate::pool::{Pools, Workspace, MAX_THREAD_RESERVE, MAX_TOTAL_PER_TYPE};

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BrainConfig {
    /// Cap on instances retained in each shared pool.
    pub max_pooled_per_type: usize,
    /// Capacity of each per-processor reserve bag.
    pub thread_reserve: usize,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            max_pooled_per_type: MAX_TOTAL_PER_TYPE,
            thread_reserve: MAX_THREAD_RESERVE,
        }
    }
}

impl BrainConfig {
    pub fn with_pool_cap(mut self, max_pooled_per_type: usize) -> Self {
        self.max_pooled_per_type = max_pooled_per_type;
        self
    }

    pub fn with_thread_reserve(mut self, thread_reserve: usize) -> Self {
        self.thread_reserve = thread_reserve;
        self
    }
}

/// Fire-and-forget notifications about structural events. Consulted by
/// nothing inside this crate; an embedder may hang persistence or
/// diagnostics off it.
pub trait GraphObserver: Send + Sync {
    fn link_destroyed(&self, _link: &Link) {}
    fn neuron_deleted(&self, _id: NeuronId) {}
}

/// Point-in-time counters, in the spirit of a diagnostics snapshot.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BrainStats {
    pub neurons: usize,
    pub pooled_value_neurons: usize,
    pub pooled_clusters: usize,
    pub pooled_links: usize,
}

/// The shared graph: id registry + lock coordinator + pool registry.
pub struct Brain {
    cfg: BrainConfig,
    neurons: RwLock<HashMap<NeuronId, Arc<Neuron>>>,
    next_id: AtomicU64,
    locks: LockCoordinator,
    pools: Pools,
    observer: RwLock<Option<Arc<dyn GraphObserver>>>,
}

impl Brain {
    pub fn new(cfg: BrainConfig) -> Self {
        Self {
            cfg,
            neurons: RwLock::new(HashMap::new()),
            // 0 is the shared placeholder identity of temp neurons.
            next_id: AtomicU64::new(1),
            locks: LockCoordinator::new(),
            pools: Pools::new(cfg.max_pooled_per_type),
            observer: RwLock::new(None),
        }
    }

    pub fn config(&self) -> BrainConfig {
        self.cfg
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    /// Build the per-processor context a worker thread mutates through.
    pub fn workspace(&self) -> Workspace {
        Workspace::new(&self.pools, self.cfg.thread_reserve)
    }

    /// Register a freshly-built neuron and hand back its shared handle.
    pub fn insert(&self, neuron: Neuron) -> Arc<Neuron> {
        let neuron = Arc::new(neuron);
        self.register(&neuron);
        neuron
    }

    /// Assign a permanent identity. Idempotent: an already-registered
    /// neuron keeps its id.
    pub fn register(&self, neuron: &Arc<Neuron>) -> NeuronId {
        let current = neuron.id();
        if current != UNREGISTERED {
            return current;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let won = neuron.claim_id(id);
        if won == id {
            self.neurons.write().insert(id, Arc::clone(neuron));
        }
        won
    }

    /// Turn an identity back into a live handle (`tryFind`).
    pub fn resolve(&self, id: NeuronId) -> Option<Arc<Neuron>> {
        if id == UNREGISTERED {
            return None;
        }
        self.neurons.read().get(&id).cloned()
    }

    /// Drop the registry's reference. The node stays usable for anyone who
    /// still holds it, but no new thread can reach it.
    pub fn unregister(&self, id: NeuronId) -> Option<Arc<Neuron>> {
        let removed = self.neurons.write().remove(&id);
        if removed.is_some() {
            debug!(target: "neurograph::brain", id, "neuron unregistered");
        }
        removed
    }

    pub fn neuron_count(&self) -> usize {
        self.neurons.read().len()
    }

    /// Snapshot of every registered identity (diagnostics, integrity scans).
    pub fn ids(&self) -> Vec<NeuronId> {
        self.neurons.read().keys().copied().collect()
    }

    /// Create a link `from --meaning--> to` and attach it to both endpoints
    /// in one atomic step. Returns `None` if the endpoints are not distinct
    /// live neurons or the meaning is dead.
    pub fn connect(
        &self,
        from: &Arc<Neuron>,
        to: &Arc<Neuron>,
        meaning: &Arc<Neuron>,
    ) -> Option<Arc<Link>> {
        if Arc::ptr_eq(from, to) {
            return None;
        }
        self.register(from);
        self.register(to);
        self.register(meaning);

        let mut batch = LockBatch::new();
        batch.add(from, LockLevel::LinksOut, true);
        batch.add(to, LockLevel::LinksIn, true);
        batch.add(meaning, LockLevel::Value, true);
        self.locks.acquire(&mut batch);

        if !(from.is_alive() && to.is_alive() && meaning.is_alive()) {
            self.locks.release(&batch);
            return None;
        }

        let link = Arc::new(Link::default().wire(from.id(), to.id(), meaning.id()));
        from.links_out.write().push(Arc::clone(&link));
        to.links_in.write().push(Arc::clone(&link));
        meaning.bump_usage();

        self.locks.release(&batch);
        batch.mark_changed(false);
        Some(link)
    }

    pub fn set_observer(&self, observer: Arc<dyn GraphObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub(crate) fn notify_link_destroyed(&self, link: &Link) {
        if let Some(obs) = self.observer.read().clone() {
            obs.link_destroyed(link);
        }
    }

    pub(crate) fn notify_neuron_deleted(&self, id: NeuronId) {
        if let Some(obs) = self.observer.read().clone() {
            obs.neuron_deleted(id);
        }
    }

    pub fn stats(&self) -> BrainStats {
        BrainStats {
            neurons: self.neuron_count(),
            pooled_value_neurons: self.pools.value_neurons.retained(),
            pooled_clusters: self.pools.clusters.retained(),
            pooled_links: self.pools.links.retained(),
        }
    }
}

impl Default for Brain {
    fn default() -> Self {
        Self::new(BrainConfig::default())
    }
}
