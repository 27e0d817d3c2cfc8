//! Bounded object recycling.
//!
//! Two levels per concrete type: a per-processor reserve bag
//! ([`LocalPool`]) feeds from a shared, capped queue-of-bags ([`Pool`]).
//! Recycling resets the instance first, so a reused object never exposes a
//! previous logical owner's state. Beyond the shared cap, recycled instances
//! are discarded, bounding memory.
//!
//! The shared queue is pre-sized at construction and never grows; offering a
//! bag into a full queue hands the bag back to the caller instead of
//! allocating. The recycle path therefore never allocates into shared
//! structures, which matters because it runs on the teardown side of
//! deletion.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::lock::LockBatch;
use crate::neuron::{Link, Neuron, NeuronId};

/// Capacity of one per-processor reserve bag.
pub const MAX_THREAD_RESERVE: usize = 64;

/// Default cap on instances retained in one shared pool.
pub const MAX_TOTAL_PER_TYPE: usize = 4096;

/// A recyclable object: resettable to its freshly-constructed state.
pub trait Recycle: Send {
    /// Clear everything a previous owner could have written. Capacity of
    /// inner collections may be kept; logical state may not.
    fn reset(&mut self);
}

/// Scratch lists recycle by clearing; the backing allocation is the point.
impl<T: Send> Recycle for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

struct Shared<T> {
    bags: VecDeque<Vec<T>>,
    retained: usize,
}

/// The shared, bounded queue-of-bags for one concrete type.
pub struct Pool<T> {
    shared: Mutex<Shared<T>>,
    max_items: usize,
    max_bags: usize,
}

impl<T: Recycle> Pool<T> {
    pub fn new(max_items: usize) -> Self {
        let max_bags = max_items / MAX_THREAD_RESERVE + 1;
        Self {
            shared: Mutex::new(Shared {
                bags: VecDeque::with_capacity(max_bags),
                retained: 0,
            }),
            max_items,
            max_bags,
        }
    }

    fn take_bag(&self) -> Option<Vec<T>> {
        let mut shared = self.shared.lock();
        let bag = shared.bags.pop_front()?;
        shared.retained -= bag.len();
        Some(bag)
    }

    /// Offer a full bag. Returns the bag when the pool is at capacity; the
    /// caller discards its contents and reuses the allocation.
    fn offer(&self, bag: Vec<T>) -> Option<Vec<T>> {
        if bag.is_empty() {
            return Some(bag);
        }
        let mut shared = self.shared.lock();
        if shared.bags.len() >= self.max_bags || shared.retained + bag.len() > self.max_items {
            return Some(bag);
        }
        shared.retained += bag.len();
        shared.bags.push_back(bag);
        None
    }

    /// Instances currently parked in the shared queue (reserve bags not
    /// included).
    pub fn retained(&self) -> usize {
        self.shared.lock().retained
    }
}

/// Per-processor front of a [`Pool`]: a reserve bag with a shared fallback.
///
/// Not `Sync`; each worker owns its own.
pub struct LocalPool<T: Recycle> {
    shared: Arc<Pool<T>>,
    reserve: RefCell<Vec<T>>,
    reserve_cap: usize,
    fresh: fn() -> T,
}

impl<T: Recycle> LocalPool<T> {
    pub fn new(shared: Arc<Pool<T>>, reserve_cap: usize, fresh: fn() -> T) -> Self {
        Self {
            shared,
            reserve: RefCell::new(Vec::with_capacity(reserve_cap)),
            reserve_cap,
            fresh,
        }
    }

    /// Reserve bag, then a shared bag, then a fresh allocation.
    pub fn acquire(&self) -> T {
        let mut reserve = self.reserve.borrow_mut();
        if let Some(item) = reserve.pop() {
            return item;
        }
        if let Some(mut bag) = self.shared.take_bag() {
            let item = bag.pop();
            *reserve = bag;
            if let Some(item) = item {
                return item;
            }
        }
        drop(reserve);
        (self.fresh)()
    }

    /// Reset and retain `item`. A full reserve is flushed to the shared
    /// queue as one bag; if the shared pool is at capacity the flushed
    /// instances are dropped and only the bag allocation is kept.
    pub fn recycle(&self, mut item: T) {
        item.reset();
        let mut reserve = self.reserve.borrow_mut();
        if reserve.len() < self.reserve_cap {
            reserve.push(item);
            return;
        }
        let full = std::mem::take(&mut *reserve);
        match self.shared.offer(full) {
            Some(mut rejected) => {
                rejected.clear();
                *reserve = rejected;
            }
            None => *reserve = Vec::with_capacity(self.reserve_cap),
        }
        reserve.push(item);
    }

    /// Acquire with guaranteed return on every exit path, panics included.
    pub fn loan(&self) -> Loan<'_, T> {
        Loan {
            pool: self,
            item: Some(self.acquire()),
        }
    }

    /// Push the reserve to the shared queue (worker teardown).
    pub fn flush(&self) {
        let full = std::mem::take(&mut *self.reserve.borrow_mut());
        let _ = self.shared.offer(full);
    }

    pub fn reserved(&self) -> usize {
        self.reserve.borrow().len()
    }
}

/// Scoped pool handle: derefs to the pooled item and recycles it on drop.
pub struct Loan<'p, T: Recycle> {
    pool: &'p LocalPool<T>,
    item: Option<T>,
}

impl<T: Recycle> Deref for Loan<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("loan already returned")
    }
}

impl<T: Recycle> DerefMut for Loan<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("loan already returned")
    }
}

impl<T: Recycle> Drop for Loan<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.recycle(item);
        }
    }
}

/// The shared pool registry of one graph: one bounded pool per concrete
/// node type plus the auxiliary per-operation objects. Passed around as an
/// explicit handle; there is no process-global pool.
pub struct Pools {
    pub value_neurons: Arc<Pool<Neuron>>,
    pub clusters: Arc<Pool<Neuron>>,
    pub links: Arc<Pool<Link>>,
    pub batches: Arc<Pool<LockBatch>>,
    pub link_lists: Arc<Pool<Vec<Arc<Link>>>>,
    pub id_lists: Arc<Pool<Vec<NeuronId>>>,
}

impl Pools {
    pub fn new(max_per_type: usize) -> Self {
        Self {
            value_neurons: Arc::new(Pool::new(max_per_type)),
            clusters: Arc::new(Pool::new(max_per_type)),
            links: Arc::new(Pool::new(max_per_type)),
            batches: Arc::new(Pool::new(max_per_type)),
            link_lists: Arc::new(Pool::new(max_per_type)),
            id_lists: Arc::new(Pool::new(max_per_type)),
        }
    }
}

/// Per-processor context: local fronts for every pooled type. Mutation
/// algorithms draw their targets, batches and scratch lists from here.
pub struct Workspace {
    pub value_neurons: LocalPool<Neuron>,
    pub clusters: LocalPool<Neuron>,
    pub links: LocalPool<Link>,
    pub batches: LocalPool<LockBatch>,
    pub link_lists: LocalPool<Vec<Arc<Link>>>,
    pub id_lists: LocalPool<Vec<NeuronId>>,
}

impl Workspace {
    pub fn new(pools: &Pools, reserve_cap: usize) -> Self {
        Self {
            value_neurons: LocalPool::new(
                Arc::clone(&pools.value_neurons),
                reserve_cap,
                Neuron::default,
            ),
            clusters: LocalPool::new(Arc::clone(&pools.clusters), reserve_cap, Neuron::cluster),
            links: LocalPool::new(Arc::clone(&pools.links), reserve_cap, Link::default),
            batches: LocalPool::new(Arc::clone(&pools.batches), reserve_cap, LockBatch::new),
            link_lists: LocalPool::new(Arc::clone(&pools.link_lists), reserve_cap, Vec::new),
            id_lists: LocalPool::new(Arc::clone(&pools.id_lists), reserve_cap, Vec::new),
        }
    }
}
