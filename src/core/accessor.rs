//! Scoped accessors: typed, lock-bracketed views over one relation of one
//! neuron.
//!
//! Every public operation acquires the correct multi-node batch before
//! touching the underlying collection and releases it afterwards. Mutating a
//! relation always locks both sides, because the inverse collection is
//! updated in the same atomic step: adding a child locks the cluster at
//! `Children` and the child at `Parents`, then pushes into `children` *and*
//! `clustered_by` under that one grant.
//!
//! Each operation has a matching `direct_*` variant that bypasses the
//! logical lock. Preconditions, checked only by debug assertions: the caller
//! already holds covering grants from an enclosing batch. The mutation
//! algorithms in [`crate::function`] are the intended callers; `direct_*` is
//! not a lock-free general-use surface.
//!
//! Iteration holds the lock for the whole enumeration and releases it when
//! the iterator drops, on every exit path. Do not call a mutating operation
//! of the same accessor while iterating it; the data lock is still held.

use std::sync::Arc;

use parking_lot::RwLockReadGuard;

use crate::brain::Brain;
use crate::lock::{LockBatch, LockCoordinator, LockLevel};
use crate::neuron::{Link, Neuron, NeuronId, NeuronValue, ProcessorId};

fn remove_first(list: &mut Vec<NeuronId>, id: NeuronId) -> bool {
    if let Some(pos) = list.iter().position(|x| *x == id) {
        list.remove(pos);
        true
    } else {
        false
    }
}

fn remove_link(list: &mut Vec<Arc<Link>>, link: &Arc<Link>) -> bool {
    if let Some(pos) = list.iter().position(|l| Arc::ptr_eq(l, link)) {
        list.remove(pos);
        true
    } else {
        false
    }
}

/// Which relation of a neuron an accessor is viewing, and how to lock it.
///
/// The policy replaces a subclass-per-relation design: each variant knows
/// the level guarding its own collection and the level guarding the inverse
/// collection on the far side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Children,
    Parents,
    LinksIn,
    LinksOut,
}

impl Relation {
    /// Level guarding this relation's collection on the accessed node.
    pub fn own_level(self) -> LockLevel {
        match self {
            Relation::Children => LockLevel::Children,
            Relation::Parents => LockLevel::Parents,
            Relation::LinksIn => LockLevel::LinksIn,
            Relation::LinksOut => LockLevel::LinksOut,
        }
    }

    /// Level guarding the inverse collection on the far side.
    pub fn far_level(self) -> LockLevel {
        match self {
            Relation::Children => LockLevel::Parents,
            Relation::Parents => LockLevel::Children,
            Relation::LinksIn => LockLevel::LinksOut,
            Relation::LinksOut => LockLevel::LinksIn,
        }
    }
}

/// Binds one neuron + one level + a writeability intent; `lock`/`unlock`
/// behave as a one-request batch.
pub struct NeuronAccessor<'b> {
    brain: &'b Brain,
    neuron: Arc<Neuron>,
    level: LockLevel,
    writeable: bool,
}

impl<'b> NeuronAccessor<'b> {
    pub fn new(brain: &'b Brain, neuron: Arc<Neuron>, level: LockLevel, writeable: bool) -> Self {
        Self {
            brain,
            neuron,
            level,
            writeable,
        }
    }

    pub fn neuron(&self) -> &Arc<Neuron> {
        &self.neuron
    }

    pub fn lock(&self) {
        self.brain
            .locks()
            .lock_one(&self.neuron, self.level, self.writeable);
    }

    pub fn unlock(&self) {
        self.brain
            .locks()
            .unlock_one(&self.neuron, self.level, self.writeable);
        if self.writeable {
            self.neuron.mark_changed();
        }
    }

    /// Run `f` with the lock held; released on every exit path.
    pub fn locked<R>(&self, f: impl FnOnce(&Arc<Neuron>) -> R) -> R {
        struct Unlock<'a, 'b>(&'a NeuronAccessor<'b>);
        impl Drop for Unlock<'_, '_> {
            fn drop(&mut self) {
                self.0.unlock();
            }
        }
        self.lock();
        let guard = Unlock(self);
        let out = f(&guard.0.neuron);
        drop(guard);
        out
    }

    /// Copy of the payload, read under a `Value` lock.
    pub fn value(&self) -> NeuronValue {
        let locks = self.brain.locks();
        locks.lock_one(&self.neuron, LockLevel::Value, false);
        let out = self.neuron.value.read().clone();
        locks.unlock_one(&self.neuron, LockLevel::Value, false);
        out
    }

    /// Replace the payload under a `Value` lock.
    pub fn set_value(&self, value: NeuronValue) {
        debug_assert!(self.writeable, "set_value on a read-only accessor");
        let locks = self.brain.locks();
        locks.lock_one(&self.neuron, LockLevel::Value, true);
        *self.neuron.value.write() = value;
        locks.unlock_one(&self.neuron, LockLevel::Value, true);
        self.neuron.mark_changed();
    }

    pub fn direct_value(&self) -> NeuronValue {
        debug_assert!(self.holds(LockLevel::Value), "direct_value without lock");
        self.neuron.value.read().clone()
    }

    pub fn direct_set_value(&self, value: NeuronValue) {
        debug_assert!(self.holds(LockLevel::Value), "direct_set_value without lock");
        *self.neuron.value.write() = value;
    }

    fn holds(&self, level: LockLevel) -> bool {
        !self.neuron.is_registered() || self.brain.locks().covered(self.neuron.id(), level)
    }
}

/// List view over `children` or `parents` (the `clustered_by` inverse).
///
/// Ordered, duplicates allowed; mutations keep the inverse collection
/// consistent in the same atomic step.
pub struct RelationAccessor<'b> {
    brain: &'b Brain,
    neuron: Arc<Neuron>,
    relation: Relation,
    writeable: bool,
}

impl<'b> RelationAccessor<'b> {
    /// `relation` must be `Children` or `Parents`.
    pub fn new(brain: &'b Brain, neuron: Arc<Neuron>, relation: Relation, writeable: bool) -> Self {
        debug_assert!(
            matches!(relation, Relation::Children | Relation::Parents),
            "RelationAccessor views id relations; use LinkAccessor for links"
        );
        Self {
            brain,
            neuron,
            relation,
            writeable,
        }
    }

    pub fn children(brain: &'b Brain, neuron: Arc<Neuron>, writeable: bool) -> Self {
        Self::new(brain, neuron, Relation::Children, writeable)
    }

    pub fn parents(brain: &'b Brain, neuron: Arc<Neuron>, writeable: bool) -> Self {
        Self::new(brain, neuron, Relation::Parents, writeable)
    }

    fn locks(&self) -> &LockCoordinator {
        self.brain.locks()
    }

    fn own_col<'n>(&self, n: &'n Neuron) -> &'n parking_lot::RwLock<Vec<NeuronId>> {
        match self.relation {
            Relation::Children => &n.children,
            _ => &n.clustered_by,
        }
    }

    fn far_col<'n>(&self, n: &'n Neuron) -> &'n parking_lot::RwLock<Vec<NeuronId>> {
        match self.relation {
            Relation::Children => &n.clustered_by,
            _ => &n.children,
        }
    }

    fn assert_direct(&self) {
        debug_assert!(
            !self.neuron.is_registered()
                || self
                    .brain
                    .locks()
                    .covered(self.neuron.id(), self.relation.own_level()),
            "direct access without a covering lock"
        );
    }

    // --- reads (locked for consistency; the collection itself is not
    // otherwise thread-safe) ---

    pub fn len(&self) -> usize {
        let locks = self.locks();
        locks.lock_one(&self.neuron, self.relation.own_level(), false);
        let n = self.own_col(&self.neuron).read().len();
        locks.unlock_one(&self.neuron, self.relation.own_level(), false);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<NeuronId> {
        let locks = self.locks();
        locks.lock_one(&self.neuron, self.relation.own_level(), false);
        let id = self.own_col(&self.neuron).read().get(index).copied();
        locks.unlock_one(&self.neuron, self.relation.own_level(), false);
        id
    }

    pub fn contains(&self, id: NeuronId) -> bool {
        let locks = self.locks();
        locks.lock_one(&self.neuron, self.relation.own_level(), false);
        let found = self.own_col(&self.neuron).read().contains(&id);
        locks.unlock_one(&self.neuron, self.relation.own_level(), false);
        found
    }

    /// Snapshot of the whole list under one lock.
    pub fn ids(&self) -> Vec<NeuronId> {
        let locks = self.locks();
        locks.lock_one(&self.neuron, self.relation.own_level(), false);
        let out = self.own_col(&self.neuron).read().clone();
        locks.unlock_one(&self.neuron, self.relation.own_level(), false);
        out
    }

    /// Iterate with the lock held for the whole enumeration; released when
    /// the iterator drops.
    pub fn iter(&self) -> LockedIds<'_> {
        self.locks()
            .lock_one(&self.neuron, self.relation.own_level(), false);
        LockedIds {
            locks: self.locks(),
            neuron: &self.neuron,
            level: self.relation.own_level(),
            guard: self.own_col(&self.neuron).read(),
            pos: 0,
        }
    }

    // --- writes (lock both sides, update the inverse in the same step) ---

    fn two_sided_batch(&self, item: &Arc<Neuron>) -> LockBatch {
        let mut batch = LockBatch::new();
        batch.add(&self.neuron, self.relation.own_level(), true);
        batch.add(item, self.relation.far_level(), true);
        batch
    }

    /// Attach `item`. Returns false when either side was retired by a
    /// concurrent deletion: liveness is re-checked under the grant, so a
    /// handle gathered before the deletion serialized cannot re-attach a
    /// dead neuron.
    pub fn add(&self, item: &Arc<Neuron>) -> bool {
        debug_assert!(self.writeable, "add on a read-only accessor");
        self.brain.register(&self.neuron);
        self.brain.register(item);

        let mut batch = self.two_sided_batch(item);
        self.locks().acquire(&mut batch);
        let attached = self.neuron.is_alive() && item.is_alive();
        if attached {
            self.direct_add(item);
        }
        self.locks().release(&batch);
        if attached {
            batch.mark_changed(false);
        }
        attached
    }

    /// Positioned [`add`](Self::add); same liveness contract.
    pub fn insert(&self, index: usize, item: &Arc<Neuron>) -> bool {
        debug_assert!(self.writeable, "insert on a read-only accessor");
        self.brain.register(&self.neuron);
        self.brain.register(item);

        let mut batch = self.two_sided_batch(item);
        self.locks().acquire(&mut batch);
        let attached = self.neuron.is_alive() && item.is_alive();
        if attached {
            self.direct_insert(index, item);
        }
        self.locks().release(&batch);
        if attached {
            batch.mark_changed(false);
        }
        attached
    }

    pub fn remove(&self, item: &Arc<Neuron>) -> bool {
        debug_assert!(self.writeable, "remove on a read-only accessor");
        let mut batch = self.two_sided_batch(item);
        self.locks().acquire(&mut batch);
        let removed = self.direct_remove(item);
        self.locks().release(&batch);
        if removed {
            batch.mark_changed(false);
        }
        removed
    }

    /// Replace the entry at `index`, detaching the previous occupant's
    /// inverse reference. Returns the previous occupant.
    ///
    /// Gather-then-acquire: the occupant is read first, the full batch
    /// (node + old far side + new far side) is acquired, and the read is
    /// re-validated under the grant; a concurrent change restarts the loop.
    pub fn set(&self, index: usize, item: &Arc<Neuron>) -> Option<NeuronId> {
        debug_assert!(self.writeable, "set on a read-only accessor");
        self.brain.register(&self.neuron);
        self.brain.register(item);
        let locks = self.locks();

        loop {
            let old_id = self.get(index)?;
            let old = self.brain.resolve(old_id);

            let mut batch = self.two_sided_batch(item);
            if let Some(old) = &old {
                batch.add(old, self.relation.far_level(), true);
            }
            locks.acquire(&mut batch);

            let unchanged =
                self.own_col(&self.neuron).read().get(index).copied() == Some(old_id);
            if !unchanged {
                locks.release(&batch);
                continue;
            }
            if !(self.neuron.is_alive() && item.is_alive()) {
                locks.release(&batch);
                return None;
            }

            self.own_col(&self.neuron).write()[index] = item.id();
            if let Some(old) = &old {
                remove_first(&mut self.far_col(old).write(), self.neuron.id());
            }
            self.far_col(item).write().push(self.neuron.id());

            locks.release(&batch);
            batch.mark_changed(false);
            return Some(old_id);
        }
    }

    /// Empty the list, detaching every member's inverse reference.
    ///
    /// Same gather/re-validate loop as [`set`](Self::set), because the far
    /// sides must all be in the batch before anything is touched.
    pub fn clear(&self) {
        debug_assert!(self.writeable, "clear on a read-only accessor");
        self.brain.register(&self.neuron);
        let locks = self.locks();

        loop {
            let snapshot = self.ids();
            let mut batch = LockBatch::new();
            batch.add(&self.neuron, self.relation.own_level(), true);
            let mut members = Vec::with_capacity(snapshot.len());
            for &id in &snapshot {
                if id == self.neuron.id() {
                    continue;
                }
                if let Some(member) = self.brain.resolve(id) {
                    batch.add(&member, self.relation.far_level(), true);
                    members.push(member);
                }
            }
            locks.acquire(&mut batch);

            if *self.own_col(&self.neuron).read() != snapshot {
                locks.release(&batch);
                continue;
            }

            for member in &members {
                while remove_first(&mut self.far_col(member).write(), self.neuron.id()) {}
            }
            // Self-referential entries fall out with the list itself.
            if snapshot.contains(&self.neuron.id()) {
                while remove_first(&mut self.far_col(&self.neuron).write(), self.neuron.id()) {}
            }
            self.own_col(&self.neuron).write().clear();

            locks.release(&batch);
            batch.mark_changed(false);
            return;
        }
    }

    // --- direct variants: enclosing batch already holds the grants ---

    pub fn direct_len(&self) -> usize {
        self.assert_direct();
        self.own_col(&self.neuron).read().len()
    }

    pub fn direct_get(&self, index: usize) -> Option<NeuronId> {
        self.assert_direct();
        self.own_col(&self.neuron).read().get(index).copied()
    }

    pub fn direct_contains(&self, id: NeuronId) -> bool {
        self.assert_direct();
        self.own_col(&self.neuron).read().contains(&id)
    }

    pub fn direct_ids(&self) -> Vec<NeuronId> {
        self.assert_direct();
        self.own_col(&self.neuron).read().clone()
    }

    pub fn direct_add(&self, item: &Arc<Neuron>) {
        self.assert_direct();
        self.own_col(&self.neuron).write().push(item.id());
        self.far_col(item).write().push(self.neuron.id());
    }

    pub fn direct_insert(&self, index: usize, item: &Arc<Neuron>) {
        self.assert_direct();
        {
            let mut own = self.own_col(&self.neuron).write();
            let index = index.min(own.len());
            own.insert(index, item.id());
        }
        self.far_col(item).write().push(self.neuron.id());
    }

    pub fn direct_remove(&self, item: &Arc<Neuron>) -> bool {
        self.assert_direct();
        let removed = remove_first(&mut self.own_col(&self.neuron).write(), item.id());
        if removed {
            remove_first(&mut self.far_col(item).write(), self.neuron.id());
        }
        removed
    }

    pub fn direct_clear(&self) {
        self.assert_direct();
        self.own_col(&self.neuron).write().clear();
    }
}

/// Iterator over an id relation with the lock held until drop.
pub struct LockedIds<'a> {
    locks: &'a LockCoordinator,
    neuron: &'a Arc<Neuron>,
    level: LockLevel,
    guard: RwLockReadGuard<'a, Vec<NeuronId>>,
    pos: usize,
}

impl Iterator for LockedIds<'_> {
    type Item = NeuronId;

    fn next(&mut self) -> Option<NeuronId> {
        let id = self.guard.get(self.pos).copied()?;
        self.pos += 1;
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.guard.len() - self.pos.min(self.guard.len());
        (rest, Some(rest))
    }
}

impl Drop for LockedIds<'_> {
    fn drop(&mut self) {
        self.locks.unlock_one(self.neuron, self.level, false);
    }
}

/// View over `links_in` or `links_out`.
pub struct LinkAccessor<'b> {
    brain: &'b Brain,
    neuron: Arc<Neuron>,
    relation: Relation,
    writeable: bool,
}

impl<'b> LinkAccessor<'b> {
    /// `relation` must be `LinksIn` or `LinksOut`.
    pub fn new(brain: &'b Brain, neuron: Arc<Neuron>, relation: Relation, writeable: bool) -> Self {
        debug_assert!(
            matches!(relation, Relation::LinksIn | Relation::LinksOut),
            "LinkAccessor views link relations"
        );
        Self {
            brain,
            neuron,
            relation,
            writeable,
        }
    }

    pub fn links_out(brain: &'b Brain, neuron: Arc<Neuron>, writeable: bool) -> Self {
        Self::new(brain, neuron, Relation::LinksOut, writeable)
    }

    pub fn links_in(brain: &'b Brain, neuron: Arc<Neuron>, writeable: bool) -> Self {
        Self::new(brain, neuron, Relation::LinksIn, writeable)
    }

    fn own_col<'n>(&self, n: &'n Neuron) -> &'n parking_lot::RwLock<Vec<Arc<Link>>> {
        match self.relation {
            Relation::LinksOut => &n.links_out,
            _ => &n.links_in,
        }
    }

    fn far_col<'n>(&self, n: &'n Neuron) -> &'n parking_lot::RwLock<Vec<Arc<Link>>> {
        match self.relation {
            Relation::LinksOut => &n.links_in,
            _ => &n.links_out,
        }
    }

    /// The remote endpoint of `link` as seen from this accessor's side.
    fn partner_id(&self, link: &Link) -> NeuronId {
        match self.relation {
            Relation::LinksOut => link.to(),
            _ => link.from(),
        }
    }

    fn assert_direct(&self) {
        debug_assert!(
            !self.neuron.is_registered()
                || self
                    .brain
                    .locks()
                    .covered(self.neuron.id(), self.relation.own_level()),
            "direct access without a covering lock"
        );
    }

    pub fn len(&self) -> usize {
        let locks = self.brain.locks();
        locks.lock_one(&self.neuron, self.relation.own_level(), false);
        let n = self.own_col(&self.neuron).read().len();
        locks.unlock_one(&self.neuron, self.relation.own_level(), false);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Arc<Link>> {
        let locks = self.brain.locks();
        locks.lock_one(&self.neuron, self.relation.own_level(), false);
        let link = self.own_col(&self.neuron).read().get(index).cloned();
        locks.unlock_one(&self.neuron, self.relation.own_level(), false);
        link
    }

    pub fn contains(&self, link: &Arc<Link>) -> bool {
        let locks = self.brain.locks();
        locks.lock_one(&self.neuron, self.relation.own_level(), false);
        let found = self
            .own_col(&self.neuron)
            .read()
            .iter()
            .any(|l| Arc::ptr_eq(l, link));
        locks.unlock_one(&self.neuron, self.relation.own_level(), false);
        found
    }

    /// Snapshot of the whole list under one lock.
    pub fn links(&self) -> Vec<Arc<Link>> {
        let locks = self.brain.locks();
        locks.lock_one(&self.neuron, self.relation.own_level(), false);
        let out = self.own_col(&self.neuron).read().clone();
        locks.unlock_one(&self.neuron, self.relation.own_level(), false);
        out
    }

    pub fn iter(&self) -> LockedLinks<'_> {
        self.brain
            .locks()
            .lock_one(&self.neuron, self.relation.own_level(), false);
        LockedLinks {
            locks: self.brain.locks(),
            neuron: &self.neuron,
            level: self.relation.own_level(),
            guard: self.own_col(&self.neuron).read(),
            pos: 0,
        }
    }

    /// Destroy one link: detach it from both endpoints, decrement the
    /// meaning's and each info node's usage, notify, invalidate. Returns
    /// false if the link was already destroyed concurrently.
    pub fn detach(&self, link: &Arc<Link>) -> bool {
        debug_assert!(self.writeable, "detach on a read-only accessor");
        let partner = self.brain.resolve(self.partner_id(link));
        let meaning = self.brain.resolve(link.meaning());

        let mut batch = LockBatch::new();
        batch.add(&self.neuron, self.relation.own_level(), true);
        if let Some(p) = &partner {
            batch.add(p, self.relation.far_level(), true);
        }
        if let Some(m) = &meaning {
            batch.add(m, LockLevel::Value, true);
        }
        let locks = self.brain.locks();
        locks.acquire(&mut batch);

        let destroyed = link.invalidate();
        if destroyed {
            remove_link(&mut self.own_col(&self.neuron).write(), link);
            if let Some(p) = &partner {
                remove_link(&mut self.far_col(p).write(), link);
            }
            if let Some(m) = &meaning {
                m.drop_usage();
            }
            for info in link.info() {
                if let Some(n) = self.brain.resolve(info) {
                    n.drop_usage();
                }
            }
        }

        locks.release(&batch);
        if destroyed {
            batch.mark_changed(false);
            self.brain.notify_link_destroyed(link);
        }
        destroyed
    }

    pub fn direct_len(&self) -> usize {
        self.assert_direct();
        self.own_col(&self.neuron).read().len()
    }

    pub fn direct_get(&self, index: usize) -> Option<Arc<Link>> {
        self.assert_direct();
        self.own_col(&self.neuron).read().get(index).cloned()
    }

    pub fn direct_contains(&self, link: &Arc<Link>) -> bool {
        self.assert_direct();
        self.own_col(&self.neuron)
            .read()
            .iter()
            .any(|l| Arc::ptr_eq(l, link))
    }

    pub fn direct_links(&self) -> Vec<Arc<Link>> {
        self.assert_direct();
        self.own_col(&self.neuron).read().clone()
    }

    pub fn direct_add(&self, link: &Arc<Link>) {
        self.assert_direct();
        self.own_col(&self.neuron).write().push(Arc::clone(link));
    }

    pub fn direct_remove(&self, link: &Arc<Link>) -> bool {
        self.assert_direct();
        remove_link(&mut self.own_col(&self.neuron).write(), link)
    }

    pub fn direct_clear(&self) {
        self.assert_direct();
        self.own_col(&self.neuron).write().clear();
    }
}

/// Iterator over a link relation with the lock held until drop.
pub struct LockedLinks<'a> {
    locks: &'a LockCoordinator,
    neuron: &'a Arc<Neuron>,
    level: LockLevel,
    guard: RwLockReadGuard<'a, Vec<Arc<Link>>>,
    pos: usize,
}

impl Iterator for LockedLinks<'_> {
    type Item = Arc<Link>;

    fn next(&mut self) -> Option<Arc<Link>> {
        let link = self.guard.get(self.pos).cloned()?;
        self.pos += 1;
        Some(link)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.guard.len() - self.pos.min(self.guard.len());
        (rest, Some(rest))
    }
}

impl Drop for LockedLinks<'_> {
    fn drop(&mut self) {
        self.locks.unlock_one(self.neuron, self.level, false);
    }
}

/// List view over one link's `info` annotation nodes.
///
/// A link has no lock identity of its own; it is co-owned by its endpoints,
/// so info operations lock `from` at `LinksOut` and `to` at `LinksIn`, plus
/// the touched info node at `Value` when usage counts change.
pub struct InfoAccessor<'b> {
    brain: &'b Brain,
    link: Arc<Link>,
    writeable: bool,
}

impl<'b> InfoAccessor<'b> {
    pub fn new(brain: &'b Brain, link: Arc<Link>, writeable: bool) -> Self {
        Self {
            brain,
            link,
            writeable,
        }
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    fn endpoint_batch(&self, writeable: bool) -> LockBatch {
        let mut batch = LockBatch::new();
        if let Some(from) = self.brain.resolve(self.link.from()) {
            batch.add(&from, LockLevel::LinksOut, writeable);
        }
        if let Some(to) = self.brain.resolve(self.link.to()) {
            batch.add(&to, LockLevel::LinksIn, writeable);
        }
        batch
    }

    pub fn len(&self) -> usize {
        let mut batch = self.endpoint_batch(false);
        self.brain.locks().acquire(&mut batch);
        let n = self.link.info.read().len();
        self.brain.locks().release(&batch);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<NeuronId> {
        let mut batch = self.endpoint_batch(false);
        self.brain.locks().acquire(&mut batch);
        let id = self.link.info.read().get(index).copied();
        self.brain.locks().release(&batch);
        id
    }

    pub fn contains(&self, id: NeuronId) -> bool {
        let mut batch = self.endpoint_batch(false);
        self.brain.locks().acquire(&mut batch);
        let found = self.link.info.read().contains(&id);
        self.brain.locks().release(&batch);
        found
    }

    /// Snapshot of the annotation list under the endpoint locks.
    pub fn ids(&self) -> Vec<NeuronId> {
        let mut batch = self.endpoint_batch(false);
        self.brain.locks().acquire(&mut batch);
        let out = self.link.info.read().clone();
        self.brain.locks().release(&batch);
        out
    }

    /// Iterate with the endpoint locks held for the whole enumeration;
    /// released when the iterator drops.
    pub fn iter(&self) -> LockedInfo<'_> {
        let mut batch = self.endpoint_batch(false);
        self.brain.locks().acquire(&mut batch);
        LockedInfo {
            locks: self.brain.locks(),
            batch,
            guard: self.link.info.read(),
            pos: 0,
        }
    }

    /// Annotate the link with `node`. Returns false when the link was
    /// destroyed or the node retired by a concurrent deletion (liveness
    /// re-checked under the grant).
    pub fn add(&self, node: &Arc<Neuron>) -> bool {
        debug_assert!(self.writeable, "add on a read-only accessor");
        self.brain.register(node);
        let mut batch = self.endpoint_batch(true);
        batch.add(node, LockLevel::Value, true);
        self.brain.locks().acquire(&mut batch);
        let attached = self.link.is_valid() && node.is_alive();
        if attached {
            self.link.info.write().push(node.id());
            node.bump_usage();
        }
        self.brain.locks().release(&batch);
        if attached {
            batch.mark_changed(false);
        }
        attached
    }

    /// Positioned [`add`](Self::add); same liveness contract.
    pub fn insert(&self, index: usize, node: &Arc<Neuron>) -> bool {
        debug_assert!(self.writeable, "insert on a read-only accessor");
        self.brain.register(node);
        let mut batch = self.endpoint_batch(true);
        batch.add(node, LockLevel::Value, true);
        self.brain.locks().acquire(&mut batch);
        let attached = self.link.is_valid() && node.is_alive();
        if attached {
            let mut info = self.link.info.write();
            let index = index.min(info.len());
            info.insert(index, node.id());
            drop(info);
            node.bump_usage();
        }
        self.brain.locks().release(&batch);
        if attached {
            batch.mark_changed(false);
        }
        attached
    }

    /// Replace the annotation at `index`, settling both usage counts.
    /// Returns the previous occupant. Same gather/re-validate loop as
    /// [`RelationAccessor::set`]: the occupant is read first, the full
    /// batch is acquired, and the read is re-checked under the grant.
    pub fn set(&self, index: usize, node: &Arc<Neuron>) -> Option<NeuronId> {
        debug_assert!(self.writeable, "set on a read-only accessor");
        self.brain.register(node);
        let locks = self.brain.locks();

        loop {
            let old_id = self.get(index)?;
            let old = self.brain.resolve(old_id);

            let mut batch = self.endpoint_batch(true);
            batch.add(node, LockLevel::Value, true);
            if let Some(old) = &old {
                batch.add(old, LockLevel::Value, true);
            }
            locks.acquire(&mut batch);

            if self.link.info.read().get(index).copied() != Some(old_id) {
                locks.release(&batch);
                continue;
            }
            if !(self.link.is_valid() && node.is_alive()) {
                locks.release(&batch);
                return None;
            }

            self.link.info.write()[index] = node.id();
            node.bump_usage();
            if let Some(old) = &old {
                old.drop_usage();
            }

            locks.release(&batch);
            batch.mark_changed(false);
            return Some(old_id);
        }
    }

    pub fn remove(&self, node: &Arc<Neuron>) -> bool {
        debug_assert!(self.writeable, "remove on a read-only accessor");
        let mut batch = self.endpoint_batch(true);
        batch.add(node, LockLevel::Value, true);
        self.brain.locks().acquire(&mut batch);
        let removed = remove_first(&mut self.link.info.write(), node.id());
        if removed {
            node.drop_usage();
        }
        self.brain.locks().release(&batch);
        if removed {
            batch.mark_changed(false);
        }
        removed
    }

    /// Empty the annotation list, settling every member's usage count.
    /// Gather/re-validate loop, because every member must be in the batch
    /// at `Value` before anything is touched.
    pub fn clear(&self) {
        debug_assert!(self.writeable, "clear on a read-only accessor");
        let locks = self.brain.locks();

        loop {
            let snapshot = self.ids();
            let mut batch = self.endpoint_batch(true);
            let mut members = Vec::with_capacity(snapshot.len());
            for &id in &snapshot {
                if let Some(member) = self.brain.resolve(id) {
                    batch.add(&member, LockLevel::Value, true);
                    members.push(member);
                }
            }
            locks.acquire(&mut batch);

            if *self.link.info.read() != snapshot {
                locks.release(&batch);
                continue;
            }

            for member in &members {
                member.drop_usage();
            }
            self.link.info.write().clear();

            locks.release(&batch);
            batch.mark_changed(false);
            return;
        }
    }

    // --- direct variants: enclosing batch already holds the endpoint
    // grants (and `Value` on any node whose usage changes) ---

    fn assert_direct(&self) {
        let covered = |id: NeuronId, level: LockLevel| {
            self.brain.resolve(id).is_none() || self.brain.locks().covered(id, level)
        };
        debug_assert!(
            covered(self.link.from(), LockLevel::LinksOut)
                && covered(self.link.to(), LockLevel::LinksIn),
            "direct access without covering endpoint locks"
        );
    }

    pub fn direct_len(&self) -> usize {
        self.assert_direct();
        self.link.info.read().len()
    }

    pub fn direct_get(&self, index: usize) -> Option<NeuronId> {
        self.assert_direct();
        self.link.info.read().get(index).copied()
    }

    pub fn direct_contains(&self, id: NeuronId) -> bool {
        self.assert_direct();
        self.link.info.read().contains(&id)
    }

    pub fn direct_ids(&self) -> Vec<NeuronId> {
        self.assert_direct();
        self.link.info.read().clone()
    }

    pub fn direct_add(&self, node: &Arc<Neuron>) {
        self.assert_direct();
        self.link.info.write().push(node.id());
        node.bump_usage();
    }

    pub fn direct_insert(&self, index: usize, node: &Arc<Neuron>) {
        self.assert_direct();
        {
            let mut info = self.link.info.write();
            let index = index.min(info.len());
            info.insert(index, node.id());
        }
        node.bump_usage();
    }

    pub fn direct_set(&self, index: usize, node: &Arc<Neuron>) -> Option<NeuronId> {
        self.assert_direct();
        let old_id = {
            let mut info = self.link.info.write();
            let slot = info.get_mut(index)?;
            std::mem::replace(slot, node.id())
        };
        node.bump_usage();
        if let Some(old) = self.brain.resolve(old_id) {
            old.drop_usage();
        }
        Some(old_id)
    }

    pub fn direct_remove(&self, node: &Arc<Neuron>) -> bool {
        self.assert_direct();
        let removed = remove_first(&mut self.link.info.write(), node.id());
        if removed {
            node.drop_usage();
        }
        removed
    }

    pub fn direct_clear(&self) {
        self.assert_direct();
        let drained = std::mem::take(&mut *self.link.info.write());
        for id in drained {
            if let Some(member) = self.brain.resolve(id) {
                member.drop_usage();
            }
        }
    }
}

/// Iterator over a link's annotations with the endpoint locks held until
/// drop.
pub struct LockedInfo<'a> {
    locks: &'a LockCoordinator,
    batch: LockBatch,
    guard: RwLockReadGuard<'a, Vec<NeuronId>>,
    pos: usize,
}

impl Iterator for LockedInfo<'_> {
    type Item = NeuronId;

    fn next(&mut self) -> Option<NeuronId> {
        let id = self.guard.get(self.pos).copied()?;
        self.pos += 1;
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.guard.len() - self.pos.min(self.guard.len());
        (rest, Some(rest))
    }
}

impl Drop for LockedInfo<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.batch);
    }
}

/// Set view over the processors attached to one neuron.
pub struct ProcessorSetAccessor<'b> {
    brain: &'b Brain,
    neuron: Arc<Neuron>,
    writeable: bool,
}

impl<'b> ProcessorSetAccessor<'b> {
    pub fn new(brain: &'b Brain, neuron: Arc<Neuron>, writeable: bool) -> Self {
        Self {
            brain,
            neuron,
            writeable,
        }
    }

    pub fn len(&self) -> usize {
        let locks = self.brain.locks();
        locks.lock_one(&self.neuron, LockLevel::Processors, false);
        let n = self.neuron.processors.read().len();
        locks.unlock_one(&self.neuron, LockLevel::Processors, false);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, processor: ProcessorId) -> bool {
        let locks = self.brain.locks();
        locks.lock_one(&self.neuron, LockLevel::Processors, false);
        let found = self.neuron.processors.read().contains(&processor);
        locks.unlock_one(&self.neuron, LockLevel::Processors, false);
        found
    }

    /// Add with set semantics: a processor is attached at most once.
    /// Returns false if it was already present.
    pub fn add(&self, processor: ProcessorId) -> bool {
        debug_assert!(self.writeable, "add on a read-only accessor");
        let locks = self.brain.locks();
        locks.lock_one(&self.neuron, LockLevel::Processors, true);
        let added = {
            let mut procs = self.neuron.processors.write();
            if procs.contains(&processor) {
                false
            } else {
                procs.push(processor);
                true
            }
        };
        locks.unlock_one(&self.neuron, LockLevel::Processors, true);
        if added {
            self.neuron.mark_changed();
        }
        added
    }

    pub fn remove(&self, processor: ProcessorId) -> bool {
        debug_assert!(self.writeable, "remove on a read-only accessor");
        let locks = self.brain.locks();
        locks.lock_one(&self.neuron, LockLevel::Processors, true);
        let removed = remove_first(&mut self.neuron.processors.write(), processor);
        locks.unlock_one(&self.neuron, LockLevel::Processors, true);
        if removed {
            self.neuron.mark_changed();
        }
        removed
    }

    pub fn clear(&self) {
        debug_assert!(self.writeable, "clear on a read-only accessor");
        let locks = self.brain.locks();
        locks.lock_one(&self.neuron, LockLevel::Processors, true);
        self.neuron.processors.write().clear();
        locks.unlock_one(&self.neuron, LockLevel::Processors, true);
        self.neuron.mark_changed();
    }

    pub fn iter(&self) -> LockedIds<'_> {
        self.brain
            .locks()
            .lock_one(&self.neuron, LockLevel::Processors, false);
        LockedIds {
            locks: self.brain.locks(),
            neuron: &self.neuron,
            level: LockLevel::Processors,
            guard: self.neuron.processors.read(),
            pos: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::BrainConfig;
    use crate::neuron::NeuronValue;

    fn brain() -> Brain {
        Brain::new(BrainConfig::default())
    }

    #[test]
    fn add_child_updates_both_sides_atomically() {
        let brain = brain();
        let cluster = brain.insert(Neuron::cluster());
        let child = brain.insert(Neuron::value(NeuronValue::Int(1)));

        RelationAccessor::children(&brain, Arc::clone(&cluster), true).add(&child);

        assert_eq!(*cluster.children.read(), vec![child.id()]);
        assert_eq!(*child.clustered_by.read(), vec![cluster.id()]);
        assert_eq!(brain.locks().held_on(cluster.id()), 0);
        assert_eq!(brain.locks().held_on(child.id()), 0);
    }

    #[test]
    fn remove_child_detaches_the_inverse() {
        let brain = brain();
        let cluster = brain.insert(Neuron::cluster());
        let child = brain.insert(Neuron::value(NeuronValue::Int(1)));

        let children = RelationAccessor::children(&brain, Arc::clone(&cluster), true);
        children.add(&child);
        assert!(children.remove(&child));
        assert!(!children.remove(&child));

        assert!(cluster.children.read().is_empty());
        assert!(child.clustered_by.read().is_empty());
    }

    #[test]
    fn set_swaps_the_far_side_reference() {
        let brain = brain();
        let cluster = brain.insert(Neuron::cluster());
        let old = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let new = brain.insert(Neuron::value(NeuronValue::Int(2)));

        let children = RelationAccessor::children(&brain, Arc::clone(&cluster), true);
        children.add(&old);
        let previous = children.set(0, &new);

        assert_eq!(previous, Some(old.id()));
        assert_eq!(*cluster.children.read(), vec![new.id()]);
        assert!(old.clustered_by.read().is_empty());
        assert_eq!(*new.clustered_by.read(), vec![cluster.id()]);
    }

    #[test]
    fn set_out_of_range_is_none() {
        let brain = brain();
        let cluster = brain.insert(Neuron::cluster());
        let item = brain.insert(Neuron::value(NeuronValue::Empty));
        let children = RelationAccessor::children(&brain, Arc::clone(&cluster), true);
        assert_eq!(children.set(3, &item), None);
    }

    #[test]
    fn clear_detaches_every_member() {
        let brain = brain();
        let cluster = brain.insert(Neuron::cluster());
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));

        let children = RelationAccessor::children(&brain, Arc::clone(&cluster), true);
        children.add(&a);
        children.add(&b);
        children.add(&a); // duplicates are allowed in an ordered child list
        children.clear();

        assert!(cluster.children.read().is_empty());
        assert!(a.clustered_by.read().is_empty());
        assert!(b.clustered_by.read().is_empty());
    }

    #[test]
    fn clear_handles_a_self_referential_cluster() {
        let brain = brain();
        let cluster = brain.insert(Neuron::cluster());

        let children = RelationAccessor::children(&brain, Arc::clone(&cluster), true);
        children.add(&cluster);
        assert_eq!(*cluster.clustered_by.read(), vec![cluster.id()]);

        children.clear();
        assert!(cluster.children.read().is_empty());
        assert!(cluster.clustered_by.read().is_empty());
        assert_eq!(brain.locks().held_on(cluster.id()), 0);
    }

    #[test]
    fn iteration_holds_and_releases_the_lock() {
        let brain = brain();
        let cluster = brain.insert(Neuron::cluster());
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));

        let children = RelationAccessor::children(&brain, Arc::clone(&cluster), true);
        children.add(&a);
        children.add(&b);

        {
            let iter = children.iter();
            assert_eq!(brain.locks().held_on(cluster.id()), 1);
            let seen: Vec<_> = iter.collect();
            assert_eq!(seen, vec![a.id(), b.id()]);
        }
        assert_eq!(brain.locks().held_on(cluster.id()), 0);
    }

    #[test]
    fn parents_view_is_the_inverse_of_children() {
        let brain = brain();
        let cluster = brain.insert(Neuron::cluster());
        let child = brain.insert(Neuron::value(NeuronValue::Empty));

        RelationAccessor::parents(&brain, Arc::clone(&child), true).add(&cluster);

        assert_eq!(*cluster.children.read(), vec![child.id()]);
        assert_eq!(*child.clustered_by.read(), vec![cluster.id()]);
    }

    #[test]
    fn link_accessor_reads_and_detaches() {
        let brain = brain();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let m = brain.insert(Neuron::value(NeuronValue::Text("m".into())));
        let link = brain.connect(&a, &b, &m).unwrap();

        let out = LinkAccessor::links_out(&brain, Arc::clone(&a), true);
        assert_eq!(out.len(), 1);
        assert!(out.contains(&link));
        assert!(Arc::ptr_eq(&out.get(0).unwrap(), &link));

        assert!(out.detach(&link));
        assert!(!out.detach(&link));
        assert!(a.links_out.read().is_empty());
        assert!(b.links_in.read().is_empty());
        assert_eq!(m.usage(), 0);
        assert!(!link.is_valid());
    }

    #[test]
    fn info_accessor_counts_usage() {
        let brain = brain();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));
        let note = brain.insert(Neuron::value(NeuronValue::Text("note".into())));
        let link = brain.connect(&a, &b, &m).unwrap();

        let info = InfoAccessor::new(&brain, Arc::clone(&link), true);
        info.add(&note);
        assert_eq!(info.len(), 1);
        assert!(info.contains(note.id()));
        assert_eq!(note.usage(), 1);

        assert!(info.remove(&note));
        assert_eq!(note.usage(), 0);
        assert!(info.is_empty());
    }

    #[test]
    fn add_refuses_a_retired_item() {
        let brain = brain();
        let ws = brain.workspace();
        let cluster = brain.insert(Neuron::cluster());
        let live = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let victim = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let keep = Arc::clone(&victim);
        crate::function::Deleter::new(&brain, &ws)
            .delete(victim)
            .unwrap();

        let children = RelationAccessor::children(&brain, Arc::clone(&cluster), true);
        // A handle gathered before the deletion must not re-attach the node.
        assert!(!children.add(&keep));
        assert!(!children.insert(0, &keep));
        assert!(cluster.children.read().is_empty());
        assert!(keep.clustered_by.read().is_empty());

        children.add(&live);
        assert_eq!(children.set(0, &keep), None);
        assert_eq!(*cluster.children.read(), vec![live.id()]);
        assert!(keep.clustered_by.read().is_empty());
    }

    #[test]
    fn info_add_refuses_a_retired_node() {
        let brain = brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));
        let link = brain.connect(&a, &b, &m).unwrap();

        let victim = brain.insert(Neuron::value(NeuronValue::Int(3)));
        let keep = Arc::clone(&victim);
        crate::function::Deleter::new(&brain, &ws)
            .delete(victim)
            .unwrap();

        let info = InfoAccessor::new(&brain, Arc::clone(&link), true);
        assert!(!info.add(&keep));
        assert!(info.is_empty());
        assert_eq!(keep.usage(), 0);
    }

    #[test]
    fn info_set_insert_clear_settle_usage() {
        let brain = brain();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));
        let n1 = brain.insert(Neuron::value(NeuronValue::Text("n1".into())));
        let n2 = brain.insert(Neuron::value(NeuronValue::Text("n2".into())));
        let n3 = brain.insert(Neuron::value(NeuronValue::Text("n3".into())));
        let link = brain.connect(&a, &b, &m).unwrap();

        let info = InfoAccessor::new(&brain, Arc::clone(&link), true);
        info.add(&n1);
        info.insert(0, &n2);
        assert_eq!(info.ids(), vec![n2.id(), n1.id()]);

        let previous = info.set(1, &n3);
        assert_eq!(previous, Some(n1.id()));
        assert_eq!(info.ids(), vec![n2.id(), n3.id()]);
        assert_eq!(n1.usage(), 0);
        assert_eq!(n3.usage(), 1);
        assert_eq!(info.set(5, &n1), None);

        info.clear();
        assert!(info.is_empty());
        assert_eq!(n2.usage(), 0);
        assert_eq!(n3.usage(), 0);
        assert_eq!(brain.locks().held_on(a.id()), 0);
        assert_eq!(brain.locks().held_on(b.id()), 0);
    }

    #[test]
    fn info_iteration_holds_the_endpoint_locks() {
        let brain = brain();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));
        let note = brain.insert(Neuron::value(NeuronValue::Text("note".into())));
        let link = brain.connect(&a, &b, &m).unwrap();

        let info = InfoAccessor::new(&brain, Arc::clone(&link), true);
        info.add(&note);

        {
            let iter = info.iter();
            assert_eq!(brain.locks().held_on(a.id()), 1);
            assert_eq!(brain.locks().held_on(b.id()), 1);
            let seen: Vec<_> = iter.collect();
            assert_eq!(seen, vec![note.id()]);
        }
        assert_eq!(brain.locks().held_on(a.id()), 0);
        assert_eq!(brain.locks().held_on(b.id()), 0);
    }

    #[test]
    fn processor_set_has_set_semantics() {
        let brain = brain();
        let n = brain.insert(Neuron::value(NeuronValue::Empty));
        let procs = ProcessorSetAccessor::new(&brain, Arc::clone(&n), true);

        assert!(procs.add(7));
        assert!(!procs.add(7));
        assert!(procs.contains(7));
        assert_eq!(procs.len(), 1);
        assert!(procs.remove(7));
        assert!(procs.is_empty());
        assert_eq!(brain.locks().held_on(n.id()), 0);
    }

    #[test]
    fn neuron_accessor_value_round_trip() {
        let brain = brain();
        let n = brain.insert(Neuron::value(NeuronValue::Int(3)));
        let acc = NeuronAccessor::new(&brain, Arc::clone(&n), LockLevel::Value, true);

        assert_eq!(acc.value(), NeuronValue::Int(3));
        acc.set_value(NeuronValue::Text("three".into()));
        assert_eq!(acc.value(), NeuronValue::Text("three".into()));
        assert!(n.is_changed());
    }

    #[test]
    fn locked_scope_releases_on_exit() {
        let brain = brain();
        let n = brain.insert(Neuron::cluster());
        let acc = NeuronAccessor::new(&brain, Arc::clone(&n), LockLevel::All, true);

        acc.locked(|neuron| {
            assert_eq!(brain.locks().held_on(neuron.id()), 1);
        });
        assert_eq!(brain.locks().held_on(n.id()), 0);
    }

    #[test]
    fn direct_variants_work_under_an_enclosing_batch() {
        let brain = brain();
        let cluster = brain.insert(Neuron::cluster());
        let child = brain.insert(Neuron::value(NeuronValue::Empty));

        let mut batch = LockBatch::new();
        batch.add(&cluster, LockLevel::All, true);
        batch.add(&child, LockLevel::Parents, true);
        brain.locks().acquire(&mut batch);

        let children = RelationAccessor::children(&brain, Arc::clone(&cluster), true);
        children.direct_add(&child);
        assert_eq!(children.direct_len(), 1);
        assert!(children.direct_contains(child.id()));

        brain.locks().release(&batch);
        batch.mark_changed(false);
        assert!(cluster.is_changed());
    }

    #[test]
    fn accessors_on_temp_neurons_skip_locking() {
        let brain = brain();
        // Deliberately unregistered: single-owner by contract.
        let temp = Arc::new(Neuron::cluster());
        let child = brain.insert(Neuron::value(NeuronValue::Empty));

        let children = RelationAccessor::children(&brain, Arc::clone(&temp), true);
        // add() registers the accessed node on demand.
        children.add(&child);
        assert!(temp.is_registered());
        assert_eq!(*temp.children.read(), vec![child.id()]);
    }
}
