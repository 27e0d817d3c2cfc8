//! Structural mutation: duplicate, multi-duplicate, delete.
//!
//! All three algorithms share one three-phase protocol, implemented by
//! [`NeuronFunction`]:
//!
//! 1. **Snapshot.** One `All`-level read lock on the source only; copy its
//!    relation collections by reference into pooled scratch; release. Lock
//!    hold-time is bounded by the source's own fan-out, independent of the
//!    neighborhood's size.
//! 2. **Batch assembly.** Outside any lock, walk the scratch and build one
//!    deduplicated batch covering the source (`All`), every target (`All`)
//!    and every discovered neighbor at the level its relation implies.
//! 3. **Atomic acquire, validate, mutate, release.** The batch is granted
//!    all-or-nothing. The source is re-checked against the snapshot under
//!    the grant; neighbors added in the assembly window would otherwise be
//!    mutated without their locks, so a drifted source restarts at phase 1.
//!    Neighbors *deleted* in the window are simply skipped via their
//!    liveness flags. Dirty marking happens after release.
//!
//! The public entry points return a tagged result and never panic; a failed
//! edit leaves whatever partial state existed (no rollback) with a logged
//! diagnostic, and every grant is released on every path.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, warn};

use crate::brain::Brain;
use crate::lock::{LockBatch, LockLevel};
use crate::neuron::{Link, Neuron, NeuronId, UNREGISTERED};
use crate::pool::{Loan, Workspace};

/// Why a structural edit could not start. Once phase 3 begins, the
/// algorithms cannot fail.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutateError {
    #[error("neuron {0} is retired")]
    Retired(NeuronId),
    #[error("source and target must be distinct neurons")]
    SameNeuron,
    #[error("a cluster can only be duplicated into a cluster")]
    KindMismatch,
}

fn logged<T>(op: &'static str, result: Result<T, MutateError>) -> Result<T, MutateError> {
    if let Err(e) = &result {
        error!(target: "neurograph::function", error = %e, "{op} failed");
    }
    result
}

/// Pooled scratch copy of a source's relations at snapshot time.
struct Snapshot<'w> {
    links_out: Loan<'w, Vec<Arc<Link>>>,
    links_in: Loan<'w, Vec<Arc<Link>>>,
    children: Loan<'w, Vec<NeuronId>>,
    parents: Loan<'w, Vec<NeuronId>>,
    meaning: NeuronId,
}

/// The shared three-phase engine the concrete algorithms specialize.
pub struct NeuronFunction<'a> {
    brain: &'a Brain,
    ws: &'a Workspace,
}

impl<'a> NeuronFunction<'a> {
    pub fn new(brain: &'a Brain, ws: &'a Workspace) -> Self {
        Self { brain, ws }
    }

    /// Phase 1: copy the source's relations under a short `All` read lock.
    fn snapshot(&self, source: &Arc<Neuron>) -> Snapshot<'a> {
        let locks = self.brain.locks();
        locks.lock_one(source, LockLevel::All, false);

        let mut links_out = self.ws.link_lists.loan();
        let mut links_in = self.ws.link_lists.loan();
        let mut children = self.ws.id_lists.loan();
        let mut parents = self.ws.id_lists.loan();
        links_out.extend(source.links_out.read().iter().cloned());
        links_in.extend(source.links_in.read().iter().cloned());
        children.extend(source.children.read().iter().copied());
        parents.extend(source.clustered_by.read().iter().copied());
        let meaning = *source.meaning.read();

        locks.unlock_one(source, LockLevel::All, false);
        Snapshot {
            links_out,
            links_in,
            children,
            parents,
            meaning,
        }
    }

    /// Phase 2: one deduplicated batch over the snapshot's neighborhood.
    /// Levels follow the relation: a link's far endpoint at the inverse
    /// link level, meanings and info nodes at `Value`, a parent at
    /// `Children`, a child at `Parents`, source and targets at `All`.
    fn assemble(
        &self,
        batch: &mut LockBatch,
        snap: &Snapshot<'_>,
        source: &Arc<Neuron>,
        targets: &[Arc<Neuron>],
    ) {
        batch.add(source, LockLevel::All, true);
        for target in targets {
            debug_assert!(target.is_registered(), "targets are registered pre-assembly");
            batch.add(target, LockLevel::All, true);
        }
        for link in snap.links_out.iter() {
            if let Some(partner) = self.brain.resolve(link.to()) {
                batch.add(&partner, LockLevel::LinksIn, true);
            }
            self.add_label_nodes(batch, link);
        }
        for link in snap.links_in.iter() {
            if let Some(partner) = self.brain.resolve(link.from()) {
                batch.add(&partner, LockLevel::LinksOut, true);
            }
            self.add_label_nodes(batch, link);
        }
        for &child in snap.children.iter() {
            if let Some(child) = self.brain.resolve(child) {
                batch.add(&child, LockLevel::Parents, true);
            }
        }
        for &parent in snap.parents.iter() {
            if let Some(parent) = self.brain.resolve(parent) {
                batch.add(&parent, LockLevel::Children, true);
            }
        }
        if snap.meaning != UNREGISTERED {
            if let Some(meaning) = self.brain.resolve(snap.meaning) {
                batch.add(&meaning, LockLevel::Value, true);
            }
        }
    }

    fn add_label_nodes(&self, batch: &mut LockBatch, link: &Arc<Link>) {
        if let Some(meaning) = self.brain.resolve(link.meaning()) {
            batch.add(&meaning, LockLevel::Value, true);
        }
        for info in link.info.read().iter() {
            if let Some(info) = self.brain.resolve(*info) {
                batch.add(&info, LockLevel::Value, true);
            }
        }
    }

    /// Is the source still exactly what the snapshot saw? Checked under the
    /// full batch before mutating.
    fn unchanged(&self, source: &Neuron, snap: &Snapshot<'_>) -> bool {
        let same_links = |have: &[Arc<Link>], want: &[Arc<Link>]| {
            have.len() == want.len()
                && have.iter().zip(want.iter()).all(|(a, b)| Arc::ptr_eq(a, b))
        };
        same_links(&source.links_out.read(), &snap.links_out)
            && same_links(&source.links_in.read(), &snap.links_in)
            && *source.children.read() == *snap.children
            && *source.clustered_by.read() == *snap.parents
            && *source.meaning.read() == snap.meaning
    }

    /// Phases 1-3 up to the mutation itself: snapshot, assemble, acquire,
    /// validate, retrying until the source holds still.
    ///
    /// On success the returned batch is *held*; the caller must release it
    /// (and then mark dirty) before dropping the loan.
    fn acquire_neighborhood(
        &self,
        source: &Arc<Neuron>,
        targets: &[Arc<Neuron>],
    ) -> Result<(Snapshot<'a>, Loan<'a, LockBatch>), MutateError> {
        let locks = self.brain.locks();
        loop {
            let snap = self.snapshot(source);
            let mut batch = self.ws.batches.loan();
            self.assemble(&mut batch, &snap, source, targets);
            locks.acquire(&mut batch);

            if !source.is_alive() {
                // Deleted while we were assembling.
                locks.release(&batch);
                return Err(MutateError::Retired(source.id()));
            }
            if self.unchanged(source, &snap) {
                return Ok((snap, batch));
            }
            locks.release(&batch);
        }
    }

    /// Duplicator/MultiDuplicator phase 3: recreate the snapshot's
    /// neighborhood around each target. Runs under the full batch.
    fn replicate(&self, snap: &Snapshot<'_>, source: &Arc<Neuron>, targets: &[Arc<Neuron>]) {
        for target in targets {
            // Scalar state first (outside-collection fields).
            *target.value.write() = source.value.read().clone();

            for link in snap.links_out.iter() {
                if let Some((copy, partner)) =
                    self.recreate_link(link, target.id(), link.to(), link.to())
                {
                    target.links_out.write().push(Arc::clone(&copy));
                    partner.links_in.write().push(copy);
                }
            }
            for link in snap.links_in.iter() {
                if let Some((copy, partner)) =
                    self.recreate_link(link, link.from(), target.id(), link.from())
                {
                    target.links_in.write().push(Arc::clone(&copy));
                    partner.links_out.write().push(copy);
                }
            }

            if source.is_cluster() {
                if snap.meaning != UNREGISTERED {
                    if let Some(meaning) = self
                        .brain
                        .resolve(snap.meaning)
                        .filter(|m| m.is_alive())
                    {
                        // A replaced meaning loses its reference; the usage
                        // count must follow, or it dangles forever.
                        let old = std::mem::replace(&mut *target.meaning.write(), snap.meaning);
                        if old != snap.meaning {
                            meaning.bump_usage();
                            if old != UNREGISTERED {
                                if let Some(prev) = self.brain.resolve(old) {
                                    prev.drop_usage();
                                }
                            }
                        }
                    }
                }
                for &child_id in snap.children.iter() {
                    let Some(child) = self.brain.resolve(child_id).filter(|c| c.is_alive())
                    else {
                        continue;
                    };
                    target.children.write().push(child_id);
                    child.clustered_by.write().push(target.id());
                }
                // clustered_by is deliberately not replicated: a child list
                // is position-sensitive and tied to one specific parent.
            }
        }
    }

    /// Rebuild one snapshot link with rewritten endpoints, skipping it when
    /// the link or any node it references died during assembly. Returns the
    /// copy together with the far endpoint it must be attached to.
    fn recreate_link(
        &self,
        original: &Arc<Link>,
        from: NeuronId,
        to: NeuronId,
        partner_id: NeuronId,
    ) -> Option<(Arc<Link>, Arc<Neuron>)> {
        if !original.is_valid() {
            return None;
        }
        let partner = self.brain.resolve(partner_id).filter(|p| p.is_alive())?;
        let meaning = self
            .brain
            .resolve(original.meaning())
            .filter(|m| m.is_alive())?;

        let mut body = self.ws.links.acquire().wire(from, to, original.meaning());
        for &info_id in original.info.read().iter() {
            if let Some(info) = self.brain.resolve(info_id).filter(|n| n.is_alive()) {
                body.info.get_mut().push(info_id);
                info.bump_usage();
            }
        }
        meaning.bump_usage();
        Some((Arc::new(body), partner))
    }
}

/// Copies one neuron's value and local neighborhood onto an existing target.
pub struct Duplicator<'a> {
    fx: NeuronFunction<'a>,
}

impl<'a> Duplicator<'a> {
    pub fn new(brain: &'a Brain, ws: &'a Workspace) -> Self {
        Self {
            fx: NeuronFunction::new(brain, ws),
        }
    }

    /// Duplicate `source` onto `target`: value, links in/out (re-pointed at
    /// the target) and, for clusters, meaning and children. The target's
    /// parent set stays empty. Atomic with respect to every touched node.
    pub fn duplicate(
        &self,
        source: &Arc<Neuron>,
        target: &Arc<Neuron>,
    ) -> Result<(), MutateError> {
        logged("duplicate", self.run(source, target))
    }

    fn run(&self, source: &Arc<Neuron>, target: &Arc<Neuron>) -> Result<(), MutateError> {
        if Arc::ptr_eq(source, target) {
            return Err(MutateError::SameNeuron);
        }
        if !source.is_alive() {
            return Err(MutateError::Retired(source.id()));
        }
        if !target.is_alive() {
            return Err(MutateError::Retired(target.id()));
        }
        if source.is_cluster() && !target.is_cluster() {
            return Err(MutateError::KindMismatch);
        }
        self.fx.brain.register(source);
        self.fx.brain.register(target);

        let targets = std::slice::from_ref(target);
        let (snap, batch) = self.fx.acquire_neighborhood(source, targets)?;
        self.fx.replicate(&snap, source, targets);
        self.fx.brain.locks().release(&batch);
        // Duplication must not disturb suspended state on touched nodes.
        batch.mark_changed(false);
        Ok(())
    }
}

/// Fans one source out to `n` fresh, pool-allocated targets atomically.
pub struct MultiDuplicator<'a> {
    fx: NeuronFunction<'a>,
}

impl<'a> MultiDuplicator<'a> {
    pub fn new(brain: &'a Brain, ws: &'a Workspace) -> Self {
        Self {
            fx: NeuronFunction::new(brain, ws),
        }
    }

    /// One shared snapshot, one batch covering source + all targets + all
    /// neighbors: the n-way fork is atomic against concurrent mutation of
    /// the source. Targets share no mutable link or child objects.
    pub fn duplicate(
        &self,
        source: &Arc<Neuron>,
        n: usize,
    ) -> Result<Vec<Arc<Neuron>>, MutateError> {
        logged("multi-duplicate", self.run(source, n))
    }

    fn run(&self, source: &Arc<Neuron>, n: usize) -> Result<Vec<Arc<Neuron>>, MutateError> {
        if !source.is_alive() {
            return Err(MutateError::Retired(source.id()));
        }
        self.fx.brain.register(source);
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut targets = Vec::with_capacity(n);
        for _ in 0..n {
            let body = if source.is_cluster() {
                self.fx.ws.clusters.acquire()
            } else {
                self.fx.ws.value_neurons.acquire()
            };
            let target = Arc::new(body);
            self.fx.brain.register(&target);
            targets.push(target);
        }

        let (snap, batch) = self.fx.acquire_neighborhood(source, &targets)?;
        self.fx.replicate(&snap, source, &targets);
        self.fx.brain.locks().release(&batch);
        batch.mark_changed(false);
        Ok(targets)
    }
}

/// Removes one neuron and every reference to it from its neighborhood.
pub struct Deleter<'a> {
    fx: NeuronFunction<'a>,
}

impl<'a> Deleter<'a> {
    pub fn new(brain: &'a Brain, ws: &'a Workspace) -> Self {
        Self {
            fx: NeuronFunction::new(brain, ws),
        }
    }

    /// Detach every link, parent and child reference, fix usage counts,
    /// retire and unregister the node, and recycle it when this thread held
    /// the last handle. Touched nodes are marked dirty with full unfreeze
    /// semantics: deletion may wake anything suspended on them.
    pub fn delete(&self, node: Arc<Neuron>) -> Result<(), MutateError> {
        logged("delete", self.run(node))
    }

    fn run(&self, node: Arc<Neuron>) -> Result<(), MutateError> {
        if !node.is_alive() {
            return Err(MutateError::Retired(node.id()));
        }
        let brain = self.fx.brain;
        brain.register(&node);

        let (mut snap, batch) = self.fx.acquire_neighborhood(&node, &[])?;
        let id = node.id();

        if node.usage() > 0 {
            // Links elsewhere still label themselves with this node; they
            // will skip it through the liveness flag from now on.
            warn!(
                target: "neurograph::function",
                id,
                usage = node.usage(),
                "deleting a neuron still referenced as meaning"
            );
        }

        for link in snap.links_out.iter() {
            self.destroy_link(link, link.to(), Side::Incoming);
        }
        for link in snap.links_in.iter() {
            self.destroy_link(link, link.from(), Side::Outgoing);
        }

        for &parent_id in snap.parents.iter() {
            if parent_id == id {
                // Self-referential cluster: its own collections are cleared
                // wholesale below, not edited against themselves.
                continue;
            }
            if let Some(parent) = brain.resolve(parent_id) {
                parent.children.write().retain(|c| *c != id);
            }
        }
        for &child_id in snap.children.iter() {
            if child_id == id {
                continue;
            }
            if let Some(child) = brain.resolve(child_id) {
                child.clustered_by.write().retain(|p| *p != id);
            }
        }

        if node.is_cluster() && snap.meaning != UNREGISTERED {
            if let Some(meaning) = brain.resolve(snap.meaning) {
                meaning.drop_usage();
            }
        }

        node.links_out.write().clear();
        node.links_in.write().clear();
        node.children.write().clear();
        node.clustered_by.write().clear();
        node.processors.write().clear();
        *node.meaning.write() = UNREGISTERED;
        node.retire();

        brain.locks().release(&batch);
        batch.mark_changed(true);

        brain.unregister(id);
        brain.notify_neuron_deleted(id);

        // Ancillary objects back to the pools: link bodies this thread can
        // prove unshared, then the node itself.
        for link in snap.links_out.drain(..).chain(snap.links_in.drain(..)) {
            if let Ok(body) = Arc::try_unwrap(link) {
                self.fx.ws.links.recycle(body);
            }
        }
        drop(snap);
        drop(batch);
        if let Ok(body) = Arc::try_unwrap(node) {
            if body.is_cluster() {
                self.fx.ws.clusters.recycle(body);
            } else {
                self.fx.ws.value_neurons.recycle(body);
            }
        }
        Ok(())
    }

    /// Detach one snapshot link from its remote endpoint and settle the
    /// label usage counts. First invalidator wins; a link already destroyed
    /// by an overlapping deletion is skipped.
    fn destroy_link(&self, link: &Arc<Link>, partner_id: NeuronId, side: Side) {
        if !link.invalidate() {
            return;
        }
        let brain = self.fx.brain;
        if let Some(partner) = brain.resolve(partner_id) {
            let list = match side {
                Side::Incoming => &partner.links_in,
                Side::Outgoing => &partner.links_out,
            };
            list.write().retain(|l| !Arc::ptr_eq(l, link));
        }
        if let Some(meaning) = brain.resolve(link.meaning()) {
            meaning.drop_usage();
        }
        for &info_id in link.info.read().iter() {
            if let Some(info) = brain.resolve(info_id) {
                info.drop_usage();
            }
        }
        brain.notify_link_destroyed(link);
    }
}

/// Which of the partner's link lists a detach edits.
#[derive(Clone, Copy)]
enum Side {
    Incoming,
    Outgoing,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::brain::GraphObserver;
    use crate::neuron::NeuronValue;

    fn value_brain() -> Brain {
        Brain::default()
    }

    #[test]
    fn duplicate_copies_value_and_both_link_directions() {
        let brain = value_brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(7)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(8)));
        let c = brain.insert(Neuron::value(NeuronValue::Int(9)));
        let m = brain.insert(Neuron::value(NeuronValue::Text("rel".into())));
        brain.connect(&a, &b, &m).expect("a -> b");
        brain.connect(&c, &a, &m).expect("c -> a");

        let target = brain.insert(Neuron::value(NeuronValue::Empty));
        Duplicator::new(&brain, &ws)
            .duplicate(&a, &target)
            .expect("plain duplicate");

        assert_eq!(*target.value.read(), NeuronValue::Int(7));

        let out = target.links_out.read();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].from(), target.id());
        assert_eq!(out[0].to(), b.id());
        assert_eq!(out[0].meaning(), m.id());
        assert!(b.links_in.read().iter().any(|l| Arc::ptr_eq(l, &out[0])));

        let inc = target.links_in.read();
        assert_eq!(inc.len(), 1);
        assert_eq!(inc[0].from(), c.id());
        assert!(c.links_out.read().iter().any(|l| Arc::ptr_eq(l, &inc[0])));

        // Two original links plus two copies all label through m.
        assert_eq!(m.usage(), 4);
        // Source untouched.
        assert_eq!(a.links_out.read().len(), 1);
        assert_eq!(a.links_in.read().len(), 1);
        // Everything unlocked again.
        for id in brain.ids() {
            assert_eq!(brain.locks().held_on(id), 0);
        }
    }

    #[test]
    fn cluster_duplicate_brings_meaning_and_children_not_parents() {
        let brain = value_brain();
        let ws = brain.workspace();
        let m = brain.insert(Neuron::value(NeuronValue::Text("label".into())));
        let c1 = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let c2 = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let parent = brain.insert(Neuron::cluster());
        let src = brain.insert(Neuron::cluster());

        *src.meaning.write() = m.id();
        m.bump_usage();
        src.children.write().extend([c1.id(), c2.id()]);
        c1.clustered_by.write().push(src.id());
        c2.clustered_by.write().push(src.id());
        parent.children.write().push(src.id());
        src.clustered_by.write().push(parent.id());

        let target = brain.insert(Neuron::cluster());
        Duplicator::new(&brain, &ws)
            .duplicate(&src, &target)
            .expect("cluster duplicate");

        assert_eq!(*target.children.read(), vec![c1.id(), c2.id()]);
        assert!(c1.clustered_by.read().contains(&target.id()));
        assert!(c2.clustered_by.read().contains(&target.id()));
        assert_eq!(*target.meaning.read(), m.id());
        assert_eq!(m.usage(), 2);

        // Membership is not inherited: the copy starts unparented and the
        // original parent gains nothing.
        assert!(target.clustered_by.read().is_empty());
        assert_eq!(*parent.children.read(), vec![src.id()]);
    }

    #[test]
    fn cluster_duplicate_settles_a_replaced_target_meaning() {
        let brain = value_brain();
        let ws = brain.workspace();
        let m_old = brain.insert(Neuron::value(NeuronValue::Text("old".into())));
        let m_new = brain.insert(Neuron::value(NeuronValue::Text("new".into())));

        let src = brain.insert(Neuron::cluster());
        *src.meaning.write() = m_new.id();
        m_new.bump_usage();

        let target = brain.insert(Neuron::cluster());
        *target.meaning.write() = m_old.id();
        m_old.bump_usage();

        Duplicator::new(&brain, &ws)
            .duplicate(&src, &target)
            .expect("cluster duplicate");

        assert_eq!(*target.meaning.read(), m_new.id());
        // src + target reference m_new; nothing references m_old any more.
        assert_eq!(m_new.usage(), 2);
        assert_eq!(m_old.usage(), 0);
    }

    #[test]
    fn duplicate_validates_before_touching_anything() {
        let brain = value_brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let t = brain.insert(Neuron::value(NeuronValue::Empty));
        let dup = Duplicator::new(&brain, &ws);

        assert_eq!(dup.duplicate(&a, &a), Err(MutateError::SameNeuron));

        let cluster = brain.insert(Neuron::cluster());
        assert_eq!(dup.duplicate(&cluster, &t), Err(MutateError::KindMismatch));

        a.retire();
        assert_eq!(dup.duplicate(&a, &t), Err(MutateError::Retired(a.id())));
        assert_eq!(brain.locks().held_on(a.id()), 0);
        assert_eq!(brain.locks().held_on(t.id()), 0);
    }

    #[test]
    fn duplicate_skips_invalidated_links() {
        let brain = value_brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));
        let link = brain.connect(&a, &b, &m).expect("link");
        assert!(link.invalidate());

        let target = brain.insert(Neuron::value(NeuronValue::Empty));
        Duplicator::new(&brain, &ws)
            .duplicate(&a, &target)
            .expect("duplicate past stale link");
        assert!(target.links_out.read().is_empty());
        assert_eq!(m.usage(), 1);
    }

    #[test]
    fn multi_duplicate_fans_out_independent_copies() {
        let brain = value_brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(3)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(4)));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));
        brain.connect(&a, &b, &m).expect("a -> b");

        let copies = MultiDuplicator::new(&brain, &ws)
            .duplicate(&a, 3)
            .expect("fan out");
        assert_eq!(copies.len(), 3);

        for copy in &copies {
            assert!(copy.is_registered());
            assert_eq!(*copy.value.read(), NeuronValue::Int(3));
            assert_eq!(copy.links_out.read().len(), 1);
        }
        // No shared link bodies between copies.
        let first = Arc::clone(&copies[0].links_out.read()[0]);
        assert!(!copies[1]
            .links_out
            .read()
            .iter()
            .any(|l| Arc::ptr_eq(l, &first)));

        assert_eq!(b.links_in.read().len(), 4);
        assert_eq!(m.usage(), 4);
    }

    #[test]
    fn multi_duplicate_of_zero_is_a_no_op() {
        let brain = value_brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let copies = MultiDuplicator::new(&brain, &ws)
            .duplicate(&a, 0)
            .expect("empty fan out");
        assert!(copies.is_empty());
        assert_eq!(brain.neuron_count(), 1);
    }

    #[test]
    fn duplicate_leaves_frozen_neighbors_frozen() {
        let brain = value_brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));
        brain.connect(&a, &b, &m).expect("link");
        b.freeze();

        let target = brain.insert(Neuron::value(NeuronValue::Empty));
        Duplicator::new(&brain, &ws)
            .duplicate(&a, &target)
            .expect("duplicate");
        assert!(b.is_frozen());
        assert!(b.is_changed());
    }

    #[test]
    fn delete_detaches_links_parents_and_usage() {
        let brain = value_brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let c = brain.insert(Neuron::value(NeuronValue::Int(3)));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));
        let m2 = brain.insert(Neuron::value(NeuronValue::Empty));
        brain.connect(&a, &b, &m).expect("a -> b");
        brain.connect(&c, &a, &m2).expect("c -> a");

        let parent = brain.insert(Neuron::cluster());
        parent.children.write().push(a.id());
        a.clustered_by.write().push(parent.id());

        let id = a.id();
        let keep = Arc::clone(&a);
        Deleter::new(&brain, &ws).delete(a).expect("delete");

        assert!(!keep.is_alive());
        assert!(brain.resolve(id).is_none());
        assert!(b.links_in.read().is_empty());
        assert!(c.links_out.read().is_empty());
        assert!(parent.children.read().is_empty());
        assert_eq!(m.usage(), 0);
        assert_eq!(m2.usage(), 0);
        for nid in brain.ids() {
            assert_eq!(brain.locks().held_on(nid), 0);
        }
    }

    #[test]
    fn delete_wakes_frozen_neighbors() {
        let brain = value_brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));
        brain.connect(&a, &b, &m).expect("link");
        b.freeze();

        Deleter::new(&brain, &ws).delete(a).expect("delete");
        assert!(!b.is_frozen());
        assert!(b.is_changed());
    }

    #[test]
    fn delete_of_a_retired_node_reports_it() {
        let brain = value_brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let id = a.id();
        let again = Arc::clone(&a);

        let del = Deleter::new(&brain, &ws);
        del.delete(a).expect("first delete");
        assert_eq!(del.delete(again), Err(MutateError::Retired(id)));
    }

    #[test]
    fn deleted_sole_handle_returns_to_the_pool() {
        let brain = value_brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(42)));

        Deleter::new(&brain, &ws).delete(a).expect("delete");
        assert_eq!(ws.value_neurons.reserved(), 1);

        // And the reused body is indistinguishable from fresh.
        let back = ws.value_neurons.acquire();
        assert_eq!(*back.value.read(), NeuronValue::Empty);
        assert_eq!(back.id(), UNREGISTERED);
        assert!(back.is_alive());
    }

    #[test]
    fn self_referential_cluster_deletes_cleanly() {
        let brain = value_brain();
        let ws = brain.workspace();
        let src = brain.insert(Neuron::cluster());
        src.children.write().push(src.id());
        src.clustered_by.write().push(src.id());

        let id = src.id();
        Deleter::new(&brain, &ws).delete(src).expect("self cluster");
        assert!(brain.resolve(id).is_none());
    }

    #[test]
    fn deleting_a_meaning_still_in_use_proceeds() {
        let brain = value_brain();
        let ws = brain.workspace();
        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));
        brain.connect(&a, &b, &m).expect("link");

        let id = m.id();
        Deleter::new(&brain, &ws).delete(m).expect("meaning delete");
        assert!(brain.resolve(id).is_none());
        // The link survives; readers fail to resolve its label from now on.
        assert_eq!(a.links_out.read().len(), 1);
    }

    #[derive(Default)]
    struct Counting {
        links: AtomicUsize,
        neurons: AtomicUsize,
    }

    impl GraphObserver for Counting {
        fn link_destroyed(&self, _link: &Link) {
            self.links.fetch_add(1, Ordering::Relaxed);
        }

        fn neuron_deleted(&self, _id: NeuronId) {
            self.neurons.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn observer_sees_every_destruction() {
        let brain = value_brain();
        let ws = brain.workspace();
        let obs = Arc::new(Counting::default());
        brain.set_observer(obs.clone());

        let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
        let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
        let c = brain.insert(Neuron::value(NeuronValue::Int(3)));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));
        brain.connect(&a, &b, &m).expect("a -> b");
        brain.connect(&c, &a, &m).expect("c -> a");

        Deleter::new(&brain, &ws).delete(a).expect("delete");
        assert_eq!(obs.links.load(Ordering::Relaxed), 2);
        assert_eq!(obs.neurons.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn disjoint_neighborhoods_mutate_in_parallel() {
        let brain = value_brain();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let ws = brain.workspace();
                    for i in 0..50 {
                        let a = brain.insert(Neuron::value(NeuronValue::Int(i)));
                        let b = brain.insert(Neuron::value(NeuronValue::Int(-i)));
                        let m = brain.insert(Neuron::value(NeuronValue::Empty));
                        brain.connect(&a, &b, &m).expect("chain");

                        let copies = MultiDuplicator::new(&brain, &ws)
                            .duplicate(&a, 2)
                            .expect("fan out");
                        let del = Deleter::new(&brain, &ws);
                        del.delete(a).expect("delete source");
                        for copy in copies {
                            del.delete(copy).expect("delete copy");
                        }
                        del.delete(b).expect("delete far end");
                        del.delete(m).expect("delete meaning");
                    }
                });
            }
        });

        assert_eq!(brain.neuron_count(), 0);
    }

    #[test]
    fn shared_hub_survives_concurrent_attach_and_delete() {
        let brain = value_brain();
        let hub = brain.insert(Neuron::value(NeuronValue::Text("hub".into())));
        let m = brain.insert(Neuron::value(NeuronValue::Empty));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let ws = brain.workspace();
                    for i in 0..25 {
                        let spoke = brain.insert(Neuron::value(NeuronValue::Int(i)));
                        brain.connect(&spoke, &hub, &m).expect("spoke -> hub");
                        Deleter::new(&brain, &ws).delete(spoke).expect("spoke gone");
                    }
                });
            }
            scope.spawn(|| {
                let ws = brain.workspace();
                for _ in 0..10 {
                    let copies = MultiDuplicator::new(&brain, &ws)
                        .duplicate(&hub, 1)
                        .expect("hub copy");
                    let del = Deleter::new(&brain, &ws);
                    for copy in copies {
                        del.delete(copy).expect("hub copy gone");
                    }
                }
            });
        });

        // Every spoke took its link with it; copies took theirs.
        assert!(hub.is_alive());
        assert!(hub.links_in.read().is_empty());
        assert_eq!(m.usage(), 0);

        // Global integrity: both sides of every surviving link agree, and
        // nothing holds a lock.
        for id in brain.ids() {
            assert_eq!(brain.locks().held_on(id), 0);
            let n = brain.resolve(id).expect("listed id resolves");
            for l in n.links_out.read().iter() {
                assert_eq!(l.from(), id);
            }
            for l in n.links_in.read().iter() {
                assert_eq!(l.to(), id);
            }
        }
    }
}
