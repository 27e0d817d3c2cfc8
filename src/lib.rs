//! # neurograph
//!
//! The concurrency core of a shared, mutable, typed directed graph.
//!
//! Many worker threads ("processors") read and structurally mutate one
//! in-memory graph of neurons and meaning-labeled links. This crate provides
//! the machinery that makes those structural edits atomic and deadlock-free
//! without a global lock:
//!
//! - a fine-grained, per-relation lock model with all-or-nothing batch
//!   acquisition ([`lock`]),
//! - scoped accessors that bracket every collection access with the correct
//!   multi-node lock batch ([`accessor`]),
//! - snapshot-then-atomically-mutate algorithms for structural duplication
//!   and deletion ([`function`]),
//! - bounded object-recycling pools that keep allocation off the hot paths
//!   ([`pool`]).
//!
//! ## Quick start
//!
//! ```
//! use neurograph::prelude::*;
//!
//! let brain = Brain::new(BrainConfig::default());
//! let ws = brain.workspace();
//!
//! let verb = brain.insert(Neuron::value(NeuronValue::Text("causes".into())));
//! let a = brain.insert(Neuron::value(NeuronValue::Int(1)));
//! let b = brain.insert(Neuron::value(NeuronValue::Int(2)));
//! let link = brain.connect(&a, &b, &verb).unwrap();
//! assert_eq!(link.meaning(), verb.id());
//!
//! let twins = MultiDuplicator::new(&brain, &ws).duplicate(&a, 2).unwrap();
//! assert_eq!(twins.len(), 2);
//!
//! Deleter::new(&brain, &ws).delete(a).unwrap();
//! ```
//!
//! ## Feature flags
//!
//! - `serde` (default): derive `Serialize`/`Deserialize` on plain data types
//!   for an external persistence layer. The graph itself is not serialized
//!   by this crate.
//!
//! ## Modules
//!
//! - [`neuron`]: the data model (neurons, links, clusters)
//! - [`lock`]: lock levels, batches and the coordinator
//! - [`pool`]: bounded object recycling
//! - [`brain`]: registry and explicit context
//! - [`accessor`]: scoped, lock-bracketed relation views
//! - [`function`]: duplicate / multi-duplicate / delete

#[path = "core/neuron.rs"]
pub mod neuron;

#[path = "core/lock.rs"]
pub mod lock;

#[path = "core/pool.rs"]
pub mod pool;

#[path = "core/brain.rs"]
pub mod brain;

#[path = "core/accessor.rs"]
pub mod accessor;

#[path = "core/function.rs"]
pub mod function;

/// Prelude module for convenient imports.
///
/// ```
/// use neurograph::prelude::*;
/// ```
pub mod prelude {
    pub use crate::accessor::{
        InfoAccessor, LinkAccessor, NeuronAccessor, ProcessorSetAccessor, Relation,
        RelationAccessor,
    };
    pub use crate::brain::{Brain, BrainConfig, BrainStats, GraphObserver};
    pub use crate::function::{Deleter, Duplicator, MultiDuplicator, MutateError};
    pub use crate::lock::{LockBatch, LockCoordinator, LockLevel, LockRequest};
    pub use crate::neuron::{
        Link, Neuron, NeuronId, NeuronKind, NeuronValue, ProcessorId, UNREGISTERED,
    };
    pub use crate::pool::{LocalPool, Loan, Pool, Pools, Recycle, Workspace};
}
