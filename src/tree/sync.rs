// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! One-way mirroring of a [`SourceTree`] onto the audio thread.
//!
//! # Strategy
//!
//! Every mutation is classified as soon as it is reported:
//!
//! - A structural change (child added, removed or moved) triggers a full
//!   resync. The whole source tree is snapshotted into a new [`ReplicaTree`]
//!   right away, registered with the collector, and a job handing it to the
//!   reader is queued.
//! - A scalar property change on a node that is linked into the current
//!   replica, where that node already has a scalar slot of the same name,
//!   queues a fast update that writes the value in place.
//! - Any other property change (new or removed property, text or object
//!   value) falls back to a full resync.
//!
//! Snapshots are taken when the mutation is reported, not when the job runs.
//! Jobs drain in the order they were queued, so the reader observes the same
//! sequence of states the source went through.
//!
//! # Queue full
//!
//! A job that does not fit is dropped and counted. The synchronizer then
//! marks itself out of date and the next mutation, or an explicit
//! [`TreeSynchronizer::resync`], performs a full resync.

use crate::gc::{DeferredCollector, Reclaimable};
use crate::realtime::{CallQueueProducer, Scalar};
use crate::tree::dump;
use crate::tree::link_cache::LinkCache;
use crate::tree::replica::{ReplicaMailbox, ReplicaReader, ReplicaTree};
use crate::tree::source::{ListenerId, NodeId, SourceTree, TreeId, TreeListener};
use crate::tree::value::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, enabled, trace, warn, Level};

/// Counters for the jobs a synchronizer has issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// In-place scalar writes queued.
    pub fast_updates: u64,
    /// Whole replicas queued.
    pub full_resyncs: u64,
    /// Jobs that did not fit in the queue.
    pub dropped_jobs: u64,
}

struct SyncState {
    attached: Option<(TreeId, ListenerId)>,
    links: LinkCache,
    generation: u64,
    needs_resync: bool,
    stats: SyncStats,
}

impl SyncState {
    fn record_drop(&mut self, job: &str, free_space: usize) {
        self.stats.dropped_jobs += 1;
        self.needs_resync = true;
        warn!(
            "Call queue full ({} bytes free), dropped {} job; replica will be resynced",
            free_space, job
        );
    }
}

/// Mirrors one source tree into replicas readable from the consumer thread.
///
/// Lives on the producer thread next to the tree it observes.
pub struct TreeSynchronizer {
    state: RefCell<SyncState>,
    mailbox: Reclaimable<ReplicaMailbox>,
    queue: Rc<CallQueueProducer>,
    collector: Arc<DeferredCollector>,
}

impl TreeSynchronizer {
    /// Start mirroring `source`.
    ///
    /// Returns the synchronizer, which stays subscribed for as long as the
    /// returned `Rc` is alive, and the reader to hand to the consumer thread.
    /// The first replica is queued immediately; until it is drained the
    /// reader sees an empty placeholder.
    pub fn attach(
        source: &mut SourceTree,
        queue: Rc<CallQueueProducer>,
        collector: Arc<DeferredCollector>,
    ) -> (Rc<Self>, ReplicaReader) {
        let mailbox = collector.register(ReplicaMailbox::new());
        let placeholder = collector.register(ReplicaTree::placeholder());
        let reader = ReplicaReader::new(mailbox.clone(), placeholder);

        let sync = Rc::new(Self {
            state: RefCell::new(SyncState {
                attached: None,
                links: LinkCache::new(),
                generation: 0,
                needs_resync: false,
                stats: SyncStats::default(),
            }),
            mailbox,
            queue,
            collector,
        });
        sync.set_source(source);

        (sync, reader)
    }

    /// Mirror a different tree from now on, starting with a full resync.
    ///
    /// Notifications still arriving from the previous tree are ignored.
    pub fn set_source(self: &Rc<Self>, source: &mut SourceTree) {
        let listener: Weak<dyn TreeListener> = Rc::downgrade(self) as Weak<dyn TreeListener>;
        let id = source.add_listener(listener);

        let previous = self.state.borrow_mut().attached.replace((source.id(), id));
        if let Some((tree, old)) = previous {
            if tree == source.id() {
                source.remove_listener(old);
            }
        }

        debug!("Tree synchronizer attached to tree with {} nodes", source.len());
        self.full_resync(source);
    }

    /// Stop observing `source`. The reader keeps the last replica it got.
    ///
    /// Returns `false` if `source` is not the attached tree.
    pub fn detach(&self, source: &mut SourceTree) -> bool {
        let mut state = self.state.borrow_mut();
        match state.attached {
            Some((tree, listener)) if tree == source.id() => {
                source.remove_listener(listener);
                state.attached = None;
                state.links.clear();
                debug!("Tree synchronizer detached");
                true
            }
            _ => false,
        }
    }

    /// Queue a full resync of the attached tree.
    ///
    /// Returns `false` if `source` is not the attached tree or the queue had
    /// no room; in the latter case the next mutation retries.
    pub fn resync(&self, source: &SourceTree) -> bool {
        if !self.is_attached_to(source) {
            return false;
        }
        self.full_resync(source)
    }

    /// Whether a job was dropped since the last successful full resync.
    pub fn needs_resync(&self) -> bool {
        self.state.borrow().needs_resync
    }

    pub fn stats(&self) -> SyncStats {
        self.state.borrow().stats
    }

    /// Generation of the most recently queued replica.
    pub fn generation(&self) -> u64 {
        self.state.borrow().links.generation()
    }

    fn is_attached_to(&self, tree: &SourceTree) -> bool {
        self.state.borrow().attached.map(|(id, _)| id) == Some(tree.id())
    }

    fn full_resync(&self, source: &SourceTree) -> bool {
        let mut state = self.state.borrow_mut();
        state.generation += 1;
        let generation = state.generation;

        let replica = self
            .collector
            .register(ReplicaTree::snapshot(source, generation));
        if enabled!(Level::TRACE) {
            trace!(
                "Replica generation {}: {}",
                generation,
                dump::source_to_json(source)
            );
        }
        state.links.rebuild(source, replica.clone());

        let mailbox = self.mailbox.clone();
        if !self.queue.try_enqueue(move || mailbox.publish(replica)) {
            state.links.clear();
            state.record_drop("full resync", self.queue.free_space());
            return false;
        }

        state.needs_resync = false;
        state.stats.full_resyncs += 1;
        debug!(
            "Queued replica generation {} ({} nodes linked)",
            generation,
            state.links.len()
        );
        true
    }

    /// Returns `false` if the change needs a full resync instead.
    fn fast_update(&self, node: NodeId, name: &str, value: Scalar) -> bool {
        let mut state = self.state.borrow_mut();
        if state.needs_resync {
            return false;
        }
        let Some((replica, index)) = state.links.lookup(node) else {
            return false;
        };
        let Some(slot) = replica.scalar_slot(index, name) else {
            return false;
        };

        let replica = replica.clone();
        if self
            .queue
            .try_enqueue(move || replica.write_scalar(index, slot, value))
        {
            state.stats.fast_updates += 1;
            trace!("Fast update {}.{} = {}", node, name, value);
        } else {
            state.record_drop("fast update", self.queue.free_space());
        }
        true
    }

    fn structure_changed(&self, tree: &SourceTree) {
        if self.is_attached_to(tree) {
            self.full_resync(tree);
        }
    }
}

impl TreeListener for TreeSynchronizer {
    fn child_added(&self, tree: &SourceTree, _parent: NodeId, _child: NodeId) {
        self.structure_changed(tree);
    }

    fn child_removed(&self, tree: &SourceTree, _parent: NodeId, _child: NodeId, _index: usize) {
        self.structure_changed(tree);
    }

    fn child_order_changed(&self, tree: &SourceTree, _parent: NodeId, _old: usize, _new: usize) {
        self.structure_changed(tree);
    }

    fn property_changed(&self, tree: &SourceTree, node: NodeId, name: &str) {
        if !self.is_attached_to(tree) {
            return;
        }

        let value = tree.property(node, name);
        if let Some(Value::Object(object)) = value {
            debug_assert!(
                self.collector.is_registered(object),
                "object property {name} on {node} was not registered with the collector"
            );
        }

        let handled = match value.and_then(Value::as_scalar) {
            Some(scalar) => self.fast_update(node, name, scalar),
            None => false,
        };
        if !handled {
            self.full_resync(tree);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{CallQueue, CallQueueConsumer};

    // Field order matters: the collector must be released last.
    struct Harness {
        reader: ReplicaReader,
        sync: Rc<TreeSynchronizer>,
        tree: SourceTree,
        consumer: CallQueueConsumer,
        collector: Arc<DeferredCollector>,
    }

    fn harness(capacity: usize) -> Harness {
        let collector = Arc::new(DeferredCollector::new());
        let (producer, consumer) = CallQueue::new(capacity).split();
        let mut tree = SourceTree::new("synth");
        let (sync, reader) =
            TreeSynchronizer::attach(&mut tree, Rc::new(producer), Arc::clone(&collector));
        Harness {
            reader,
            sync,
            tree,
            consumer,
            collector,
        }
    }

    #[test]
    fn test_attach_publishes_initial_replica() {
        let mut h = harness(4096);
        assert!(h.reader.replica().root().is_none());
        assert_eq!(h.sync.stats().full_resyncs, 1);

        assert!(h.consumer.drain());
        assert!(h.reader.replica().is_equivalent_to(&h.tree));
        assert_eq!(h.reader.replica().generation(), h.sync.generation());
    }

    #[test]
    fn test_scalar_change_takes_fast_path() {
        let mut h = harness(4096);
        let root = h.tree.root();
        let osc = h.tree.add_child(root, "osc", None).unwrap();
        h.tree.set_property(osc, "count", 5).unwrap();
        let env = h.tree.add_child(root, "env", None).unwrap();
        h.tree.set_property(env, "attack", 0.5).unwrap();
        h.consumer.drain();
        let generation = h.reader.replica().generation();

        let before = h.sync.stats();
        h.tree.set_property(osc, "count", 6).unwrap();
        let after = h.sync.stats();
        assert_eq!(after.fast_updates, before.fast_updates + 1);
        assert_eq!(after.full_resyncs, before.full_resyncs);

        assert!(h.consumer.drain());
        let replica = h.reader.replica();
        assert_eq!(replica.generation(), generation);
        assert_eq!(replica.find(osc).unwrap().scalar("count"), Some(Scalar::Int(6)));
        assert_eq!(replica.find(env).unwrap().scalar("attack"), Some(Scalar::Float(0.5)));
        assert!(replica.is_equivalent_to(&h.tree));
    }

    #[test]
    fn test_structural_change_resyncs_after_one_drain() {
        let mut h = harness(4096);
        let root = h.tree.root();
        let osc = h.tree.add_child(root, "osc", None).unwrap();
        h.tree.set_property(osc, "freq", 440.0).unwrap();
        h.consumer.drain();

        let before = h.sync.stats();
        let child = h.tree.add_child(osc, "lfo", None).unwrap();
        assert_eq!(h.sync.stats().full_resyncs, before.full_resyncs + 1);
        assert!(!h.reader.replica().is_equivalent_to(&h.tree));

        assert!(h.consumer.drain());
        let replica = h.reader.replica();
        assert!(replica.is_equivalent_to(&h.tree));
        assert_eq!(replica.find(osc).unwrap().child(0).unwrap().id(), child);

        h.tree.remove_child(osc, 0).unwrap();
        h.consumer.drain();
        assert!(h.reader.replica().is_equivalent_to(&h.tree));
    }

    #[test]
    fn test_non_scalar_and_removed_properties_resync() {
        let mut h = harness(4096);
        let root = h.tree.root();
        h.tree.set_property(root, "gain", 0.5).unwrap();
        h.consumer.drain();

        let before = h.sync.stats();
        h.tree.set_property(root, "name", "lead").unwrap();
        h.tree.remove_property(root, "gain").unwrap();
        let after = h.sync.stats();
        assert_eq!(after.full_resyncs, before.full_resyncs + 2);
        assert_eq!(after.fast_updates, before.fast_updates);

        h.consumer.drain();
        let replica = h.reader.replica();
        assert!(replica.is_equivalent_to(&h.tree));
        let node = replica.root().unwrap();
        assert!(!node.has_property("gain"));
        assert_eq!(node.text("name"), Some("lead"));
    }

    #[test]
    fn test_mixed_jobs_apply_in_order() {
        let mut h = harness(4096);
        let root = h.tree.root();
        let osc = h.tree.add_child(root, "osc", None).unwrap();
        h.tree.set_property(osc, "count", 5).unwrap();
        h.consumer.drain();

        h.tree.set_property(osc, "count", 6).unwrap();
        h.tree.add_child(root, "env", None).unwrap();
        h.tree.set_property(osc, "count", 7).unwrap();
        assert!(h.consumer.drain());

        let replica = h.reader.replica();
        assert_eq!(replica.find(osc).unwrap().scalar("count"), Some(Scalar::Int(7)));
        assert!(replica.is_equivalent_to(&h.tree));
        assert!(!h.consumer.drain());
    }

    #[test]
    fn test_queue_full_recovers_with_resync() {
        let mut h = harness(256);
        let root = h.tree.root();
        h.tree.set_property(root, "gain", 0).unwrap();
        h.consumer.drain();

        let mut gain = 0;
        while h.sync.stats().dropped_jobs == 0 {
            gain += 1;
            assert!(gain < 1000, "queue never filled up");
            h.tree.set_property(root, "gain", gain).unwrap();
        }
        assert!(h.sync.needs_resync());

        h.consumer.drain();
        assert!(!h.reader.replica().is_equivalent_to(&h.tree));

        h.tree.set_property(root, "gain", gain + 1).unwrap();
        assert!(!h.sync.needs_resync());
        h.consumer.drain();
        assert!(h.reader.replica().is_equivalent_to(&h.tree));

        h.tree.set_property(root, "gain", gain + 2).unwrap();
        assert!(h.sync.resync(&h.tree));
        h.consumer.drain();
        assert!(h.reader.replica().is_equivalent_to(&h.tree));
    }

    #[test]
    fn test_old_replicas_are_reclaimed_by_sweep() {
        let mut h = harness(4096);
        let root = h.tree.root();
        for i in 0..4 {
            h.tree.add_child(root, "voice", Some(i)).unwrap();
        }
        h.consumer.drain();
        h.reader.replica();

        // The placeholder and generations 1 to 4 are unreferenced now.
        assert_eq!(h.collector.sweep(), 5);
        assert!(h.reader.replica().is_equivalent_to(&h.tree));
    }

    #[test]
    fn test_set_source_and_detach() {
        let mut h = harness(4096);
        let mut other = SourceTree::new("other");
        let other_root = other.root();
        other.set_property(other_root, "level", 3).unwrap();

        h.sync.set_source(&mut other);
        let stats = h.sync.stats();
        h.tree.set_property(h.tree.root(), "ignored", 1).unwrap();
        assert_eq!(h.sync.stats(), stats);

        h.consumer.drain();
        assert!(h.reader.replica().is_equivalent_to(&other));

        assert!(!h.sync.detach(&mut h.tree));
        assert!(h.sync.detach(&mut other));
        other.set_property(other_root, "level", 4).unwrap();
        assert_eq!(h.sync.stats(), stats);
        assert!(!h.sync.resync(&other));
    }

    #[test]
    fn test_registered_object_reaches_replica() {
        let mut h = harness(4096);
        let root = h.tree.root();
        let table = h.collector.register(vec![0.0f32, 0.5, 1.0]);
        h.tree
            .set_property(root, "table", table.into_shared_object())
            .unwrap();
        h.consumer.drain();

        let replica = h.reader.replica();
        let object = replica.root().unwrap().object("table").unwrap();
        assert_eq!(object.downcast_ref::<Vec<f32>>().unwrap().len(), 3);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not registered")]
    fn test_unregistered_object_is_rejected() {
        let mut h = harness(4096);
        let root = h.tree.root();
        let stray = Reclaimable::from_registered(Arc::new(1u32)).into_shared_object();
        h.tree.set_property(root, "stray", stray).unwrap();
    }
}
