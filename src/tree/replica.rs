// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Read-only copy of a [`SourceTree`] for the audio thread.
//!
//! A [`ReplicaTree`] is built wholesale on the non-critical thread and never
//! changes shape afterwards. Scalar properties live in [`AtomicScalar`] slots
//! so the audio thread can update them in place; everything else is fixed at
//! construction.

use crate::gc::{Reclaimable, SharedObject};
use crate::realtime::{AtomicScalar, Scalar};
use crate::tree::source::{NodeId, SourceTree};
use crate::tree::value::Value;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Storage for one replica property.
#[derive(Debug)]
pub(crate) enum Slot {
    /// Updated in place by fast updates.
    Scalar(AtomicScalar),
    /// Text, objects and void; only replaced by a full resync.
    Fixed(Value),
}

impl Slot {
    fn new(value: &Value) -> Self {
        match value {
            Value::Scalar(s) => Slot::Scalar(AtomicScalar::new(*s)),
            other => Slot::Fixed(other.clone()),
        }
    }

    fn value(&self) -> Value {
        match self {
            Slot::Scalar(cell) => Value::Scalar(cell.get()),
            Slot::Fixed(value) => value.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ReplicaNode {
    pub(crate) id: NodeId,
    kind: Box<str>,
    slots: Vec<(Box<str>, Slot)>,
    pub(crate) children: Vec<usize>,
}

/// A mirrored tree, stored as a flat pre-order list of nodes.
#[derive(Debug)]
pub struct ReplicaTree {
    nodes: Vec<ReplicaNode>,
    generation: u64,
}

impl ReplicaTree {
    /// Deep-copy `source` into a new replica.
    pub fn snapshot(source: &SourceTree, generation: u64) -> Self {
        let mut nodes = Vec::with_capacity(source.len());
        Self::copy_node(source, source.root(), &mut nodes);
        Self { nodes, generation }
    }

    /// The empty tree readers see before the first resync arrives.
    pub fn placeholder() -> Self {
        Self {
            nodes: Vec::new(),
            generation: 0,
        }
    }

    fn copy_node(source: &SourceTree, id: NodeId, nodes: &mut Vec<ReplicaNode>) -> usize {
        let index = nodes.len();
        nodes.push(ReplicaNode {
            id,
            kind: source.kind(id).unwrap_or_default().into(),
            slots: source
                .properties(id)
                .iter()
                .map(|(name, value)| (name.as_str().into(), Slot::new(value)))
                .collect(),
            children: Vec::new(),
        });

        let children: Vec<usize> = source
            .children(id)
            .iter()
            .map(|&child| Self::copy_node(source, child, nodes))
            .collect();
        nodes[index].children = children;
        index
    }

    /// Resync counter value this replica was built for (0 for the placeholder).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The root node, or `None` for the placeholder.
    pub fn root(&self) -> Option<NodeRef<'_>> {
        self.node_ref(0)
    }

    /// Find a node by id. Linear in the number of nodes, but allocation free.
    pub fn find(&self, id: NodeId) -> Option<NodeRef<'_>> {
        let index = self.nodes.iter().position(|n| n.id == id)?;
        self.node_ref(index)
    }

    /// Whether this replica has the same shape, ids, kinds and property
    /// values as `source`.
    pub fn is_equivalent_to(&self, source: &SourceTree) -> bool {
        match self.root() {
            Some(root) => root.is_equivalent_to(source, source.root()),
            None => false,
        }
    }

    pub(crate) fn node(&self, index: usize) -> Option<&ReplicaNode> {
        self.nodes.get(index)
    }

    fn node_ref(&self, index: usize) -> Option<NodeRef<'_>> {
        (index < self.nodes.len()).then_some(NodeRef { tree: self, index })
    }

    /// Position of the scalar slot `name` on node `index`, if it has one.
    pub(crate) fn scalar_slot(&self, index: usize, name: &str) -> Option<usize> {
        let node = self.nodes.get(index)?;
        node.slots
            .iter()
            .position(|(n, slot)| &**n == name && matches!(slot, Slot::Scalar(_)))
    }

    /// Overwrite a scalar slot in place. Called on the consumer thread.
    pub(crate) fn write_scalar(&self, index: usize, slot: usize, value: Scalar) {
        match self.nodes.get(index).and_then(|n| n.slots.get(slot)) {
            Some((_, Slot::Scalar(cell))) => cell.set(value),
            _ => debug_assert!(false, "fast update targeted a missing scalar slot"),
        }
    }
}

/// A borrowed view of one replica node.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    tree: &'a ReplicaTree,
    index: usize,
}

impl<'a> NodeRef<'a> {
    fn node(&self) -> &'a ReplicaNode {
        &self.tree.nodes[self.index]
    }

    pub fn id(&self) -> NodeId {
        self.node().id
    }

    pub fn kind(&self) -> &'a str {
        &self.node().kind
    }

    pub fn num_children(&self) -> usize {
        self.node().children.len()
    }

    pub fn child(&self, i: usize) -> Option<NodeRef<'a>> {
        let index = *self.node().children.get(i)?;
        self.tree.node_ref(index)
    }

    pub fn children(&self) -> impl Iterator<Item = NodeRef<'a>> + 'a {
        let tree = self.tree;
        self.node()
            .children
            .iter()
            .map(move |&index| NodeRef { tree, index })
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.slot(name).is_some()
    }

    pub fn property_names(&self) -> impl Iterator<Item = &'a str> + 'a {
        self.node().slots.iter().map(|(n, _)| &**n)
    }

    /// Current value of a scalar property.
    pub fn scalar(&self, name: &str) -> Option<Scalar> {
        match self.slot(name)? {
            Slot::Scalar(cell) => Some(cell.get()),
            Slot::Fixed(_) => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&'a str> {
        match self.slot(name)? {
            Slot::Fixed(value) => value.as_text(),
            Slot::Scalar(_) => None,
        }
    }

    pub fn object(&self, name: &str) -> Option<&'a SharedObject> {
        match self.slot(name)? {
            Slot::Fixed(value) => value.as_object(),
            Slot::Scalar(_) => None,
        }
    }

    /// Owned copy of a property value.
    ///
    /// Text and object values are reference counted; prefer [`text`] and
    /// [`object`] on the audio thread so it never holds the last reference.
    ///
    /// [`text`]: Self::text
    /// [`object`]: Self::object
    pub fn get(&self, name: &str) -> Option<Value> {
        self.slot(name).map(Slot::value)
    }

    fn slot(&self, name: &str) -> Option<&'a Slot> {
        self.node()
            .slots
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, s)| s)
    }

    fn is_equivalent_to(&self, source: &SourceTree, id: NodeId) -> bool {
        let node = self.node();
        if node.id != id || source.kind(id) != Some(self.kind()) {
            return false;
        }

        let properties = source.properties(id);
        if properties.len() != node.slots.len()
            || properties
                .iter()
                .zip(&node.slots)
                .any(|((name, value), (slot_name, slot))| {
                    name.as_str() != &**slot_name || *value != slot.value()
                })
        {
            return false;
        }

        let children = source.children(id);
        children.len() == self.num_children()
            && self
                .children()
                .zip(children)
                .all(|(replica, &child)| replica.is_equivalent_to(source, child))
    }
}

/// Single-slot handoff of the newest replica to the reader.
///
/// Every pointer stored here owns one reference; a swap transfers that
/// ownership to whoever performed it.
pub(crate) struct ReplicaMailbox {
    pending: AtomicPtr<ReplicaTree>,
}

impl ReplicaMailbox {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Offer a new replica, replacing any the reader has not picked up yet.
    pub(crate) fn publish(&self, replica: Reclaimable<ReplicaTree>) {
        let raw = replica.into_raw() as *mut ReplicaTree;
        let old = self.pending.swap(raw, Ordering::AcqRel);
        // SAFETY: Non-null pointers in the slot come from `into_raw` above and
        // the swap gave us exclusive ownership of `old`.
        unsafe { drop(Self::reclaim(old)) };
    }

    /// Take the newest unread replica, if any.
    pub(crate) fn take(&self) -> Option<Reclaimable<ReplicaTree>> {
        let raw = self.pending.swap(ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: As in `publish`.
        unsafe { Self::reclaim(raw) }
    }

    unsafe fn reclaim(raw: *mut ReplicaTree) -> Option<Reclaimable<ReplicaTree>> {
        if raw.is_null() {
            None
        } else {
            Some(Reclaimable::from_raw(raw))
        }
    }
}

impl Drop for ReplicaMailbox {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// Consumer-side access to the latest replica.
///
/// Owned by the audio thread. [`replica`](Self::replica) picks up the newest
/// replica delivered by drained jobs; replacing the old one only drops a
/// reference, the memory itself is freed later by the collector.
pub struct ReplicaReader {
    mailbox: Reclaimable<ReplicaMailbox>,
    current: Reclaimable<ReplicaTree>,
}

impl ReplicaReader {
    pub(crate) fn new(
        mailbox: Reclaimable<ReplicaMailbox>,
        placeholder: Reclaimable<ReplicaTree>,
    ) -> Self {
        Self {
            mailbox,
            current: placeholder,
        }
    }

    /// The newest replica delivered so far.
    pub fn replica(&mut self) -> &ReplicaTree {
        if let Some(latest) = self.mailbox.take() {
            self.current = latest;
        }
        &self.current
    }

    /// The replica picked up by the last call to `replica`, without checking
    /// for a newer one.
    pub fn current(&self) -> &ReplicaTree {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::DeferredCollector;

    fn sample_tree() -> SourceTree {
        let mut tree = SourceTree::new("synth");
        let root = tree.root();
        tree.set_property(root, "name", "lead").unwrap();
        let osc = tree.add_child(root, "osc", None).unwrap();
        tree.set_property(osc, "freq", 440.0).unwrap();
        tree.set_property(osc, "count", 5).unwrap();
        let env = tree.add_child(root, "env", None).unwrap();
        tree.set_property(env, "attack", 0.01).unwrap();
        tree
    }

    #[test]
    fn test_snapshot_is_equivalent() {
        let tree = sample_tree();
        let replica = ReplicaTree::snapshot(&tree, 1);

        assert_eq!(replica.len(), 3);
        assert!(replica.is_equivalent_to(&tree));

        let root = replica.root().unwrap();
        assert_eq!(root.kind(), "synth");
        assert_eq!(root.text("name"), Some("lead"));
        let osc = root.child(0).unwrap();
        assert_eq!(osc.scalar("count"), Some(Scalar::Int(5)));
        assert_eq!(osc.property_names().collect::<Vec<_>>(), vec!["freq", "count"]);
        assert_eq!(replica.find(osc.id()).unwrap().kind(), "osc");
    }

    #[test]
    fn test_equivalence_detects_drift() {
        let mut tree = sample_tree();
        let replica = ReplicaTree::snapshot(&tree, 1);
        let osc = tree.children(tree.root())[0];

        tree.set_property(osc, "count", 6).unwrap();
        assert!(!replica.is_equivalent_to(&tree));

        let replica = ReplicaTree::snapshot(&tree, 2);
        tree.move_child(tree.root(), 0, 1).unwrap();
        assert!(!replica.is_equivalent_to(&tree));
    }

    #[test]
    fn test_write_scalar_in_place() {
        let tree = sample_tree();
        let replica = ReplicaTree::snapshot(&tree, 1);
        let osc = tree.children(tree.root())[0];
        let index = replica.nodes.iter().position(|n| n.id == osc).unwrap();

        let slot = replica.scalar_slot(index, "count").unwrap();
        replica.write_scalar(index, slot, Scalar::Int(6));
        assert_eq!(replica.find(osc).unwrap().scalar("count"), Some(Scalar::Int(6)));

        // Text slots are not scalar slots.
        assert_eq!(replica.scalar_slot(0, "name"), None);
    }

    #[test]
    fn test_mailbox_keeps_only_newest() {
        let collector = DeferredCollector::new();
        let tree = sample_tree();
        let mailbox = collector.register(ReplicaMailbox::new());
        let mut reader = ReplicaReader::new(
            mailbox.clone(),
            collector.register(ReplicaTree::placeholder()),
        );
        assert!(reader.replica().root().is_none());

        mailbox.publish(collector.register(ReplicaTree::snapshot(&tree, 1)));
        mailbox.publish(collector.register(ReplicaTree::snapshot(&tree, 2)));
        assert_eq!(reader.replica().generation(), 2);
        assert_eq!(reader.current().generation(), 2);

        // Placeholder and generation 1 are unreferenced now.
        assert_eq!(collector.sweep(), 2);
    }
}
