// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The mutable hierarchical tree edited on the non-critical thread.
//!
//! Every node gets a stable [`NodeId`] when it is created. Mutations are
//! reported to subscribed [`TreeListener`]s after they have been applied.

use crate::tree::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::rc::Weak;
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    UnknownNode(NodeId),
    #[error("Child index {index} out of range for node {parent} ({len} children)")]
    IndexOutOfRange {
        parent: NodeId,
        index: usize,
        len: usize,
    },
}

/// Stable identity of a node, carried into every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Uuid);

impl NodeId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a [`SourceTree`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(Uuid);

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Receives mutation notifications from a [`SourceTree`].
///
/// Callbacks run synchronously after the mutation, with read access to the
/// updated tree.
pub trait TreeListener {
    /// `child` was inserted under `parent`.
    fn child_added(&self, tree: &SourceTree, parent: NodeId, child: NodeId);

    /// `child` (and its subtree) was removed from `parent` at `index`.
    fn child_removed(&self, tree: &SourceTree, parent: NodeId, child: NodeId, index: usize);

    /// A child of `parent` moved from `old_index` to `new_index`.
    fn child_order_changed(
        &self,
        tree: &SourceTree,
        parent: NodeId,
        old_index: usize,
        new_index: usize,
    );

    /// Property `name` of `node` was set, changed or removed.
    fn property_changed(&self, tree: &SourceTree, node: NodeId, name: &str);
}

#[derive(Debug, Clone)]
struct SourceNode {
    kind: String,
    properties: Vec<(String, Value)>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl SourceNode {
    fn new(kind: String, parent: Option<NodeId>) -> Self {
        Self {
            kind,
            properties: Vec::new(),
            children: Vec::new(),
            parent,
        }
    }
}

/// A tree of typed nodes with ordered properties and ordered children.
pub struct SourceTree {
    id: TreeId,
    root: NodeId,
    nodes: HashMap<NodeId, SourceNode>,
    listeners: Vec<(ListenerId, Weak<dyn TreeListener>)>,
    next_listener: u64,
}

impl SourceTree {
    /// Create a tree with a single root node of the given kind.
    pub fn new(root_kind: impl Into<String>) -> Self {
        let root = NodeId::new();
        let mut nodes = HashMap::new();
        nodes.insert(root, SourceNode::new(root_kind.into(), None));

        Self {
            id: TreeId(Uuid::new_v4()),
            root,
            nodes,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Total number of nodes, including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn kind(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(&node).map(|n| n.kind.as_str())
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(&node).and_then(|n| n.parent)
    }

    /// Children of `node` in order (empty for unknown nodes).
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(&node)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// Properties of `node` in insertion order (empty for unknown nodes).
    pub fn properties(&self, node: NodeId) -> &[(String, Value)] {
        self.nodes
            .get(&node)
            .map(|n| n.properties.as_slice())
            .unwrap_or(&[])
    }

    pub fn property(&self, node: NodeId, name: &str) -> Option<&Value> {
        self.properties(node)
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Subscribe to mutations. The listener is dropped from the list once
    /// its last strong reference goes away.
    pub fn add_listener(&mut self, listener: Weak<dyn TreeListener>) -> ListenerId {
        self.prune_listeners();
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Unsubscribe. Returns `false` if the listener was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        before != self.listeners.len()
    }

    /// Insert a new child under `parent` at `index` (appended if `None`).
    pub fn add_child(
        &mut self,
        parent: NodeId,
        kind: impl Into<String>,
        index: Option<usize>,
    ) -> Result<NodeId, TreeError> {
        let len = self.node(parent)?.children.len();
        let index = index.unwrap_or(len);
        if index > len {
            return Err(TreeError::IndexOutOfRange { parent, index, len });
        }

        let child = NodeId::new();
        self.nodes
            .insert(child, SourceNode::new(kind.into(), Some(parent)));
        self.node_mut(parent)?.children.insert(index, child);
        trace!("Added node {} under {} at {}", child, parent, index);

        self.notify(|l, tree| l.child_added(tree, parent, child));
        Ok(child)
    }

    /// Remove the child of `parent` at `index`, together with its subtree.
    pub fn remove_child(&mut self, parent: NodeId, index: usize) -> Result<NodeId, TreeError> {
        let children = &mut self.node_mut(parent)?.children;
        let len = children.len();
        if index >= len {
            return Err(TreeError::IndexOutOfRange { parent, index, len });
        }
        let child = children.remove(index);

        let mut pending = vec![child];
        while let Some(id) = pending.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                pending.extend(node.children);
            }
        }
        trace!("Removed node {} from {}", child, parent);

        self.notify(|l, tree| l.child_removed(tree, parent, child, index));
        Ok(child)
    }

    /// Move the child of `parent` at `from` so it ends up at `to`.
    pub fn move_child(&mut self, parent: NodeId, from: usize, to: usize) -> Result<(), TreeError> {
        let children = &mut self.node_mut(parent)?.children;
        let len = children.len();
        for index in [from, to] {
            if index >= len {
                return Err(TreeError::IndexOutOfRange { parent, index, len });
            }
        }
        if from == to {
            return Ok(());
        }

        let child = children.remove(from);
        children.insert(to, child);

        self.notify(|l, tree| l.child_order_changed(tree, parent, from, to));
        Ok(())
    }

    /// Set a property, adding it if missing. Setting an identical value is a
    /// no-op and does not notify.
    pub fn set_property(
        &mut self,
        node: NodeId,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<(), TreeError> {
        let value = value.into();
        let properties = &mut self.node_mut(node)?.properties;
        if let Some(index) = properties.iter().position(|(n, _)| n == name) {
            if properties[index].1 == value {
                return Ok(());
            }
            properties[index].1 = value;
        } else {
            properties.push((name.to_string(), value));
        }

        self.notify(|l, tree| l.property_changed(tree, node, name));
        Ok(())
    }

    /// Remove a property. Returns whether it existed.
    pub fn remove_property(&mut self, node: NodeId, name: &str) -> Result<bool, TreeError> {
        let properties = &mut self.node_mut(node)?.properties;
        let before = properties.len();
        properties.retain(|(n, _)| n != name);
        if properties.len() == before {
            return Ok(false);
        }

        self.notify(|l, tree| l.property_changed(tree, node, name));
        Ok(true)
    }

    fn node(&self, id: NodeId) -> Result<&SourceNode, TreeError> {
        self.nodes.get(&id).ok_or(TreeError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut SourceNode, TreeError> {
        self.nodes.get_mut(&id).ok_or(TreeError::UnknownNode(id))
    }

    fn prune_listeners(&mut self) {
        self.listeners.retain(|(_, l)| l.strong_count() > 0);
    }

    fn notify(&mut self, f: impl Fn(&dyn TreeListener, &SourceTree)) {
        self.prune_listeners();
        let tree: &SourceTree = self;
        for (_, listener) in &tree.listeners {
            if let Some(listener) = listener.upgrade() {
                f(&*listener, tree);
            }
        }
    }
}

impl fmt::Debug for SourceTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceTree")
            .field("root", &self.root)
            .field("nodes", &self.nodes.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
