// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mapping from source nodes to their position in the current replica.

use crate::gc::Reclaimable;
use crate::tree::replica::ReplicaTree;
use crate::tree::source::{NodeId, SourceTree};
use std::collections::HashMap;

/// Links for one replica generation.
///
/// Holds a handle to the replica it was built from, so a link can never
/// outlive the nodes it points into.
#[derive(Debug, Default)]
pub(crate) struct LinkCache {
    generation: u64,
    replica: Option<Reclaimable<ReplicaTree>>,
    links: HashMap<NodeId, usize>,
}

impl LinkCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replace every link by walking `source` and `replica` side by side.
    ///
    /// The replica must be a fresh snapshot of `source`. A node whose id or
    /// child count differs means a resync was missed; that subtree is left
    /// unlinked so property changes below it fall back to a full resync.
    pub(crate) fn rebuild(&mut self, source: &SourceTree, replica: Reclaimable<ReplicaTree>) {
        self.links.clear();
        self.generation = replica.generation();

        let mut pending = vec![(source.root(), 0usize)];
        while let Some((id, index)) = pending.pop() {
            let Some(node) = replica.node(index) else {
                debug_assert!(false, "replica has no node at {index} for {id}");
                continue;
            };
            let children = source.children(id);
            if node.id != id || node.children.len() != children.len() {
                debug_assert!(false, "replica diverged from source at {id}");
                continue;
            }

            self.links.insert(id, index);
            pending.extend(children.iter().copied().zip(node.children.iter().copied()));
        }

        self.replica = Some(replica);
    }

    /// The replica and node index linked to `id`.
    pub(crate) fn lookup(&self, id: NodeId) -> Option<(&Reclaimable<ReplicaTree>, usize)> {
        let replica = self.replica.as_ref()?;
        let index = *self.links.get(&id)?;
        Some((replica, index))
    }

    /// Drop all links and the replica handle.
    pub(crate) fn clear(&mut self) {
        self.links.clear();
        self.replica = None;
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }
}
