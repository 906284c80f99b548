// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Hierarchical state mirrored from the UI thread to the audio thread.
//!
//! The producer side edits a [`SourceTree`]; a [`TreeSynchronizer`] listens
//! to it and ships [`ReplicaTree`]s and in-place scalar updates through a
//! call queue. The consumer side reads the result through a
//! [`ReplicaReader`].

pub mod dump;
mod link_cache;
pub mod replica;
pub mod source;
pub mod sync;
pub mod value;

pub use replica::{NodeRef, ReplicaReader, ReplicaTree};
pub use source::{ListenerId, NodeId, SourceTree, TreeError, TreeId, TreeListener};
pub use sync::{SyncStats, TreeSynchronizer};
pub use value::{Scalar, Value};
