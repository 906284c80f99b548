// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! rtbridge - Hand work and state to a real-time audio thread.
//!
//! The audio thread never allocates, frees or locks. Work reaches it through
//! a lock-free [`CallQueue`](realtime::CallQueue), shared objects are freed
//! later by a [`DeferredCollector`](gc::DeferredCollector), and application
//! state is mirrored into read-only replicas by a
//! [`TreeSynchronizer`](tree::TreeSynchronizer).

pub mod config;
pub mod gc;
pub mod realtime;
pub mod tree;
