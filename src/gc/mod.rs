// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Deferred destruction for objects handed to the audio thread.
//!
//! # How
//!
//! 1. Create objects on a non-critical thread with
//!    [`DeferredCollector::register`].
//! 2. Pass the returned [`Reclaimable`] handle to the audio thread through a
//!    lock-free channel such as the [`CallQueue`].
//! 3. Run a [`Sweeper`] (or call [`DeferredCollector::sweep`] from a timer)
//!    so unused objects are freed off the audio thread.
//!
//! [`CallQueue`]: crate::realtime::CallQueue

pub mod collector;
pub mod reclaimable;
pub mod sweeper;

pub use collector::{CollectorError, DeferredCollector};
pub use reclaimable::{Reclaimable, SharedObject};
pub use sweeper::{Sweeper, SweeperError, DEFAULT_SWEEP_INTERVAL};
