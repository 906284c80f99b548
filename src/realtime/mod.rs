// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Real-time safe utilities for audio processing.
//!
//! This module provides lock-free data structures for handing work from a
//! non-critical thread to the audio thread.
//!
//! # Real-Time Safety
//!
//! The audio thread has strict requirements:
//! - No memory allocation
//! - No locks (mutexes, RwLocks)
//! - No system calls (file I/O, network)
//! - Bounded execution time
//!
//! [`CallQueueConsumer::drain`] and the [`AtomicScalar`] accessors are
//! designed to be called from the audio thread. Everything on the producer
//! side may allocate.

pub mod atomic_scalar;
pub mod call_queue;

pub use atomic_scalar::{AtomicScalar, Scalar};
pub use call_queue::{
    round_up_to_slot_boundary, CallQueue, CallQueueConsumer, CallQueueProducer, SLOT_ALIGN,
};
