// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Deferred collector for objects shared with the audio thread.
//!
//! # Problem
//!
//! The system allocator may take a lock, so creating or freeing an object on
//! the audio thread can stall it for an unbounded time.
//!
//! # Solution
//!
//! Objects are created on a non-critical thread and registered with a
//! [`DeferredCollector`], which keeps one reference of its own. The audio
//! thread can then clone, read and drop [`Reclaimable`] handles freely: its
//! drops only ever decrement a counter. A periodic [`sweep`] on the
//! collector's thread frees every object whose only remaining reference is
//! the collector's.
//!
//! Objects must not be mutated after they have been shared. The collector
//! provides deferred destruction, not synchronization.
//!
//! [`sweep`]: DeferredCollector::sweep

use crate::config::CollectorConfig;
use crate::gc::reclaimable::Reclaimable;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace};

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("{remaining} objects still referenced after {passes} shutdown sweeps")]
    Leaked { remaining: usize, passes: usize },
}

/// Registry of objects awaiting deferred destruction.
///
/// Pass it around explicitly (usually as `Arc<DeferredCollector>`); there is
/// no global instance. The registry lock is only taken by `register`,
/// `adopt`, `is_registered` and `sweep`, none of which may be called from the
/// audio thread.
pub struct DeferredCollector {
    /// Registered objects by allocation address. The value is the
    /// collector's own reference.
    registry: Mutex<HashMap<usize, Arc<dyn Send + Sync>>>,
    /// Sweep passes attempted at shutdown before reporting a leak.
    shutdown_sweep_passes: usize,
}

impl DeferredCollector {
    /// Default number of shutdown sweep passes.
    pub const DEFAULT_SHUTDOWN_PASSES: usize = 100;

    /// Create an empty collector.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            shutdown_sweep_passes: Self::DEFAULT_SHUTDOWN_PASSES,
        }
    }

    /// Create an empty collector using the given settings.
    pub fn with_config(config: &CollectorConfig) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            shutdown_sweep_passes: config.shutdown_sweep_passes.max(1),
        }
    }

    /// Construct a shared object and register it in one step.
    ///
    /// Call this from the collector's (non-critical) thread.
    pub fn register<T: Send + Sync + 'static>(&self, value: T) -> Reclaimable<T> {
        self.adopt(Arc::new(value))
    }

    /// Register an existing allocation.
    ///
    /// # Panics
    ///
    /// Registering the same allocation twice is a programmer error and
    /// panics in debug builds.
    pub fn adopt<T: Send + Sync + 'static>(&self, object: Arc<T>) -> Reclaimable<T> {
        let handle = Reclaimable::from_registered(object);
        let own: Arc<dyn Send + Sync> = handle.as_arc().clone();

        let mut registry = self.registry.lock();
        let previous = registry.insert(handle.addr(), own);
        debug_assert!(previous.is_none(), "object registered with the collector twice");
        trace!("Registered object {:#x} ({} tracked)", handle.addr(), registry.len());

        handle
    }

    /// Whether the object behind `handle` is tracked by this collector.
    pub fn is_registered<T: ?Sized>(&self, handle: &Reclaimable<T>) -> bool {
        self.registry.lock().contains_key(&handle.addr())
    }

    /// Number of objects currently tracked.
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.registry.lock().is_empty()
    }

    /// Free every object that only the collector still references.
    ///
    /// Returns the number of objects freed. Objects owned by a freed object
    /// are released by a later sweep.
    pub fn sweep(&self) -> usize {
        let reclaimed: Vec<Arc<dyn Send + Sync>> = {
            let mut registry = self.registry.lock();
            let dead: Vec<usize> = registry
                .iter()
                .filter(|(_, object)| Arc::strong_count(object) == 1)
                .map(|(addr, _)| *addr)
                .collect();
            dead.iter().filter_map(|addr| registry.remove(addr)).collect()
        };

        // Destructors run outside the lock, they may register or drop handles.
        let count = reclaimed.len();
        drop(reclaimed);

        if count > 0 {
            trace!("Collector swept {} objects", count);
        }
        count
    }

    /// Address and outside reference count of every tracked object, ordered
    /// by address.
    fn outstanding(&self) -> Vec<(usize, usize)> {
        let registry = self.registry.lock();
        let mut outstanding: Vec<(usize, usize)> = registry
            .iter()
            .map(|(addr, object)| (*addr, Arc::strong_count(object) - 1))
            .collect();
        outstanding.sort_unstable();
        outstanding
    }

    /// Sweep until the registry is empty or the pass budget is exhausted.
    ///
    /// Returns [`CollectorError::Leaked`] if objects are still referenced
    /// elsewhere afterwards.
    pub fn shutdown(&self) -> Result<(), CollectorError> {
        let mut passes = 0;
        while passes < self.shutdown_sweep_passes && !self.is_empty() {
            self.sweep();
            passes += 1;
        }

        let outstanding = self.outstanding();
        if !outstanding.is_empty() {
            let remaining = outstanding.len();
            error!(
                "Collector shutdown leaked {} objects after {} passes",
                remaining, passes
            );
            for (addr, refs) in &outstanding {
                error!("  leaked object {:#x} ({} outside references)", addr, refs);
            }
            return Err(CollectorError::Leaked { remaining, passes });
        }

        debug!("Collector shut down after {} passes", passes);
        Ok(())
    }
}

impl Default for DeferredCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferredCollector {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            if !std::thread::panicking() {
                debug_assert!(false, "{e}");
            }
        }
    }
}
