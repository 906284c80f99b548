// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Periodic tick source for a [`DeferredCollector`].

use crate::gc::collector::DeferredCollector;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SweeperError {
    #[error("Failed to spawn sweeper thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(150);

/// Handle to a background thread that sweeps a collector on a fixed interval.
///
/// The thread stops when the handle is dropped or [`stop`](Self::stop) is
/// called.
pub struct Sweeper {
    /// Dropping the sender wakes and stops the thread.
    stop_tx: Option<mpsc::Sender<()>>,
    /// Handle to the spawned thread.
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn the sweeper thread.
    pub fn spawn(
        collector: Arc<DeferredCollector>,
        interval: Duration,
    ) -> Result<Self, SweeperError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("rtbridge-gc".to_string())
            .spawn(move || {
                debug!("Sweeper started ({:?} interval)", interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            collector.sweep();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Sweeper stopped");
            })?;

        info!("Collector sweeper running every {:?}", interval);
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to finish.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_sweeper_reclaims_within_an_interval() {
        let collector = Arc::new(DeferredCollector::new());
        let sweeper = Sweeper::spawn(Arc::clone(&collector), Duration::from_millis(10)).unwrap();

        let handle = collector.register(vec![0.0f32; 64]);
        drop(handle);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !collector.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(collector.is_empty());

        sweeper.stop();
    }

    #[test]
    fn test_live_objects_are_kept() {
        let collector = Arc::new(DeferredCollector::new());
        let handle = collector.register(42u64);
        let sweeper = Sweeper::spawn(Arc::clone(&collector), Duration::from_millis(5)).unwrap();

        thread::sleep(Duration::from_millis(40));
        assert!(collector.is_registered(&handle));
        assert_eq!(*handle, 42);

        drop(sweeper);
        drop(handle);
        assert_eq!(collector.sweep(), 1);
    }
}
