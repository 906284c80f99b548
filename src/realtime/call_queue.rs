// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Lock-free single-producer single-consumer closure queue.
//!
//! Used for calling functions on the audio thread from the UI thread without
//! locking and without touching the allocator after construction.
//!
//! # Example
//!
//! ```
//! use rtbridge::realtime::CallQueue;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! let (producer, mut consumer) = CallQueue::new(1024).split();
//! let gain = Arc::new(AtomicU32::new(0));
//!
//! // UI thread queues a call
//! let target = Arc::clone(&gain);
//! assert!(producer.try_enqueue(move || target.store(7, Ordering::Relaxed)));
//!
//! // Audio thread runs everything that is ready
//! assert!(consumer.drain());
//! assert_eq!(gain.load(Ordering::Relaxed), 7);
//! ```
//!
//! # Layout
//!
//! Each job is written inline into the byte ring as a `Job`: a single entry
//! point followed by the captured closure. The entry point runs (or discards)
//! the closure, destroys it and reports the job's size, so draining needs one
//! indirect call per job and no vtable.
//!
//! The storage is allocated at twice the logical capacity. A job that starts
//! near the end of the logical ring hangs over into the second half instead
//! of being split, so every job is contiguous in memory.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Granularity (and alignment) of a job slot in bytes.
pub const SLOT_ALIGN: usize = 16;

/// Round a job size up to the slot boundary.
///
/// Every reservation goes through this function. Slots are currently 16-byte
/// aligned, which is enough for any closure the queue accepts; moving to a
/// full cache line would keep the cursors' neighbouring jobs from sharing a
/// line at the cost of more padding per job.
#[inline]
pub const fn round_up_to_slot_boundary(size: usize) -> usize {
    (size + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1)
}

/// One aligned chunk of ring storage.
#[repr(C, align(16))]
struct Chunk(UnsafeCell<[MaybeUninit<u8>; SLOT_ALIGN]>);

/// What the entry point should do with the closure it destroys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Run,
    Discard,
}

/// Entry point stored at the head of every job.
///
/// Runs or discards the closure, drops it in place and returns the unrounded
/// size of the job.
type ExecAndDestroyFn = unsafe fn(*mut u8, Disposition) -> usize;

/// A closure stored inline in the ring.
#[repr(C)]
struct Job<F> {
    exec: ExecAndDestroyFn,
    call: F,
}

impl<F: FnOnce() + Send + 'static> Job<F> {
    const ALIGN_OK: () = assert!(
        mem::align_of::<Job<F>>() <= SLOT_ALIGN,
        "closure alignment exceeds the call queue slot alignment"
    );

    /// # Safety
    ///
    /// `storage` must point at a live, initialized `Job<F>` which is not
    /// touched again after this call.
    unsafe fn exec_and_destroy(storage: *mut u8, disposition: Disposition) -> usize {
        // Moves the job out, the ring bytes are dead after this read.
        let job = storage.cast::<Job<F>>().read();
        match disposition {
            Disposition::Run => (job.call)(),
            Disposition::Discard => drop(job.call),
        }
        mem::size_of::<Job<F>>()
    }
}

/// Storage shared between the producer and consumer handles.
struct Shared {
    /// Ring storage, `2 * capacity` bytes.
    storage: Box<[Chunk]>,
    /// Logical capacity in bytes. A power of two, so cursor offsets stay
    /// consistent when the cursors wrap around `usize::MAX`.
    capacity: usize,
    /// Total bytes ever reserved (only modified by the producer).
    write_pos: AtomicUsize,
    /// Total bytes ever released (only modified by the consumer).
    read_pos: AtomicUsize,
    /// Cleared by `disable`.
    accepting: AtomicBool,
    /// Set when a job panicked mid-drain; remaining jobs are leaked.
    poisoned: AtomicBool,
}

// SAFETY: The queue is designed for SPSC access.
// Only the producer writes job bytes between read_pos and capacity ahead of it
// and publishes them with a release store of write_pos. Only the consumer
// reads job bytes between read_pos and write_pos and releases them with a
// release store of read_pos.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn base(&self) -> *mut u8 {
        self.storage.as_ptr() as *mut u8
    }

    fn used(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    fn free_space(&self) -> usize {
        self.capacity - self.used()
    }

    fn is_empty(&self) -> bool {
        self.used() == 0
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if *self.poisoned.get_mut() {
            return;
        }
        let write = *self.write_pos.get_mut();
        let mut read = *self.read_pos.get_mut();
        while read != write {
            // SAFETY: Both handles are gone, every job between the cursors is
            // initialized and owned by us.
            let size = unsafe {
                let job = self.base().add(read & (self.capacity - 1));
                let exec = job.cast::<ExecAndDestroyFn>().read();
                exec(job, Disposition::Discard)
            };
            read = read.wrapping_add(round_up_to_slot_boundary(size));
        }
    }
}

/// A fixed-capacity queue of closures, split into a producer and a consumer.
///
/// Enqueueing never blocks and never splits a job: a closure either fits
/// entirely or [`CallQueueProducer::try_enqueue`] returns `false`. Jobs run
/// in exactly the order they were enqueued. For two-way communication use two
/// queues.
pub struct CallQueue {
    shared: Arc<Shared>,
}

impl CallQueue {
    /// Create a queue holding up to `capacity` bytes of jobs.
    ///
    /// The capacity is rounded up to the next power of two (at least one
    /// slot). This is the only allocation the queue ever makes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or too large to round up.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "CallQueue capacity must be > 0");
        assert!(capacity <= usize::MAX / 4, "CallQueue capacity too large");
        let capacity = capacity.max(SLOT_ALIGN).next_power_of_two();
        let chunks = 2 * capacity / SLOT_ALIGN;
        let storage = (0..chunks)
            .map(|_| Chunk(UnsafeCell::new([MaybeUninit::uninit(); SLOT_ALIGN])))
            .collect();

        Self {
            shared: Arc::new(Shared {
                storage,
                capacity,
                write_pos: AtomicUsize::new(0),
                read_pos: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
                poisoned: AtomicBool::new(false),
            }),
        }
    }

    /// The logical capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Split into producer and consumer handles.
    pub fn split(self) -> (CallQueueProducer, CallQueueConsumer) {
        (
            CallQueueProducer {
                shared: Arc::clone(&self.shared),
                _not_sync: PhantomData,
            },
            CallQueueConsumer {
                shared: self.shared,
                _not_sync: PhantomData,
            },
        )
    }
}

/// Producer handle for the call queue.
///
/// Only one producer exists per queue. It can be moved to another thread but
/// not shared between threads; within its thread it may be shared (e.g. in an
/// `Rc`) since enqueueing takes `&self`.
pub struct CallQueueProducer {
    shared: Arc<Shared>,
    _not_sync: PhantomData<Cell<()>>,
}

impl CallQueueProducer {
    /// Queue `f` to be called on the consumer thread.
    ///
    /// Returns `false` without side effects if the queue has been disabled or
    /// does not have room for the job. The closure is dropped in that case;
    /// retrying, dropping the work or signalling back is up to the caller.
    ///
    /// Anything the closure captures by value is dropped on the consumer
    /// thread after it runs, so captures should not own heap allocations.
    pub fn try_enqueue<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        #[allow(clippy::let_unit_value)]
        let () = Job::<F>::ALIGN_OK;

        let shared = &*self.shared;
        if !shared.accepting.load(Ordering::Acquire) {
            return false;
        }

        let alloc_size = round_up_to_slot_boundary(mem::size_of::<Job<F>>());
        if alloc_size > shared.capacity {
            return false;
        }

        let write = shared.write_pos.load(Ordering::Relaxed);
        let read = shared.read_pos.load(Ordering::Acquire);
        if shared.capacity - write.wrapping_sub(read) < alloc_size {
            return false;
        }

        // SAFETY: The free-space check guarantees these bytes are not part of
        // any unread job. The offset is slot aligned and `offset + alloc_size`
        // stays inside the double-size storage because `alloc_size <= capacity`.
        unsafe {
            let slot = shared.base().add(write & (shared.capacity - 1));
            slot.cast::<Job<F>>().write(Job {
                exec: Job::<F>::exec_and_destroy,
                call: f,
            });
        }

        shared
            .write_pos
            .store(write.wrapping_add(alloc_size), Ordering::Release);
        true
    }

    /// Bytes currently available for new jobs.
    ///
    /// There is no guarantee the space is still free by the time the next
    /// job is queued, but the producer is the only party that can shrink it.
    pub fn free_space(&self) -> usize {
        self.shared.free_space()
    }

    /// Whether every queued job has been drained.
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// The logical capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Stop accepting new jobs. Jobs already queued still run on the next drain.
    pub fn disable(&self) {
        self.shared.accepting.store(false, Ordering::Release);
    }

    /// Whether `try_enqueue` can currently succeed given enough space.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }
}

/// Consumer handle for the call queue.
///
/// Only one consumer exists per queue. Call [`drain`](Self::drain) regularly
/// from the critical thread.
pub struct CallQueueConsumer {
    shared: Arc<Shared>,
    _not_sync: PhantomData<Cell<()>>,
}

/// Marks the queue poisoned if a job unwinds out of `drain`.
struct PoisonOnUnwind<'a>(&'a AtomicBool);

impl Drop for PoisonOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

impl CallQueueConsumer {
    /// Run every job that is ready, in the order it was queued.
    ///
    /// Jobs queued while draining also run. Returns `true` if at least one
    /// job ran.
    ///
    /// # Panics
    ///
    /// A panicking job propagates out of `drain`. The queue is then poisoned
    /// and the remaining jobs are leaked instead of dropped.
    pub fn drain(&mut self) -> bool {
        let shared = &*self.shared;
        let guard = PoisonOnUnwind(&shared.poisoned);
        let mut ran_any = false;

        loop {
            let read = shared.read_pos.load(Ordering::Relaxed);
            let write = shared.write_pos.load(Ordering::Acquire);
            if read == write {
                break;
            }

            // SAFETY: The acquire load of write_pos makes the job at `read`
            // visible, and only we run it. The entry point moves the closure
            // out, so the bytes may be reused once read_pos moves past them.
            let size = unsafe {
                let job = shared.base().add(read & (shared.capacity - 1));
                let exec = job.cast::<ExecAndDestroyFn>().read();
                exec(job, Disposition::Run)
            };

            shared
                .read_pos
                .store(read.wrapping_add(round_up_to_slot_boundary(size)), Ordering::Release);
            ran_any = true;
        }

        drop(guard);
        ran_any
    }

    /// Bytes currently available for new jobs.
    pub fn free_space(&self) -> usize {
        self.shared.free_space()
    }

    /// Whether there is nothing left to drain.
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// Stop the producer from queueing new jobs (e.g. during shutdown).
    pub fn disable(&self) {
        self.shared.accepting.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;
    use std::thread;

    fn job_size<F>(_: &F) -> usize {
        mem::size_of::<Job<F>>()
    }

    #[test]
    fn test_slot_rounding() {
        assert_eq!(round_up_to_slot_boundary(0), 0);
        assert_eq!(round_up_to_slot_boundary(1), 16);
        assert_eq!(round_up_to_slot_boundary(16), 16);
        assert_eq!(round_up_to_slot_boundary(17), 32);
        assert_eq!(CallQueue::new(1000).capacity(), 1024);
        assert_eq!(CallQueue::new(1).capacity(), SLOT_ALIGN);
        assert_eq!(CallQueue::new(128).capacity(), 128);
    }

    #[test]
    fn test_runs_in_fifo_order() {
        let (producer, mut consumer) = CallQueue::new(1024).split();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            assert!(producer.try_enqueue(move || seen.lock().unwrap().push(i)));
        }

        assert!(consumer.drain());
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_drain_empty_is_noop() {
        let (producer, mut consumer) = CallQueue::new(256).split();
        assert!(!consumer.drain());

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        assert!(producer.try_enqueue(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        assert!(consumer.drain());
        assert!(!consumer.drain());
        assert!(!consumer.drain());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_small_jobs_fit_and_oversized_job_is_rejected() {
        let (producer, mut consumer) = CallQueue::new(1024).split();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let c = Arc::clone(&count);
            let job = move || {
                c.fetch_add(1, Ordering::Relaxed);
            };
            assert_eq!(job_size(&job), 16);
            assert!(producer.try_enqueue(job));
        }
        assert_eq!(producer.free_space(), 1024 - 50 * 16);

        let big = [7u8; 2000];
        let c = Arc::clone(&count);
        assert!(!producer.try_enqueue(move || {
            c.fetch_add(big[0] as usize, Ordering::Relaxed);
        }));
        assert_eq!(producer.free_space(), 1024 - 50 * 16);

        assert!(consumer.drain());
        assert_eq!(count.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_full_queue_recovers_after_drain() {
        let (producer, mut consumer) = CallQueue::new(128).split();
        let count = Arc::new(AtomicUsize::new(0));
        let job = |c: Arc<AtomicUsize>| {
            move || {
                c.fetch_add(1, Ordering::Relaxed);
            }
        };

        let mut accepted = 0;
        while producer.try_enqueue(job(Arc::clone(&count))) {
            accepted += 1;
        }
        assert_eq!(accepted, 8);
        assert_eq!(producer.free_space(), 0);
        assert!(!producer.try_enqueue(job(Arc::clone(&count))));

        assert!(consumer.drain());
        assert!(producer.try_enqueue(job(Arc::clone(&count))));
        assert!(consumer.drain());
        assert_eq!(count.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn test_jobs_wrap_around_the_ring() {
        // 48-byte jobs in a 128-byte ring start at offsets that overhang the end.
        let (producer, mut consumer) = CallQueue::new(128).split();
        let total = Arc::new(AtomicU64::new(0));

        for round in 0..20u64 {
            let t = Arc::clone(&total);
            let payload = [round; 4];
            assert!(producer.try_enqueue(move || {
                t.fetch_add(payload.iter().sum::<u64>(), Ordering::Relaxed);
            }));
            if round % 2 == 1 {
                assert!(consumer.drain());
            }
        }

        assert_eq!(total.load(Ordering::Relaxed), 4 * (0..20).sum::<u64>());
    }

    #[test]
    fn test_cursors_wrapping_past_usize_max() {
        let queue = CallQueue::new(1000);
        let start = usize::MAX - 15;
        queue.shared.write_pos.store(start, Ordering::Relaxed);
        queue.shared.read_pos.store(start, Ordering::Relaxed);
        let (producer, mut consumer) = queue.split();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for round in 0..3 {
            for i in 0..3u64 {
                let seen = Arc::clone(&seen);
                let value = round * 3 + i;
                assert!(producer.try_enqueue(move || seen.lock().unwrap().push(value)));
            }
            assert!(consumer.drain());
        }

        assert_eq!(*seen.lock().unwrap(), (0..9).collect::<Vec<u64>>());
        assert!(consumer.is_empty());
        assert_eq!(producer.free_space(), producer.capacity());
    }

    #[test]
    fn test_disable_keeps_queued_jobs() {
        let (producer, mut consumer) = CallQueue::new(256).split();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        assert!(producer.try_enqueue(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        producer.disable();
        assert!(!producer.is_accepting());
        let c = Arc::clone(&count);
        assert!(!producer.try_enqueue(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        assert!(consumer.drain());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_undrained_jobs_are_dropped_with_queue() {
        let (producer, consumer) = CallQueue::new(256).split();
        let marker = Arc::new(());

        for _ in 0..3 {
            let m = Arc::clone(&marker);
            assert!(producer.try_enqueue(move || drop(m)));
        }
        assert_eq!(Arc::strong_count(&marker), 4);

        drop(producer);
        drop(consumer);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_spsc_across_threads() {
        const JOBS: u64 = 20_000;
        let (producer, mut consumer) = CallQueue::new(1022).split();
        let last = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let critical = {
            let done = Arc::clone(&done);
            thread::spawn(move || loop {
                let finished = done.load(Ordering::Acquire);
                consumer.drain();
                if finished {
                    break;
                }
                thread::yield_now();
            })
        };

        let mut queue_full = 0u64;
        for n in 1..=JOBS {
            loop {
                let last = Arc::clone(&last);
                let errors = Arc::clone(&errors);
                // Alternate between two closure sizes.
                let ok = if n % 2 == 0 {
                    producer.try_enqueue(move || {
                        if last.swap(n, Ordering::Relaxed) + 1 != n {
                            errors.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                } else {
                    let padding = [0u8; 37];
                    producer.try_enqueue(move || {
                        let n = n + padding[0] as u64;
                        if last.swap(n, Ordering::Relaxed) + 1 != n {
                            errors.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                };
                if ok {
                    break;
                }
                queue_full += 1;
                thread::yield_now();
            }
        }

        done.store(true, Ordering::Release);
        critical.join().unwrap();

        assert_eq!(last.load(Ordering::Relaxed), JOBS);
        assert_eq!(errors.load(Ordering::Relaxed), 0, "queue was full {queue_full} times");
    }
}
