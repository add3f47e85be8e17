//! Lock-free MPMC disruptor ring with generation-tagged cells
//!
//! A cache-traffic-minimising ring for pointer-sized values. Producers
//! race along an unbounded sequence of generation numbers; the storage
//! for sequence `s` is cell `s & mask`. A cell's generation counter is
//! the ground truth for emptiness and reuse, which removes ABA without
//! tombstones or per-cell locks.
//!
//! ## Traffic separation
//!
//! Producers touch the producer block, the cells, and — only when their
//! cached consumer snapshot suggests the ring might be full — the
//! consumer cursors. Consumers touch their own block and the cells and
//! never read the producer block. With a large enough ring, coherency
//! traffic between the two classes happens roughly once per revolution.
//!
//! ## Consumer dependencies
//!
//! A consumer may declare a half-open range of parent consumer ids; its
//! read limit is then the minimum parent cursor, so it never overtakes
//! its parents. [`Snooper`]s are consumers invisible to flow control:
//! producers ignore them and their reads validate against the
//! generation counter instead.
//!
//! ## Failure semantics
//!
//! Nothing blocks. Enqueue fails when the ring is full and consumers
//! have made no progress since the last snapshot refresh; dequeue-style
//! operations return `None`/`0` on empty. Value `0` is reserved as the
//! empty sentinel.

mod dequeue;
mod enqueue;
mod slot;
mod snoop;

pub use snoop::Snooper;

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{QuiesceError, Result};

pub(crate) use slot::Slot;

/// Sequence number type for ring positions
pub type Sequence = u64;

/// Configuration for a ring
#[derive(Debug, Clone)]
pub struct RingConfig {
    capacity: usize,
    /// Per-consumer dependency ranges `[begin, end)` of parent ids
    dependencies: Vec<(u32, u32)>,
}

impl RingConfig {
    /// Create a new configuration with the specified capacity
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(QuiesceError::config("Ring capacity must be a power of 2"));
        }

        Ok(Self {
            capacity,
            dependencies: vec![(0, 0)],
        })
    }

    /// Set the number of consumers (default 1, no dependencies)
    pub fn with_consumers(mut self, n_consumers: usize) -> Result<Self> {
        if n_consumers == 0 {
            return Err(QuiesceError::config("Number of consumers must be greater than 0"));
        }
        if n_consumers > u32::MAX as usize {
            return Err(QuiesceError::config("Number of consumers does not fit a consumer id"));
        }

        self.dependencies = vec![(0, 0); n_consumers];
        Ok(self)
    }

    /// Declare that `consumer` must not overtake parents `deps`
    ///
    /// Parents must be earlier consumer ids, so dependency chains are
    /// acyclic by construction.
    pub fn with_dependencies(mut self, consumer: usize, deps: Range<u32>) -> Result<Self> {
        if consumer >= self.dependencies.len() {
            return Err(QuiesceError::config("Dependency target is not a configured consumer"));
        }
        if deps.end as usize > consumer {
            return Err(QuiesceError::config(
                "Dependencies must reference earlier consumer ids",
            ));
        }

        self.dependencies[consumer] = (deps.start, deps.end);
        Ok(self)
    }
}

/// Producer-side block. `consumer_snap` is a lower bound on the oldest
/// consumer cursor; no cell past `consumer_snap + mask` may be written.
/// `cursor` is the next sequence a producer intends to claim — exact
/// and monotonic for a single producer, a racy hint for many.
#[repr(align(128))]
pub(crate) struct ProducerBlock {
    pub(crate) cursor: AtomicU64,
    pub(crate) consumer_snap: AtomicU64,
}

/// Consumer-side block. `cursor` is the next sequence this consumer
/// will read; everything below it is fair game for producers.
/// `read_limit` is a lower bound on the exclusive end of the readable
/// range — consumers with dependencies keep it at or below every parent
/// cursor, consumers without dependencies park it far ahead and refresh
/// it rarely.
#[repr(align(128))]
pub(crate) struct ConsumerBlock {
    pub(crate) cursor: AtomicU64,
    pub(crate) read_limit: AtomicU64,
    pub(crate) dep_begin: u32,
    pub(crate) dep_end: u32,
}

impl ConsumerBlock {
    pub(crate) fn new(cursor: Sequence, dep_begin: u32, dep_end: u32) -> Self {
        Self {
            cursor: AtomicU64::new(cursor),
            read_limit: AtomicU64::new(0),
            dep_begin,
            dep_end,
        }
    }
}

/// Lock-free MPMC ring of `{generation, value}` cells
pub struct Ring {
    pub(crate) buf: Box<[Slot]>,
    pub(crate) mask: u64,
    pub(crate) prod: ProducerBlock,
    pub(crate) cons: Box<[ConsumerBlock]>,
}

impl Ring {
    /// Create a ring from a configuration
    ///
    /// Cursors start at the capacity so that the all-zero generations of
    /// a fresh buffer read as empty.
    pub fn new(config: RingConfig) -> Result<Self> {
        let capacity = config.capacity;
        let initial = capacity as u64;

        let buf = (0..capacity)
            .map(|_| Slot::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let cons = config
            .dependencies
            .iter()
            .map(|&(begin, end)| ConsumerBlock::new(initial, begin, end))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            buf,
            mask: (capacity - 1) as u64,
            prod: ProducerBlock {
                cursor: AtomicU64::new(initial),
                consumer_snap: AtomicU64::new(initial),
            },
            cons,
        })
    }

    /// Convenience constructor: `n_consumers` independent consumers
    pub fn with_capacity(capacity: usize, n_consumers: usize) -> Result<Self> {
        Self::new(RingConfig::new(capacity)?.with_consumers(n_consumers)?)
    }

    /// Number of cells
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Number of consumer blocks
    #[inline(always)]
    pub fn consumer_count(&self) -> usize {
        self.cons.len()
    }

    /// The next sequence a producer will claim (a hint under multiple
    /// producers)
    pub fn producer_cursor(&self) -> Sequence {
        self.prod.cursor.load(Ordering::Relaxed)
    }

    /// The next sequence consumer `index` will read
    pub fn consumer_cursor(&self, index: usize) -> Sequence {
        self.consumer(index).cursor.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn consumer(&self, index: usize) -> &ConsumerBlock {
        &self.cons[index]
    }

    /// Refresh a consumer's read limit from its dependency range.
    ///
    /// Without dependencies the limit is parked far ahead so this runs
    /// about once per 2^60 reads. With dependencies the limit becomes
    /// the minimum parent cursor; a parent that itself covers a
    /// sub-range of earlier parents lets the walk skip that sub-range.
    ///
    /// Returns the new capacity if strictly positive, 0 otherwise.
    pub(crate) fn update_read_limit(&self, cons: &ConsumerBlock) -> u64 {
        let old_limit = cons.read_limit.load(Ordering::Relaxed);
        let mut limit = old_limit.wrapping_add(1 << 60);
        let dep_begin = cons.dep_begin as usize;
        let dep_end = cons.dep_end as usize;

        if dep_begin >= dep_end {
            cons.read_limit.store(limit, Ordering::Relaxed);
            return self.mask + 1;
        }

        let mut i = dep_end;
        while i > dep_begin {
            i -= 1;
            let current = &self.cons[i];
            let current_cursor = current.cursor.load(Ordering::Relaxed);

            if (current_cursor.wrapping_sub(limit) as i64) < 0 {
                limit = current_cursor;
            }

            // A parent whose own dependency range covers [begin, i) has
            // already bounded those cursors.
            let skip = if current.dep_end as usize >= i {
                current.dep_begin as usize
            } else {
                i
            };
            if skip < i {
                i = skip;
            }
        }

        let capacity = limit.wrapping_sub(cons.cursor.load(Ordering::Relaxed));
        cons.read_limit.store(limit, Ordering::Relaxed);
        if (capacity as i64) > 0 {
            capacity
        } else {
            0
        }
    }

    /// Approximately how many entries consumer `index` can read before
    /// its limit needs refreshing. Only interesting with dependencies.
    pub fn consume_capacity(&self, index: usize) -> usize {
        let cons = self.consumer(index);
        let cursor = cons.cursor.load(Ordering::Relaxed);
        let limit = cons.read_limit.load(Ordering::Relaxed);

        if (cursor.wrapping_sub(limit) as i64) >= 0 {
            return self.update_read_limit(cons) as usize;
        }

        limit.wrapping_sub(cursor) as usize
    }
}
