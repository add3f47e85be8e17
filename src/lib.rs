//! Quiesce - lock-free concurrency primitives
//!
//! A toolkit of fine-grained concurrent engines for shared-memory
//! multiprocessors:
//!
//! - [`epoch`] — epoch-based memory reclamation: readers announce
//!   critical sections, writers defer destructors until a grace period.
//! - [`disruptor`] — a lock-free MPMC ring of generation-tagged cells
//!   with per-consumer cursors, consumer dependency chains, and
//!   snoopers that read without exerting back-pressure.
//! - [`robin_hood`] — an SPMC Robin Hood open-addressed hash set with
//!   backward-shift deletion and per-bucket generation counters that
//!   let readers probe concurrently with one writer.
//! - [`rwlock`] / [`bytelock`] — a writer-preferred reader/writer lock
//!   with a latch mode, and a byte-slotted variant that trades the
//!   shared reader counter for one byte per known reader.
//!
//! Nothing here blocks on the host scheduler: every operation is
//! wait-free, lock-free, or a bounded-contention spin with a pipeline
//! hint per iteration. Ownership of all backing storage lies with the
//! caller; see [`mem`] for the deferred-reclamation contract.

pub mod bytelock;
pub mod constants;
pub mod disruptor;
pub mod epoch;
pub mod error;
pub mod fence;
pub mod mem;
pub mod robin_hood;
pub mod rwlock;

// Re-export main components
pub use bytelock::ByteLock;
pub use disruptor::{Ring, RingConfig, Snooper};
pub use epoch::{Epoch, Record};
pub use error::{QuiesceError, Result};
pub use mem::{DropNow, Reclaimer, Retired};
pub use robin_hood::RobinHoodSet;
pub use rwlock::{RecursiveRwLock, RwLock};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
