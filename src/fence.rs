//! Memory fences and spin hints shared by all engines
//!
//! The engines express their ordering requirements through this module
//! rather than scattering raw `Ordering` arguments. Each function names
//! the serialization it provides; the mapping to `std::sync::atomic`
//! orderings is stronger than the per-architecture minimum the
//! algorithms need, which is always permitted.
//!
//! | Function        | Serializes                         | Mapping  |
//! |-----------------|------------------------------------|----------|
//! | `load`          | load → load                        | Acquire  |
//! | `store`         | store → store                      | Release  |
//! | `load_store`    | load → store                       | AcqRel   |
//! | `store_load`    | store → load                       | SeqCst   |
//! | `atomic_load`   | atomic RMW → load                  | SeqCst   |
//! | `acquire`       | acquire barrier                    | Acquire  |
//! | `release`       | release barrier                    | Release  |
//! | `memory`        | full barrier                       | SeqCst   |

use std::sync::atomic::{fence, Ordering};

/// Pipeline hint for spin loops
#[inline(always)]
pub fn pause() {
    std::hint::spin_loop();
}

/// Order prior loads before subsequent loads
#[inline(always)]
pub fn load() {
    fence(Ordering::Acquire);
}

/// Order prior stores before subsequent stores
#[inline(always)]
pub fn store() {
    fence(Ordering::Release);
}

/// Order prior loads before subsequent stores
#[inline(always)]
pub fn load_store() {
    fence(Ordering::AcqRel);
}

/// Order prior stores before subsequent loads
///
/// The expensive one: the only fence that a release/acquire pair cannot
/// express. Used where a thread publishes a flag and must then observe
/// other threads' published flags (epoch begin, byte lock announce).
#[inline(always)]
pub fn store_load() {
    fence(Ordering::SeqCst);
}

/// Order a prior atomic read-modify-write before subsequent loads
#[inline(always)]
pub fn atomic_load() {
    fence(Ordering::SeqCst);
}

/// Acquire barrier
#[inline(always)]
pub fn acquire() {
    fence(Ordering::Acquire);
}

/// Release barrier
#[inline(always)]
pub fn release() {
    fence(Ordering::Release);
}

/// Full memory barrier
#[inline(always)]
pub fn memory() {
    fence(Ordering::SeqCst);
}
