//! Priority-aware synchronization primitives for asynchronous contexts.

#![no_std]
#![deny(missing_docs)]

pub mod channel;
pub mod semaphore;

pub use portable_atomic;
pub use roost_common::wait_queue::Priority;

#[cfg(feature = "defmt-03")]
pub(crate) use defmt_03 as defmt;

#[cfg(test)]
#[macro_use]
extern crate std;
