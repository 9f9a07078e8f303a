//! Building blocks shared by the roost synchronization crates.

#![no_std]
#![deny(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod dropper;
pub mod list;
pub mod unsafecell;
pub mod wait_queue;
