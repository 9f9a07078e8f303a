//! Support code for the demo binaries: the slot pool the permit demo reads
//! from, and the stdin pump that stands in for a receive interrupt on the
//! host.

pub mod pool;
pub mod trigger;
