//! Disk space allocation for storage units
//!
//! - `partition`: the partition table, one entry per mounted SUMS partition
//! - `reclaim`: delete-pending reclaim that returns space to partitions

pub mod partition;
pub mod reclaim;

use crate::error::Result;

pub use partition::{Partition, PartitionTable};
pub use reclaim::{ReclaimReport, Reclaimer};

/// Space allocator trait
///
/// Hands out byte reservations on named partitions grouped into allocation sets.
pub trait SpaceAllocator {
    /// Reserve `bytes` in allocation set `set`
    ///
    /// Returns the name of the partition holding the reservation.
    fn allocate(&mut self, bytes: f64, set: i32) -> Result<String>;

    /// Return `bytes` to partition `name`
    fn free(&mut self, name: &str, bytes: f64) -> Result<()>;

    /// Bytes still available in allocation set `set`
    fn bytes_left(&self, set: i32) -> f64;
}
