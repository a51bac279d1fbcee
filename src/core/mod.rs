//! SUMS engine
//!
//! - [`error`] - Error type for engine operations
//! - [`config`] - TOML configuration
//! - [`codec`] - Adler-32, Rice coding and hyper-slab packing
//! - [`tas`] - Tiled Array Storage container
//! - [`allocator`] - Partition table, space allocation and reclaim
//! - [`unit`] - Storage units and their lifecycle
//! - [`archive`] - Archive-pending batching into tape writes
//! - [`tape`] - Tape library inventory, robot moves and drive queues
//! - [`tagfifo`] - Tagged multi-consumer FIFO
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use sums::core::allocator::PartitionTable;
//! use sums::core::config::PartitionConfig;
//! use sums::core::unit::{ArchiveSubtype, UnitStore};
//!
//! # fn main() -> sums::Result<()> {
//! let table = PartitionTable::from_config(&[PartitionConfig::new("/SUM1", 0, None)])?;
//! let mut store = UnitStore::new(table, 1);
//!
//! let now = chrono::Local::now().naive_local();
//! let su = store.alloc("hmi.lev1", 1_000_000.0, 10, 0, now)?;
//! // ... write files into su.wd ...
//! store.commit(su.sunum, true, 2, ArchiveSubtype::Permanent)?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod archive;
pub mod codec;
pub mod config;
pub mod error;
pub mod tagfifo;
pub mod tape;
pub mod tas;
pub mod unit;
