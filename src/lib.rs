//! # SUMS - Storage Unit Management System
//!
//! `sums-rs` manages the disk and tape life of storage units: directories
//! on a set of partitions that are allocated, filled, committed, batched
//! into tape files, reclaimed and brought back online on request.
//!
//! - **Allocation** of storage units across partition sets, with reclaim of
//!   delete-pending units when partitions run short
//! - **Archive batching** of committed units into tar-file-sized tape writes
//! - **Tape library** inventory, robot moves and drive request queues
//! - **TAS**: tiled, compressed, checksummed N-dimensional arrays with
//!   random slice access
//! - **Async service** dispatching client requests over the engine
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sums::tas::{self, Array, Compression, ElementType, Scaling};
//!
//! # fn main() -> sums::Result<()> {
//! let values: Vec<i16> = (0..64 * 64).map(|i| (i % 512) as i16).collect();
//! let array = Array::from_values(vec![64, 64], &values)?;
//!
//! tas::write("image.tas", ElementType::Short, Scaling::identity(), Compression::Rice, None, &array)?;
//! let back = tas::read("image.tas", ElementType::Short, Scaling::identity())?;
//! assert_eq!(back.to_vec::<i16>()?, values);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod service;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::error;

pub use crate::core::{
    allocator, archive, codec, config, tagfifo, tape, tas, unit,
    error::{Result, SumsError},
};
pub use crate::core::config::SumsConfig;
pub use crate::core::unit::{StorageUnit, Sunum, UnitStore};
