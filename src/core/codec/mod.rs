//! Checksum, entropy coding and hyper-slab helpers shared by the TAS container

pub mod adler32;
pub mod ndim;
pub mod rice;

pub use self::adler32::{adler32, Adler32};
pub use rice::{RiceError, RiceSample};
