use crate::core::codec::rice::RiceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SumsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad magic string in TAS file")]
    BadMagic,

    #[error("Unsupported TAS version: {0}")]
    UnsupportedVersion(i32),

    #[error("Naxis ({naxis}) exceeds maximum rank ({max})")]
    InvalidRank { naxis: usize, max: usize },

    #[error("Bad block size: blksz[{axis}]={blksz}, axis[{axis}]={len}")]
    InvalidBlockSize { axis: usize, blksz: i64, len: i64 },

    #[error("Bad axis size: axis[{axis}]={len}")]
    InvalidAxis { axis: usize, len: i64 },

    #[error("Empty slice: start[{axis}]={start} > end[{axis}]={end}")]
    EmptySlice { axis: usize, start: usize, end: usize },

    #[error("Slice exceeds array bounds: start[{axis}]={start}, end[{axis}]={end}, axis[{axis}]={len}")]
    SliceOutOfBounds {
        axis: usize,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("Slice does not correspond to whole tiles: start[{axis}]={start}, end[{axis}]={end}, blksz[{axis}]={blksz}")]
    MisalignedSlice {
        axis: usize,
        start: usize,
        end: usize,
        blksz: usize,
    },

    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Checksum error in data block {block}: expected {expected:#010x}, found {found:#010x}")]
    ChecksumMismatch { block: usize, expected: u32, found: u32 },

    #[error("Block at offset {offset} with length {length} runs past end of file ({file_len} bytes)")]
    BlockOutOfBounds { offset: u64, length: u64, file_len: u64 },

    #[error("Invalid element type: {0}")]
    InvalidType(i32),

    #[error("Unknown compression method: {0}")]
    InvalidCompression(i32),

    #[error("Compression method {method} cannot store element type {element_type}")]
    UnsupportedCodec { method: String, element_type: String },

    #[error("Rice codec error: {0}")]
    Rice(#[from] RiceError),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Invalid axis permutation")]
    InvalidPermutation,

    #[error("No partition in set {set} can hold {bytes} bytes")]
    NoSpace { bytes: f64, set: i32 },

    #[error("Unknown storage unit: {0}")]
    UnknownUnit(u64),

    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage unit {sunum} cannot move from {from} to {to}")]
    InvalidState { sunum: u64, from: String, to: String },

    #[error("Robot command '{command}' failed with status {status}")]
    RobotCommand { command: String, status: i32 },

    #[error("Inventory failed: {0}")]
    Inventory(String),

    #[error("Inventory returned wrong number of slots: expected {expected}, found {found}")]
    SlotCountMismatch { expected: usize, found: usize },

    #[error("Tape not found: {0}")]
    TapeNotFound(String),

    #[error("No free drive available")]
    NoFreeDrive,

    #[error("No free slot available")]
    NoFreeSlot,

    #[error("No open tape in group {0}")]
    NoTapeInGroup(i32),

    #[error("Tape service offline")]
    ServiceOffline,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SumsError>;
