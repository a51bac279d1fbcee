//! Tape library model
//!
//! - `inventory`: parser for the robot's status listing
//! - `robot`: command executors that move tapes (real `mtx` or simulated)
//! - `library`: slot/drive occupancy and movement primitives
//! - `queue`: read/write request queues for the drives

pub mod inventory;
pub mod library;
pub mod queue;
pub mod robot;

use serde::{Deserialize, Serialize};

pub use inventory::{parse_status, StatusDump};
pub use library::{LibrarySnapshot, TapeLibrary, Verification, VerifyAction};
pub use queue::{OfflineCounts, QueueKind, TapeQueue, TqEntry};
pub use robot::{MtxRobot, RobotExecutor, SimulatedRobot};

/// Tape id reported for a cartridge without a readable bar code
pub const NO_BAR: &str = "NoBar";

/// What a drive is doing with its tape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TapeMode {
    #[default]
    NotLoaded,
    /// Loaded, position unknown
    ReadInit,
    /// Positioned after a previous read
    ReadContinue,
}

/// Catalog state of a tape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TapeState {
    Uninit = -1,
    Active = 1,
    Closed = 2,
    ClosedReject = 3,
}

impl TapeState {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            -1 => Some(TapeState::Uninit),
            1 => Some(TapeState::Active),
            2 => Some(TapeState::Closed),
            3 => Some(TapeState::ClosedReject),
            _ => None,
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, TapeState::Closed | TapeState::ClosedReject)
    }
}

/// Tape catalog trait
///
/// Registers tapes seen by an inventory. Returns `None` when the tape
/// cannot be cataloged.
pub trait TapeCatalog {
    fn catalog(&mut self, tape_id: &str) -> Option<TapeState>;
}

/// In-memory catalog; unseen tapes are registered as active
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    tapes: ahash::AHashMap<String, TapeState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&mut self, tape_id: &str, state: TapeState) {
        self.tapes.insert(tape_id.to_string(), state);
    }

    pub fn state(&self, tape_id: &str) -> Option<TapeState> {
        self.tapes.get(tape_id).copied()
    }

    pub fn len(&self) -> usize {
        self.tapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tapes.is_empty()
    }
}

impl TapeCatalog for MemoryCatalog {
    fn catalog(&mut self, tape_id: &str) -> Option<TapeState> {
        Some(
            *self
                .tapes
                .entry(tape_id.to_string())
                .or_insert(TapeState::Active),
        )
    }
}
