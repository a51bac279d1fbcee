//! SUMS daemon configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! [library]
//! device = "/dev/sg7"
//! max_slots = 128
//!
//! [archive]
//! tar_file_size = 500000000
//!
//! [reclaim]
//! part_percent_free = 3.0
//!
//! [[partitions]]
//! name = "/SUM1"
//! set = 0
//! ```
//!
//! Every field has a default, so an empty section (or file) is valid.

use crate::error::{Result, SumsError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SumsConfig {
    pub library: LibraryConfig,
    pub archive: ArchiveConfig,
    pub reclaim: ReclaimConfig,
    pub partitions: Vec<PartitionConfig>,
}

/// Tape library and robot settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Robot control device passed to `mtx -f`
    pub device: String,

    /// Path of the `mtx` binary
    pub mtx_path: PathBuf,

    /// Storage slots the library is expected to report
    pub max_slots: usize,

    /// Tape drives
    pub max_drives: usize,

    /// Import/export slots at the top of the slot range
    pub num_imp_exp: usize,

    /// Serve status from `simulated_status_dump` and sleep instead of moving tapes
    pub simulate: bool,

    /// Status dump used in simulation mode
    pub simulated_status_dump: PathBuf,

    /// Seconds a simulated move takes
    pub move_sleep_secs: u64,

    /// Attempts before `verify` gives up
    pub verify_retries: u32,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        LibraryConfig {
            device: "/dev/sg7".to_string(),
            mtx_path: PathBuf::from("/usr/sbin/mtx"),
            max_slots: 128,
            max_drives: 4,
            num_imp_exp: 8,
            simulate: false,
            simulated_status_dump: PathBuf::from("/tmp/t50_status_dump"),
            move_sleep_secs: 2,
            verify_retries: 3,
        }
    }
}

/// Archive batching settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Target bytes per tape file
    pub tar_file_size: u64,

    /// Most storage units in one write request
    pub max_request_units: usize,

    /// Batches submitted by the first pass of a run
    pub initial_chunk: usize,

    /// Skip units whose directory has vanished
    pub skip_missing_dirs: bool,

    /// Seconds to wait for the drive manager to accept a write
    pub submit_timeout_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            tar_file_size: 500_000_000,
            max_request_units: 512,
            initial_chunk: 10,
            skip_missing_dirs: false,
            submit_timeout_secs: 30,
        }
    }
}

/// Byte target for one allocation set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetLimit {
    pub set: i32,
    pub bytes: f64,
}

/// Delete-pending reclaim settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Seconds between reclaim passes
    pub sleep_secs: u64,

    /// Percent of every partition to keep free
    pub part_percent_free: f64,

    /// Log what would be removed without removing it
    pub noop: bool,

    /// First hour of the no-run window
    pub norun_start: u32,

    /// Hour the no-run window ends
    pub norun_stop: u32,

    /// Bytes to keep free per allocation set
    pub max_free: Vec<SetLimit>,

    /// Free fraction below which a partition stops taking allocations
    pub offline_below: f64,

    /// Free fraction at which an offline partition is used again
    pub online_above: f64,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        ReclaimConfig {
            sleep_secs: 300,
            part_percent_free: 3.0,
            noop: false,
            norun_start: 0,
            norun_stop: 0,
            max_free: Vec::new(),
            offline_below: 0.02,
            online_above: 0.05,
        }
    }
}

impl ReclaimConfig {
    /// Bytes to keep free in allocation set `set`
    pub fn max_free_for(&self, set: i32) -> f64 {
        self.max_free
            .iter()
            .find(|l| l.set == set)
            .map(|l| l.bytes)
            .unwrap_or(0.0)
    }

    /// Whether reclaim is suspended at `hour`
    pub fn in_norun_window(&self, hour: u32) -> bool {
        let (start, stop) = (self.norun_start, self.norun_stop);
        if start == stop {
            false
        } else if start < stop {
            hour >= start && hour < stop
        } else {
            hour >= start || hour < stop
        }
    }
}

/// One disk partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Mount point; storage unit directories are created below it
    pub name: String,

    /// Allocation set the partition belongs to
    #[serde(default)]
    pub set: i32,

    /// Fixed capacity, otherwise taken from the file system
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_left: Option<f64>,
}

impl PartitionConfig {
    pub fn new(name: impl Into<String>, set: i32, bytes_left: Option<f64>) -> Self {
        PartitionConfig {
            name: name.into(),
            set,
            bytes_left,
        }
    }
}

impl SumsConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: SumsConfig =
            toml::from_str(s).map_err(|e| SumsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&text)
    }

    /// Configuration for a simulated library with the given partitions
    pub fn simulated(status_dump: PathBuf, partitions: Vec<PartitionConfig>) -> Self {
        SumsConfig {
            library: LibraryConfig {
                simulate: true,
                simulated_status_dump: status_dump,
                move_sleep_secs: 0,
                ..Default::default()
            },
            partitions,
            ..Default::default()
        }
    }

    /// Check values that would make the daemon misbehave
    pub fn validate(&self) -> Result<()> {
        if self.archive.max_request_units == 0 {
            return Err(SumsError::Config(
                "archive.max_request_units must be positive".into(),
            ));
        }
        if self.archive.tar_file_size == 0 {
            return Err(SumsError::Config(
                "archive.tar_file_size must be positive".into(),
            ));
        }
        if !(0.0..100.0).contains(&self.reclaim.part_percent_free) {
            return Err(SumsError::Config(format!(
                "reclaim.part_percent_free out of range: {}",
                self.reclaim.part_percent_free
            )));
        }
        if !(0.0..=1.0).contains(&self.reclaim.offline_below)
            || !(0.0..=1.0).contains(&self.reclaim.online_above)
            || self.reclaim.offline_below > self.reclaim.online_above
        {
            return Err(SumsError::Config(
                "reclaim partition thresholds must satisfy 0 <= offline_below <= online_above <= 1"
                    .into(),
            ));
        }
        if self.reclaim.norun_start > 23 || self.reclaim.norun_stop > 23 {
            return Err(SumsError::Config("reclaim no-run hours must be 0-23".into()));
        }
        if self.library.num_imp_exp > self.library.max_slots {
            return Err(SumsError::Config(
                "library.num_imp_exp exceeds library.max_slots".into(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for p in &self.partitions {
            if p.name.is_empty() {
                return Err(SumsError::Config("partition with empty name".into()));
            }
            if !names.insert(p.name.as_str()) {
                return Err(SumsError::Config(format!("duplicate partition {}", p.name)));
            }
        }
        Ok(())
    }
}
