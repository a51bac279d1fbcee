//! Partition table
//!
//! Each partition belongs to one allocation set. An allocation goes to the
//! online partition of the set with the most bytes left. Partitions whose
//! file system runs low are taken offline and come back once enough space
//! has been reclaimed.

use crate::core::allocator::SpaceAllocator;
use crate::core::config::PartitionConfig;
use crate::error::{Result, SumsError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One disk partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Mount point
    pub name: String,

    /// Allocation set
    pub set: i32,

    /// Capacity in bytes
    pub bytes_total: f64,

    /// Bytes not yet reserved
    pub bytes_left: f64,

    /// Whether new allocations may land here
    pub online: bool,

    /// Capacity fixed by configuration rather than read from the file system
    pub fixed: bool,
}

impl Partition {
    /// Fraction of the partition still free
    pub fn free_fraction(&self) -> f64 {
        if self.bytes_total <= 0.0 {
            0.0
        } else {
            self.bytes_left / self.bytes_total
        }
    }
}

/// File system size and available bytes for `path`
pub fn filesystem_bytes(path: &Path) -> Result<(f64, f64)> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SumsError::UnknownPartition(path.display().to_string()))?;
    // SAFETY: statvfs only writes into the zeroed struct we pass it
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let frsize = st.f_frsize as f64;
    Ok((st.f_blocks as f64 * frsize, st.f_bavail as f64 * frsize))
}

/// Partition table for all allocation sets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionTable {
    partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Build a table from configuration
    ///
    /// Partitions without a configured size are sized from their file system.
    pub fn from_config(configs: &[PartitionConfig]) -> Result<Self> {
        let mut partitions = Vec::with_capacity(configs.len());
        for c in configs {
            let (total, left, fixed) = match c.bytes_left {
                Some(bytes) => (bytes, bytes, true),
                None => {
                    let (total, avail) = filesystem_bytes(Path::new(&c.name))?;
                    (total, avail, false)
                }
            };
            partitions.push(Partition {
                name: c.name.clone(),
                set: c.set,
                bytes_total: total,
                bytes_left: left,
                online: true,
                fixed,
            });
        }
        Ok(PartitionTable { partitions })
    }

    /// Reload the table from configuration
    ///
    /// Partitions that stay configured keep their current reservations.
    pub fn avail_request(&mut self, configs: &[PartitionConfig]) -> Result<()> {
        let mut fresh = Self::from_config(configs)?;
        for p in &mut fresh.partitions {
            if let Some(old) = self.get(&p.name) {
                if p.fixed {
                    p.bytes_left = old.bytes_left;
                }
                p.online = old.online;
            }
        }
        tracing::info!("Partition table reloaded: {} partitions", fresh.len());
        *self = fresh;
        Ok(())
    }

    /// Set the bytes left on `name`, returning whether the value changed
    pub fn avail_update(&mut self, name: &str, bytes: f64) -> Result<bool> {
        let p = self.get_mut(name)?;
        if p.bytes_left == bytes {
            return Ok(false);
        }
        tracing::debug!("{}: bytes_left {} -> {}", name, p.bytes_left, bytes);
        p.bytes_left = bytes;
        Ok(true)
    }

    /// Reconcile partitions against their file systems
    ///
    /// A partition below `offline_below` free goes offline; an offline one
    /// at or above `online_above` comes back.
    pub fn sync_filesystem(&mut self, offline_below: f64, online_above: f64) -> Result<()> {
        for p in &mut self.partitions {
            if !p.fixed {
                let (total, avail) = filesystem_bytes(Path::new(&p.name))?;
                p.bytes_total = total;
                p.bytes_left = avail;
            }
            Self::apply_thresholds(p, offline_below, online_above);
        }
        Ok(())
    }

    fn apply_thresholds(p: &mut Partition, offline_below: f64, online_above: f64) {
        let frac = p.free_fraction();
        if p.online && frac < offline_below {
            tracing::warn!("Partition {} is {:.1}% free, taking it offline", p.name, frac * 100.0);
            p.online = false;
        } else if !p.online && frac >= online_above {
            tracing::info!("Partition {} is {:.1}% free, back online", p.name, frac * 100.0);
            p.online = true;
        }
    }

    /// Re-evaluate on/off state without touching the file systems
    pub fn update_online(&mut self, offline_below: f64, online_above: f64) {
        for p in &mut self.partitions {
            Self::apply_thresholds(p, offline_below, online_above);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Partition> {
        self.partitions
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| SumsError::UnknownPartition(name.to_string()))
    }

    /// Take a partition on or offline by hand
    pub fn set_online(&mut self, name: &str, online: bool) -> Result<()> {
        self.get_mut(name)?.online = online;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }

    /// Allocation sets present in the table
    pub fn sets(&self) -> Vec<i32> {
        let mut sets: Vec<i32> = self.partitions.iter().map(|p| p.set).collect();
        sets.sort_unstable();
        sets.dedup();
        sets
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl SpaceAllocator for PartitionTable {
    fn allocate(&mut self, bytes: f64, set: i32) -> Result<String> {
        let best = self
            .partitions
            .iter_mut()
            .filter(|p| p.set == set && p.online && p.bytes_left >= bytes)
            .max_by(|a, b| a.bytes_left.total_cmp(&b.bytes_left));

        match best {
            Some(p) => {
                p.bytes_left -= bytes;
                Ok(p.name.clone())
            }
            None => Err(SumsError::NoSpace { bytes, set }),
        }
    }

    fn free(&mut self, name: &str, bytes: f64) -> Result<()> {
        let p = self.get_mut(name)?;
        p.bytes_left += bytes;
        Ok(())
    }

    fn bytes_left(&self, set: i32) -> f64 {
        self.partitions
            .iter()
            .filter(|p| p.set == set)
            .map(|p| p.bytes_left)
            .sum()
    }
}
