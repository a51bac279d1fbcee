//! Storage units and the allocator state that owns them
//!
//! A storage unit (SU) is one directory on a SUMS partition, identified by a
//! sunum. Its life:
//!
//! ```text
//! alloc -> ReadWrite -> commit(archive) -> ArchivePending -> written to tape
//!                    \-> commit(no archive) ----------------> DeletePending
//! DeletePending -> reclaim -> Archived (tape copy only) or gone
//! ```
//!
//! All mutation goes through [`UnitStore`], which callers serialize behind
//! a single lock.

use crate::core::allocator::{PartitionTable, SpaceAllocator};
use crate::core::tape::queue::OfflineCounts;
use crate::error::{Result, SumsError};
use ahash::{AHashMap, AHashSet};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage unit number
pub type Sunum = u64;

/// Storage unit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SuStatus {
    /// Allocated and being written by its owner
    ReadWrite,
    /// Committed, waiting for a tape copy
    ArchivePending,
    /// Disk copy may be reclaimed once its effective date passes
    DeletePending,
    /// Only the tape copy remains
    Archived,
}

impl std::fmt::Display for SuStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SuStatus::ReadWrite => "DARW",
            SuStatus::ArchivePending => "DAAP",
            SuStatus::DeletePending => "DADP",
            SuStatus::Archived => "DAAR",
        };
        f.write_str(name)
    }
}

/// What happens to a unit's disk copy around archiving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveSubtype {
    /// Disk copy reclaimable as soon as the tape copy exists
    Temporary,
    /// Disk copy kept until its effective date after archiving
    Permanent,
    /// Never archived; goes straight to delete-pending
    DoNotArchive,
}

/// Reclaim date, `yyyymmddhhmm` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EffectiveDate(pub NaiveDateTime);

impl EffectiveDate {
    const FORMAT: &'static str = "%Y%m%d%H%M";

    /// Parse `yyyymmddhhmm`; a bare `yyyymmdd` means midnight.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let full = if s.len() == 8 {
            format!("{}0000", s)
        } else {
            s.to_string()
        };
        NaiveDateTime::parse_from_str(&full, Self::FORMAT)
            .map(EffectiveDate)
            .map_err(|e| SumsError::InvalidRequest(format!("bad effective date {:?}: {}", s, e)))
    }

    /// Date `days` after `now`
    pub fn from_lifetime_days(now: NaiveDateTime, days: i64) -> Self {
        EffectiveDate(now + Duration::days(days))
    }

    pub fn is_after(&self, now: NaiveDateTime) -> bool {
        self.0 > now
    }
}

impl std::fmt::Display for EffectiveDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format(Self::FORMAT))
    }
}

/// Where the tape copy of a unit lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeLocation {
    pub tape_id: String,
    pub file_number: i32,
}

/// One storage unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageUnit {
    pub sunum: Sunum,
    pub series: String,
    /// Working directory
    pub wd: PathBuf,
    /// Partition holding `wd`
    pub partition: String,
    /// Allocation set the unit was allocated from
    pub set: i32,
    pub bytes: f64,
    pub status: SuStatus,
    pub archive_subtype: ArchiveSubtype,
    /// Archive group; units of one group share tape files
    pub group_id: i32,
    pub effective_date: EffectiveDate,
    /// Whether `wd` currently holds the data
    pub online: bool,
    pub tape: Option<TapeLocation>,
}

/// List entry for archive-pending and delete-pending lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUnit {
    pub wd: PathBuf,
    pub sunum: Sunum,
    pub bytes: f64,
    pub status: SuStatus,
    pub archive_subtype: ArchiveSubtype,
    pub effective_date: EffectiveDate,
    pub group_id: i32,
}

impl From<&StorageUnit> for PendingUnit {
    fn from(su: &StorageUnit) -> Self {
        PendingUnit {
            wd: su.wd.clone(),
            sunum: su.sunum,
            bytes: su.bytes,
            status: su.status,
            archive_subtype: su.archive_subtype,
            effective_date: su.effective_date,
            group_id: su.group_id,
        }
    }
}

/// Ordered list of pending units keyed by `(wd, sunum)`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitList {
    entries: Vec<PendingUnit>,
}

impl UnitList {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, wd: &Path, sunum: Sunum) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.sunum == sunum && e.wd == wd)
    }

    /// Add at the front; returns false when `(wd, sunum)` is already listed
    pub fn insert(&mut self, entry: PendingUnit) -> bool {
        if self.position(&entry.wd, entry.sunum).is_some() {
            return false;
        }
        self.entries.insert(0, entry);
        true
    }

    /// Add at the back, keeping call order
    pub fn push_back(&mut self, entry: PendingUnit) -> bool {
        if self.position(&entry.wd, entry.sunum).is_some() {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Add in ascending sunum order
    pub fn insert_sorted_by_id(&mut self, entry: PendingUnit) -> bool {
        if self.position(&entry.wd, entry.sunum).is_some() {
            return false;
        }
        let at = self.entries.partition_point(|e| e.sunum <= entry.sunum);
        self.entries.insert(at, entry);
        true
    }

    /// Add in descending group order, ascending sunum within a group
    pub fn insert_by_group(&mut self, entry: PendingUnit) -> bool {
        if self.position(&entry.wd, entry.sunum).is_some() {
            return false;
        }
        let at = self.entries.partition_point(|e| {
            e.group_id > entry.group_id || (e.group_id == entry.group_id && e.sunum <= entry.sunum)
        });
        self.entries.insert(at, entry);
        true
    }

    pub fn get(&self, wd: &Path, sunum: Sunum) -> Option<&PendingUnit> {
        self.position(wd, sunum).map(|i| &self.entries[i])
    }

    /// All entries for working directory `wd`
    pub fn get_by_wd<'a>(&'a self, wd: &'a Path) -> impl Iterator<Item = &'a PendingUnit> + 'a {
        self.entries.iter().filter(move |e| e.wd == wd)
    }

    pub fn get_by_sunum(&self, sunum: Sunum) -> Option<&PendingUnit> {
        self.entries.iter().find(|e| e.sunum == sunum)
    }

    pub fn remove(&mut self, wd: &Path, sunum: Sunum) -> Option<PendingUnit> {
        self.position(wd, sunum).map(|i| self.entries.remove(i))
    }

    pub fn remove_sunum(&mut self, sunum: Sunum) -> Option<PendingUnit> {
        let i = self.entries.iter().position(|e| e.sunum == sunum)?;
        Some(self.entries.remove(i))
    }

    pub fn update_effective_date(&mut self, wd: &Path, sunum: Sunum, date: EffectiveDate) -> bool {
        match self.position(wd, sunum) {
            Some(i) => {
                self.entries[i].effective_date = date;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingUnit> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of asking for a unit to be online
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitAvailability {
    /// Data is in `wd` now
    Online(StorageUnit),
    /// A retrieval directory was allocated; the tape read is still to come
    Retrieving(StorageUnit),
    /// Only on tape and retrieval was not requested
    Offline(StorageUnit),
}

impl UnitAvailability {
    pub fn unit(&self) -> &StorageUnit {
        match self {
            UnitAvailability::Online(su)
            | UnitAvailability::Retrieving(su)
            | UnitAvailability::Offline(su) => su,
        }
    }
}

/// Storage unit state owned by the allocator
#[derive(Debug)]
pub struct UnitStore {
    partitions: PartitionTable,
    units: AHashMap<Sunum, StorageUnit>,
    next_sunum: Sunum,
    archive_pending: UnitList,
    delete_pending: UnitList,
    /// Sessions holding a unit read-only
    held: AHashMap<Sunum, AHashSet<u64>>,
    /// Units with a retrieval directory waiting for a tape read
    retrieving: AHashSet<Sunum>,
    offline: OfflineCounts,
    /// Days a retrieved unit stays online
    retrieve_lifetime_days: i64,
}

impl UnitStore {
    /// Create a store over `partitions`, numbering units from `first_sunum`
    pub fn new(partitions: PartitionTable, first_sunum: Sunum) -> Self {
        UnitStore {
            partitions,
            units: AHashMap::new(),
            next_sunum: first_sunum,
            archive_pending: UnitList::new(),
            delete_pending: UnitList::new(),
            held: AHashMap::new(),
            retrieving: AHashSet::new(),
            offline: OfflineCounts::default(),
            retrieve_lifetime_days: 3,
        }
    }

    pub fn partitions(&self) -> &PartitionTable {
        &self.partitions
    }

    pub fn partitions_mut(&mut self) -> &mut PartitionTable {
        &mut self.partitions
    }

    pub fn archive_pending(&self) -> &UnitList {
        &self.archive_pending
    }

    pub fn delete_pending(&self) -> &UnitList {
        &self.delete_pending
    }

    fn unit_mut(&mut self, sunum: Sunum) -> Result<&mut StorageUnit> {
        self.units
            .get_mut(&sunum)
            .ok_or(SumsError::UnknownUnit(sunum))
    }

    fn check_status(su: &StorageUnit, expected: SuStatus, to: SuStatus) -> Result<()> {
        if su.status != expected {
            return Err(SumsError::InvalidState {
                sunum: su.sunum,
                from: su.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    fn undo_alloc(&mut self, su: &StorageUnit) {
        if let Err(e) = self.partitions.free(&su.partition, su.bytes) {
            tracing::warn!(sunum = su.sunum, "Failed to return space of undone unit: {}", e);
        }
        if let Err(e) = remove_tree(&su.wd) {
            tracing::warn!(sunum = su.sunum, "Failed to remove {}: {}", su.wd.display(), e);
        }
        self.units.remove(&su.sunum);
    }

    /// Return space after a failed directory creation
    fn give_back(&mut self, partition: &str, bytes: f64) {
        if let Err(e) = self.partitions.free(partition, bytes) {
            tracing::warn!(partition, bytes, "Failed to return space: {}", e);
        }
    }

    /// Allocate `n` units of `bytes` each for `series`
    ///
    /// Either all `n` units are allocated or none are.
    pub fn new_slots(
        &mut self,
        n: usize,
        series: &str,
        bytes: f64,
        lifetime_days: i64,
        set: i32,
        now: NaiveDateTime,
    ) -> Result<Vec<StorageUnit>> {
        if n == 0 {
            return Err(SumsError::InvalidRequest("allocation of zero units".into()));
        }
        if bytes.is_nan() || bytes < 0.0 {
            return Err(SumsError::InvalidRequest(format!("bad unit size {}", bytes)));
        }

        let mut made: Vec<StorageUnit> = Vec::with_capacity(n);
        for _ in 0..n {
            match self.alloc_one(series, bytes, lifetime_days, set, now) {
                Ok(su) => made.push(su),
                Err(e) => {
                    for su in &made {
                        self.undo_alloc(su);
                    }
                    return Err(e);
                }
            }
        }
        Ok(made)
    }

    fn alloc_one(
        &mut self,
        series: &str,
        bytes: f64,
        lifetime_days: i64,
        set: i32,
        now: NaiveDateTime,
    ) -> Result<StorageUnit> {
        let partition = self.partitions.allocate(bytes, set)?;
        let sunum = self.next_sunum;
        let wd = Path::new(&partition).join(format!("D{}", sunum));
        if let Err(e) = std::fs::create_dir_all(&wd) {
            self.give_back(&partition, bytes);
            return Err(e.into());
        }
        self.next_sunum += 1;

        let su = StorageUnit {
            sunum,
            series: series.to_string(),
            wd,
            partition,
            set,
            bytes,
            status: SuStatus::ReadWrite,
            archive_subtype: ArchiveSubtype::Permanent,
            group_id: 0,
            effective_date: EffectiveDate::from_lifetime_days(now, lifetime_days),
            online: true,
            tape: None,
        };
        tracing::debug!(sunum, wd = %su.wd.display(), bytes, "Allocated storage unit");
        self.units.insert(sunum, su.clone());
        Ok(su)
    }

    /// Allocate a single unit
    pub fn alloc(
        &mut self,
        series: &str,
        bytes: f64,
        lifetime_days: i64,
        set: i32,
        now: NaiveDateTime,
    ) -> Result<StorageUnit> {
        let mut units = self.new_slots(1, series, bytes, lifetime_days, set, now)?;
        units
            .pop()
            .ok_or_else(|| SumsError::InvalidRequest("empty allocation".into()))
    }

    /// Close a read-write unit for writing
    ///
    /// With `archive` the unit joins the archive-pending list of `group_id`,
    /// otherwise it goes straight to delete-pending.
    pub fn commit(
        &mut self,
        sunum: Sunum,
        archive: bool,
        group_id: i32,
        subtype: ArchiveSubtype,
    ) -> Result<()> {
        let su = self.unit_mut(sunum)?;
        // Do-not-archive units still pass through archive-pending; batching
        // moves them on to delete-pending
        let to = if archive {
            SuStatus::ArchivePending
        } else {
            SuStatus::DeletePending
        };
        Self::check_status(su, SuStatus::ReadWrite, to)?;
        su.status = to;
        su.group_id = group_id;
        su.archive_subtype = subtype;
        let entry = PendingUnit::from(&*su);

        if to == SuStatus::ArchivePending {
            self.archive_pending.insert_by_group(entry);
        } else {
            self.delete_pending.insert_sorted_by_id(entry);
        }
        tracing::debug!(sunum, group = group_id, status = %to, "Committed storage unit");
        Ok(())
    }

    /// Move a unit to delete-pending with reclaim date `date`
    pub fn mark_delete_pending(&mut self, sunum: Sunum, date: EffectiveDate) -> Result<()> {
        let su = self.unit_mut(sunum)?;
        if su.status == SuStatus::Archived {
            return Err(SumsError::InvalidState {
                sunum,
                from: su.status.to_string(),
                to: SuStatus::DeletePending.to_string(),
            });
        }
        su.status = SuStatus::DeletePending;
        su.effective_date = date;
        let entry = PendingUnit::from(&*su);
        self.archive_pending.remove_sunum(sunum);
        if !self.delete_pending.update_effective_date(&entry.wd, sunum, date) {
            self.delete_pending.insert_sorted_by_id(entry);
        }
        Ok(())
    }

    /// Mark every online unit of `series` for deletion now
    pub fn delete_series(&mut self, series: &str, now: NaiveDateTime) -> Result<usize> {
        let mut sunums: Vec<Sunum> = self
            .units
            .values()
            .filter(|su| su.series == series && su.online && su.status != SuStatus::DeletePending)
            .map(|su| su.sunum)
            .collect();
        sunums.sort_unstable();
        for &sunum in &sunums {
            self.mark_delete_pending(sunum, EffectiveDate(now))?;
        }
        tracing::info!("Series {} marked for deletion: {} units", series, sunums.len());
        Ok(sunums.len())
    }

    /// Remove a unit and its directory, returning its space
    pub fn free(&mut self, sunum: Sunum) -> Result<StorageUnit> {
        let su = self
            .units
            .remove(&sunum)
            .ok_or(SumsError::UnknownUnit(sunum))?;
        self.archive_pending.remove_sunum(sunum);
        self.delete_pending.remove_sunum(sunum);
        self.held.remove(&sunum);
        // A unit being retrieved holds space for its retrieval directory
        let retrieving = self.retrieving.remove(&sunum);
        if su.online || retrieving {
            self.partitions.free(&su.partition, su.bytes)?;
            remove_tree(&su.wd)?;
        }
        Ok(su)
    }

    pub fn info(&self, sunum: Sunum) -> Result<StorageUnit> {
        self.units
            .get(&sunum)
            .cloned()
            .ok_or(SumsError::UnknownUnit(sunum))
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Look up units, allocating retrieval directories for offline ones
    /// when `retrieve` is set
    pub fn request_units(
        &mut self,
        sunums: &[Sunum],
        retrieve: bool,
    ) -> Result<Vec<UnitAvailability>> {
        let mut out = Vec::with_capacity(sunums.len());
        for &sunum in sunums {
            let su = self.info(sunum)?;
            if su.online {
                out.push(UnitAvailability::Online(su));
                continue;
            }
            if self.retrieving.contains(&sunum) {
                out.push(UnitAvailability::Retrieving(su));
                continue;
            }
            if !retrieve || su.tape.is_none() {
                out.push(UnitAvailability::Offline(su));
                continue;
            }

            let partition = self.partitions.allocate(su.bytes, su.set)?;
            let wd = Path::new(&partition).join(format!("D{}", sunum));
            if let Err(e) = std::fs::create_dir_all(&wd) {
                self.give_back(&partition, su.bytes);
                return Err(e.into());
            }
            let unit = self.unit_mut(sunum)?;
            unit.partition = partition;
            unit.wd = wd;
            out.push(UnitAvailability::Retrieving(unit.clone()));
            self.retrieving.insert(sunum);
        }
        Ok(out)
    }

    /// A tape read filled a retrieval directory
    pub fn retrieve_complete(&mut self, sunum: Sunum, now: NaiveDateTime) -> Result<()> {
        let days = self.retrieve_lifetime_days;
        self.retrieving.remove(&sunum);
        let su = self.unit_mut(sunum)?;
        Self::check_status(su, SuStatus::Archived, SuStatus::DeletePending)?;
        su.online = true;
        su.status = SuStatus::DeletePending;
        su.effective_date = EffectiveDate::from_lifetime_days(now, days);
        let entry = PendingUnit::from(&*su);
        self.delete_pending.insert_sorted_by_id(entry);
        Ok(())
    }

    /// A tape read failed; give back the retrieval directory
    pub fn retrieve_failed(&mut self, sunum: Sunum) -> Result<()> {
        let su = self.info(sunum)?;
        if su.online || !self.retrieving.remove(&sunum) {
            return Ok(());
        }
        self.partitions.free(&su.partition, su.bytes)?;
        remove_tree(&su.wd)
    }

    /// A tape copy of archive-pending units was written
    ///
    /// Units freed or moved on while the write was in flight are skipped.
    /// Returns how many units took the tape location.
    pub fn archive_complete(
        &mut self,
        sunums: &[Sunum],
        tape_id: &str,
        file_number: i32,
        now: NaiveDateTime,
    ) -> usize {
        let mut settled = 0;
        for &sunum in sunums {
            let Some(su) = self.units.get_mut(&sunum) else {
                tracing::warn!(sunum, tape_id, "Archived unit no longer exists");
                continue;
            };
            if su.status != SuStatus::ArchivePending {
                tracing::warn!(
                    sunum,
                    tape_id,
                    status = %su.status,
                    "Archived unit is no longer archive-pending"
                );
                continue;
            }
            su.tape = Some(TapeLocation {
                tape_id: tape_id.to_string(),
                file_number,
            });
            su.status = SuStatus::DeletePending;
            if su.archive_subtype == ArchiveSubtype::Temporary {
                su.effective_date = EffectiveDate(now);
            }
            let entry = PendingUnit::from(&*su);
            self.archive_pending.remove_sunum(sunum);
            self.delete_pending.insert_sorted_by_id(entry);
            settled += 1;
        }
        tracing::info!(
            tape_id,
            file_number,
            "Archived {} of {} storage units",
            settled,
            sunums.len()
        );
        settled
    }

    /// Reclaim the disk copy of a delete-pending unit
    ///
    /// Units with a tape copy become `Archived`; the rest are forgotten.
    /// Returns the bytes given back to the partition.
    pub fn reclaim(&mut self, sunum: Sunum) -> Result<f64> {
        let su = self.info(sunum)?;
        Self::check_status(&su, SuStatus::DeletePending, SuStatus::Archived)?;
        self.delete_pending.remove_sunum(sunum);

        if su.tape.is_none() {
            self.free(sunum)?;
            return Ok(su.bytes);
        }
        self.partitions.free(&su.partition, su.bytes)?;
        remove_tree(&su.wd)?;
        let unit = self.unit_mut(sunum)?;
        unit.status = SuStatus::Archived;
        unit.online = false;
        Ok(su.bytes)
    }

    /// Session `uid` opened `sunum` for reading
    pub fn hold(&mut self, uid: u64, sunum: Sunum) -> Result<()> {
        if !self.units.contains_key(&sunum) {
            return Err(SumsError::UnknownUnit(sunum));
        }
        self.held.entry(sunum).or_default().insert(uid);
        Ok(())
    }

    /// Drop every hold of session `uid`
    pub fn release(&mut self, uid: u64) {
        self.held.retain(|_, uids| {
            uids.remove(&uid);
            !uids.is_empty()
        });
        self.offline.remove(uid);
    }

    pub fn is_held(&self, sunum: Sunum) -> bool {
        self.held.contains_key(&sunum)
    }

    /// Per-session count of units waiting for tape
    pub fn offline_counts(&mut self) -> &mut OfflineCounts {
        &mut self.offline
    }
}

fn remove_tree(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
