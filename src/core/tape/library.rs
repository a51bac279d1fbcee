//! Slot and drive occupancy of one tape library
//!
//! Slots are numbered from 0 internally and from 1 towards the robot. The
//! last `num_imp_exp` slots are import/export slots and are never used to
//! park tapes.

use crate::core::config::LibraryConfig;
use crate::core::tape::inventory::{parse_status, StatusDump};
use crate::core::tape::robot::RobotExecutor;
use crate::core::tape::{TapeCatalog, TapeMode};
use crate::error::{Result, SumsError};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// One tape drive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub tape_id: Option<String>,
    /// Storage unit being read or written
    pub sunum: u64,
    pub busy: bool,
    pub mode: TapeMode,
    /// Current file position; -1 forces repositioning
    pub file_number: i32,
    pub block_number: i32,
    /// Slot the loaded tape returns to
    pub home_slot: Option<usize>,
}

impl Drive {
    fn clear(&mut self) {
        *self = Drive::default();
    }
}

/// One storage slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub tape_id: Option<String>,
}

/// Movement whose outcome [`TapeLibrary::verify`] checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyAction {
    /// Slot to drive
    Load { slot: usize, drive: usize },
    /// Drive to slot
    Unload { drive: usize, slot: usize },
    /// Slot to slot
    Transfer { from: usize, to: usize },
}

/// Outcome of [`TapeLibrary::verify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Mismatch,
    /// Status could not be read
    Unknown,
}

/// Serializable occupancy report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibrarySnapshot {
    pub drives: Vec<DriveSnapshot>,
    pub slots: Vec<SlotSnapshot>,
    pub empty_slots: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveSnapshot {
    pub drive: usize,
    pub tape_id: Option<String>,
    /// Home slot, numbered from 1
    pub home_slot: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    /// Slot number, from 1
    pub slot: usize,
    pub tape_id: Option<String>,
    pub import_export: bool,
}

/// Tape library state and the robot that moves its tapes
pub struct TapeLibrary {
    config: LibraryConfig,
    robot: Box<dyn RobotExecutor>,
    drives: Vec<Drive>,
    slots: Vec<Slot>,
    empty_slots: usize,
}

impl std::fmt::Debug for TapeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapeLibrary")
            .field("drives", &self.drives)
            .field("slots", &self.slots.len())
            .field("empty_slots", &self.empty_slots)
            .finish()
    }
}

impl TapeLibrary {
    pub fn new(config: LibraryConfig, robot: Box<dyn RobotExecutor>) -> Self {
        let drives = vec![Drive::default(); config.max_drives];
        let slots = vec![Slot::default(); config.max_slots];
        TapeLibrary {
            config,
            robot,
            drives,
            slots,
            empty_slots: 0,
        }
    }

    /// Slots that may hold parked tapes
    fn live_slots(&self) -> usize {
        self.config.max_slots - self.config.num_imp_exp
    }

    fn read_status(&mut self) -> Result<StatusDump> {
        tracing::info!("*Inv: {} -f {} status", self.config.mtx_path.display(), self.config.device);
        let text = self.robot.status().map_err(|e| {
            tracing::error!("***Inv: failure");
            e
        })?;
        tracing::info!("***Inv: success");
        Ok(parse_status(&text))
    }

    /// Rebuild drive and slot tables from the robot's status
    ///
    /// Tapes found in drives get the next empty slots as their home slots.
    /// With a catalog every tape seen is registered; tapes already closed are
    /// logged after the end-of-inventory line.
    pub fn inventory(&mut self, mut catalog: Option<&mut dyn TapeCatalog>) -> Result<()> {
        let dump = self.read_status()?;
        if let Some(changer) = &dump.changer {
            if changer.slots != dump.slots.len() || changer.drives != dump.drives.len() {
                tracing::warn!(
                    "Changer announced {} drives, {} slots; listed {} drives, {} slots",
                    changer.drives,
                    changer.slots,
                    dump.drives.len(),
                    dump.slots.len()
                );
            }
        }
        if dump.slots.len() > self.config.max_slots {
            tracing::error!(
                "**Fatal error: there are more slots then MAX_SLOTS={}",
                self.config.max_slots
            );
            return Err(SumsError::Inventory(format!(
                "{} slots listed, at most {} configured",
                dump.slots.len(),
                self.config.max_slots
            )));
        }
        if dump.drives.len() > self.config.max_drives {
            tracing::warn!(
                "**Warning: there are more drives then MAX_DRIVES ({})",
                self.config.max_drives
            );
        }

        let mut closed = Vec::new();
        let mut register = |tape: &str, closed: &mut Vec<String>| {
            if let Some(catalog) = catalog.as_deref_mut() {
                match catalog.catalog(tape) {
                    None => tracing::error!("***ERROR: Can't catalog new tapeid = {}", tape),
                    Some(state) if state.is_closed() => closed.push(tape.to_string()),
                    Some(_) => {}
                }
            }
        };

        let mut full_drives = Vec::new();
        for (d, tape) in dump.drives.iter().enumerate().take(self.config.max_drives) {
            let drive = &mut self.drives[d];
            drive.clear();
            if let Some(tape) = tape {
                drive.tape_id = Some(tape.clone());
                full_drives.push(d);
                register(tape, &mut closed);
            }
            tracing::info!("tapeid in drive {} = {:?}", d, drive.tape_id);
        }
        for d in dump.drives.len()..self.config.max_drives {
            self.drives[d].clear();
        }

        self.empty_slots = 0;
        let mut waiting = full_drives.into_iter();
        for (s, line) in dump.slots.iter().enumerate() {
            self.slots[s].tape_id = line.tape_id.clone();
            match &line.tape_id {
                Some(tape) => register(tape, &mut closed),
                None => {
                    if let Some(d) = waiting.next() {
                        self.drives[d].home_slot = Some(s);
                        tracing::info!("Slot {} assigned to drive #{}", s + 1, d);
                    }
                    self.empty_slots += 1;
                }
            }
        }
        for slot in self.slots.iter_mut().skip(dump.slots.len()) {
            slot.tape_id = None;
        }

        tracing::info!("***ENDInv: slots={}", dump.slots.len());
        if dump.slots.len() != self.config.max_slots {
            tracing::warn!("Inv returned wrong # of slots. Retry.");
            return Err(SumsError::SlotCountMismatch {
                expected: self.config.max_slots,
                found: dump.slots.len(),
            });
        }
        for tape in closed {
            tracing::info!("*Tp:ReClose: tapeid={}", tape);
        }
        Ok(())
    }

    /// [`inventory`](Self::inventory), retried while the slot count is wrong
    pub fn inventory_with_retry(
        &mut self,
        mut catalog: Option<&mut dyn TapeCatalog>,
        attempts: u32,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match catalog {
                Some(ref mut c) => self.inventory(Some(&mut **c)),
                None => self.inventory(None),
            };
            match result {
                Err(SumsError::SlotCountMismatch { .. }) if attempt < attempts.max(1) => {
                    tracing::warn!("Inventory attempt {} saw wrong slot count", attempt);
                }
                other => return other,
            }
        }
    }

    /// Refresh occupancy after a manual tape move
    ///
    /// Drive state is kept but every drive must reposition.
    pub fn reinventory(&mut self) -> Result<()> {
        let dump = self.read_status()?;
        if dump.slots.len() != self.config.max_slots {
            return Err(SumsError::SlotCountMismatch {
                expected: self.config.max_slots,
                found: dump.slots.len(),
            });
        }
        for (d, tape) in dump.drives.iter().enumerate().take(self.config.max_drives) {
            let drive = &mut self.drives[d];
            if drive.tape_id != *tape {
                drive.mode = if tape.is_some() {
                    TapeMode::ReadInit
                } else {
                    TapeMode::NotLoaded
                };
                drive.tape_id = tape.clone();
            }
            drive.file_number = -1;
        }
        self.empty_slots = 0;
        for (s, line) in dump.slots.iter().enumerate() {
            self.slots[s].tape_id = line.tape_id.clone();
            if line.tape_id.is_none() {
                self.empty_slots += 1;
            }
        }
        tracing::info!("***ENDInv: slots={}", dump.slots.len());
        Ok(())
    }

    /// Check a movement actually happened by re-reading the robot status
    pub fn verify(&mut self, action: VerifyAction) -> Verification {
        for attempt in 1..=self.config.verify_retries.max(1) {
            let dump = match self.robot.status() {
                Ok(text) => parse_status(&text),
                Err(e) => {
                    tracing::warn!("Verify attempt {} could not read status: {}", attempt, e);
                    continue;
                }
            };
            let slot_full = |s: usize| dump.slots.get(s).map(|l| l.tape_id.is_some());
            let drive_full = |d: usize| dump.drives.get(d).map(|t| t.is_some());

            let outcome = match action {
                VerifyAction::Load { slot, drive } => (slot_full(slot), drive_full(drive)),
                VerifyAction::Unload { drive, slot } => (drive_full(drive), slot_full(slot)),
                VerifyAction::Transfer { from, to } => (slot_full(from), slot_full(to)),
            };
            return match outcome {
                (Some(false), Some(true)) => Verification::Verified,
                (Some(_), Some(_)) => Verification::Mismatch,
                _ => Verification::Unknown,
            };
        }
        Verification::Unknown
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.slots.len() {
            return Err(SumsError::InvalidRequest(format!("no slot {}", slot + 1)));
        }
        Ok(())
    }

    fn check_drive(&self, drive: usize) -> Result<()> {
        if drive >= self.drives.len() {
            return Err(SumsError::InvalidRequest(format!("no drive {}", drive)));
        }
        Ok(())
    }

    /// Load the tape in `slot` into `drive`
    pub fn slot_to_drive(&mut self, slot: usize, drive: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.check_drive(drive)?;
        if self.slots[slot].tape_id.is_none() {
            return Err(SumsError::TapeNotFound(format!("slot {}", slot + 1)));
        }
        if self.drives[drive].tape_id.is_some() {
            return Err(SumsError::InvalidRequest(format!("drive {} is full", drive)));
        }

        self.robot.load(slot + 1, drive)?;

        let d = &mut self.drives[drive];
        d.tape_id = self.slots[slot].tape_id.take();
        d.home_slot = Some(slot);
        d.mode = TapeMode::ReadInit;
        d.file_number = 0;
        d.block_number = 0;
        self.empty_slots += 1;
        Ok(())
    }

    /// Unload the tape in `drive` into `slot`
    pub fn drive_to_slot(&mut self, drive: usize, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.check_drive(drive)?;
        if self.drives[drive].tape_id.is_none() {
            return Err(SumsError::TapeNotFound(format!("drive {}", drive)));
        }
        if self.slots[slot].tape_id.is_some() {
            return Err(SumsError::InvalidRequest(format!("slot {} is full", slot + 1)));
        }

        self.robot.unload(slot + 1, drive)?;

        self.slots[slot].tape_id = self.drives[drive].tape_id.take();
        self.drives[drive].clear();
        self.empty_slots = self.empty_slots.saturating_sub(1);
        Ok(())
    }

    /// Move the tape in slot `from` to slot `to`
    pub fn slot_to_slot(&mut self, from: usize, to: usize) -> Result<()> {
        self.check_slot(from)?;
        self.check_slot(to)?;
        if self.slots[from].tape_id.is_none() {
            return Err(SumsError::TapeNotFound(format!("slot {}", from + 1)));
        }
        if self.slots[to].tape_id.is_some() {
            return Err(SumsError::InvalidRequest(format!("slot {} is full", to + 1)));
        }

        self.robot.transfer(from + 1, to + 1)?;

        self.slots[to].tape_id = self.slots[from].tape_id.take();
        Ok(())
    }

    /// First empty import/export slot
    pub fn find_empty_impexp_slot(&self) -> Option<usize> {
        (self.live_slots()..self.slots.len()).find(|&s| self.slots[s].tape_id.is_none())
    }

    pub fn tape_in_drive(&self, tape: &str) -> Option<usize> {
        self.drives
            .iter()
            .position(|d| d.tape_id.as_deref() == Some(tape))
    }

    /// Live slot holding `tape`
    pub fn tape_in_slot(&self, tape: &str) -> Option<usize> {
        self.slots[..self.live_slots()]
            .iter()
            .position(|s| s.tape_id.as_deref() == Some(tape))
    }

    pub fn find_free_drive(&self) -> Option<usize> {
        self.drives.iter().position(|d| d.tape_id.is_none())
    }

    /// Return every loaded tape to the first free live slot
    ///
    /// A failed unload is retried once.
    pub fn free_all_drives(&mut self) -> Result<()> {
        for d in 0..self.drives.len() {
            if self.drives[d].tape_id.is_none() {
                continue;
            }
            let slot = (0..self.live_slots())
                .find(|&s| self.slots[s].tape_id.is_none())
                .ok_or_else(|| {
                    tracing::error!("No free slots to unload drive");
                    SumsError::NoFreeSlot
                })?;
            if let Err(e) = self.drive_to_slot(d, slot) {
                tracing::warn!("Err Retry: unload {} {}: {}", slot + 1, d, e);
                self.drive_to_slot(d, slot)?;
            }
        }
        Ok(())
    }

    /// Tapes seen in more than one place
    pub fn duplicate_tapes(&self) -> Vec<String> {
        let mut seen: AHashMap<&str, usize> = AHashMap::new();
        let places = self
            .drives
            .iter()
            .map(|d| d.tape_id.as_deref())
            .chain(self.slots.iter().map(|s| s.tape_id.as_deref()));
        for tape in places.flatten() {
            if tape != super::NO_BAR {
                *seen.entry(tape).or_default() += 1;
            }
        }
        let mut dups: Vec<String> = seen
            .into_iter()
            .filter(|&(_, n)| n > 1)
            .map(|(t, _)| t.to_string())
            .collect();
        dups.sort();
        dups
    }

    pub fn empty_slot_count(&self) -> usize {
        self.empty_slots
    }

    pub fn drives(&self) -> &[Drive] {
        &self.drives
    }

    pub fn drive_mut(&mut self, drive: usize) -> Result<&mut Drive> {
        self.check_drive(drive)?;
        Ok(&mut self.drives[drive])
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Occupancy report
    pub fn snapshot(&self) -> LibrarySnapshot {
        let live = self.live_slots();
        LibrarySnapshot {
            drives: self
                .drives
                .iter()
                .enumerate()
                .map(|(i, d)| DriveSnapshot {
                    drive: i,
                    tape_id: d.tape_id.clone(),
                    home_slot: d.home_slot.map(|s| s + 1),
                })
                .collect(),
            slots: self
                .slots
                .iter()
                .enumerate()
                .map(|(i, s)| SlotSnapshot {
                    slot: i + 1,
                    tape_id: s.tape_id.clone(),
                    import_export: i >= live,
                })
                .collect(),
            empty_slots: self.empty_slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tape::robot::SimulatedRobot;
    use crate::core::tape::MemoryCatalog;
    use std::time::Duration;

    const STATUS: &str = "Data Transfer Element 0:Full (Storage Element 3 Loaded):VolumeTag = T003
Data Transfer Element 1:Empty
      Storage Element 1:Full :VolumeTag=T001
      Storage Element 2:Full :VolumeTag=T002
      Storage Element 3:Empty
      Storage Element 4:Empty
      Storage Element 5 IMPORT/EXPORT:Empty
";

    fn library() -> TapeLibrary {
        let config = LibraryConfig {
            max_slots: 5,
            max_drives: 2,
            num_imp_exp: 1,
            ..Default::default()
        };
        let robot = SimulatedRobot::from_status(STATUS, Duration::ZERO);
        TapeLibrary::new(config, Box::new(robot))
    }

    #[test]
    fn test_inventory_assigns_home_slot() {
        let mut lib = library();
        let mut catalog = MemoryCatalog::new();
        lib.inventory(Some(&mut catalog)).unwrap();

        assert_eq!(lib.drives()[0].tape_id.as_deref(), Some("T003"));
        assert_eq!(lib.drives()[0].home_slot, Some(2));
        assert_eq!(lib.drives()[1].home_slot, None);
        assert_eq!(lib.empty_slot_count(), 3);
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_inventory_slot_count_mismatch() {
        let config = LibraryConfig {
            max_slots: 6,
            max_drives: 2,
            num_imp_exp: 1,
            ..Default::default()
        };
        let robot = SimulatedRobot::from_status(STATUS, Duration::ZERO);
        let mut lib = TapeLibrary::new(config, Box::new(robot));
        assert!(matches!(
            lib.inventory_with_retry(None, 2),
            Err(SumsError::SlotCountMismatch {
                expected: 6,
                found: 5
            })
        ));
    }

    #[test]
    fn test_moves_and_verify() {
        let mut lib = library();
        lib.inventory(None).unwrap();

        lib.slot_to_drive(0, 1).unwrap();
        assert_eq!(lib.tape_in_drive("T001"), Some(1));
        assert_eq!(
            lib.verify(VerifyAction::Load { slot: 0, drive: 1 }),
            Verification::Verified
        );
        assert_eq!(lib.find_free_drive(), None);

        lib.drive_to_slot(1, 3).unwrap();
        assert_eq!(lib.tape_in_slot("T001"), Some(3));
        assert_eq!(
            lib.verify(VerifyAction::Unload { drive: 1, slot: 3 }),
            Verification::Verified
        );
        assert_eq!(
            lib.verify(VerifyAction::Load { slot: 3, drive: 1 }),
            Verification::Mismatch
        );

        lib.slot_to_slot(3, 4).unwrap();
        assert_eq!(lib.tape_in_slot("T001"), None);
        assert_eq!(lib.find_empty_impexp_slot(), None);
    }

    #[test]
    fn test_failed_move_leaves_state() {
        let mut lib = library();
        lib.inventory(None).unwrap();
        assert!(lib.slot_to_drive(2, 1).is_err());
        assert!(lib.slot_to_drive(0, 0).is_err());
        assert_eq!(lib.tape_in_slot("T001"), Some(0));
    }

    #[test]
    fn test_free_all_drives() {
        let mut lib = library();
        lib.inventory(None).unwrap();
        lib.free_all_drives().unwrap();
        assert_eq!(lib.find_free_drive(), Some(0));
        assert_eq!(lib.tape_in_slot("T003"), Some(2));
        assert!(lib.duplicate_tapes().is_empty());
    }

    #[test]
    fn test_reinventory_forces_reposition() {
        let mut lib = library();
        lib.inventory(None).unwrap();
        lib.drive_mut(0).unwrap().file_number = 7;
        lib.reinventory().unwrap();
        assert_eq!(lib.drives()[0].file_number, -1);
        assert_eq!(lib.drives()[0].home_slot, Some(2));
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut lib = library();
        lib.inventory(None).unwrap();
        let json = serde_json::to_string(&lib.snapshot()).unwrap();
        assert!(json.contains("\"T003\""));
        let snap = lib.snapshot();
        assert!(snap.slots[4].import_export);
        assert_eq!(snap.drives[0].home_slot, Some(3));
    }
}
