//! Tape library integration tests
//!
//! Runs inventories and tape moves against a simulated 2-drive, 38-slot
//! library whose top 8 slots are import/export.

use std::time::Duration;
use sums::config::LibraryConfig;
use sums::tape::{
    parse_status, MemoryCatalog, SimulatedRobot, TapeLibrary, TapeState, Verification,
    VerifyAction,
};
use sums::SumsError;

/// Slots 1-24 full, 25-38 empty, 31-38 import/export
fn status_listing() -> String {
    let mut text = String::from("  Storage Changer /dev/sg7:2 Drives, 38 Slots ( 8 Import/Export )\n");
    text.push_str("Data Transfer Element 0:Empty\n");
    text.push_str("Data Transfer Element 1:Empty\n");
    for slot in 1..=38 {
        let ie = if slot > 30 { " IMPORT/EXPORT" } else { "" };
        if slot <= 24 {
            text.push_str(&format!(
                "      Storage Element {}{}:Full :VolumeTag={:06}S1\n",
                slot, ie, slot
            ));
        } else {
            text.push_str(&format!("      Storage Element {}{}:Empty\n", slot, ie));
        }
    }
    text
}

/// One drive holding the tape from slot 25, the other empty
fn loaded_listing() -> String {
    status_listing().replace(
        "Data Transfer Element 0:Empty\n",
        "Data Transfer Element 0:Full (Storage Element 25 Loaded):VolumeTag = 000025S1\n",
    )
}

fn config(max_slots: usize) -> LibraryConfig {
    LibraryConfig {
        max_slots,
        max_drives: 2,
        num_imp_exp: 8,
        verify_retries: 2,
        ..Default::default()
    }
}

fn library(max_slots: usize) -> TapeLibrary {
    let robot = SimulatedRobot::from_status(&status_listing(), Duration::ZERO);
    TapeLibrary::new(config(max_slots), Box::new(robot))
}

#[test]
fn test_parse_listing() {
    let dump = parse_status(&status_listing());
    let changer = dump.changer.clone().unwrap();
    assert_eq!(changer.drives, 2);
    assert_eq!(changer.slots, 38);
    assert_eq!(changer.import_export, 8);

    assert_eq!(dump.drives, vec![None, None]);
    assert_eq!(dump.slots.len(), 38);
    assert_eq!(dump.empty_slots(), 14);
    assert_eq!(dump.slots[0].tape_id.as_deref(), Some("000001S1"));
    assert!(dump.slots[30].import_export);
    assert!(!dump.slots[29].import_export);
}

#[test]
fn test_inventory_counts_and_catalog() {
    let mut lib = library(38);
    let mut catalog = MemoryCatalog::new();
    catalog.set_state("000003S1", TapeState::Closed);

    lib.inventory(Some(&mut catalog)).unwrap();
    assert_eq!(lib.empty_slot_count(), 14);
    assert_eq!(catalog.len(), 24);
    assert_eq!(catalog.state("000003S1"), Some(TapeState::Closed));
    assert_eq!(lib.tape_in_slot("000024S1"), Some(23));
    assert_eq!(lib.find_empty_impexp_slot(), Some(30));
    assert_eq!(lib.find_free_drive(), Some(0));
    assert!(lib.duplicate_tapes().is_empty());

    let snap = lib.snapshot();
    assert_eq!(snap.slots.len(), 38);
    assert_eq!(snap.empty_slots, 14);
}

#[test]
fn test_wrong_slot_count_is_reported() {
    let mut lib = library(40);
    assert!(matches!(
        lib.inventory_with_retry(None, 3),
        Err(SumsError::SlotCountMismatch {
            expected: 40,
            found: 38
        })
    ));

    // More slots than configured cannot be tracked at all
    let mut lib = library(30);
    assert!(matches!(lib.inventory(None), Err(SumsError::Inventory(_))));
}

#[test]
fn test_inventory_with_loaded_drive() {
    let text = loaded_listing();
    let dump = parse_status(&text);
    assert_eq!(dump.drives, vec![Some("000025S1".to_string()), None]);
    assert_eq!(dump.slots.len(), 38);
    assert_eq!(dump.slots.iter().filter(|s| s.tape_id.is_some()).count(), 24);
    assert_eq!(dump.empty_slots(), 14);
    assert_eq!(dump.slots.iter().filter(|s| s.import_export).count(), 8);

    let robot = SimulatedRobot::from_status(&text, Duration::ZERO);
    let mut lib = TapeLibrary::new(config(38), Box::new(robot));
    let mut catalog = MemoryCatalog::new();
    lib.inventory(Some(&mut catalog)).unwrap();

    assert_eq!(lib.tape_in_drive("000025S1"), Some(0));
    assert_eq!(lib.drives()[1].tape_id, None);
    assert_eq!(lib.find_free_drive(), Some(1));
    assert_eq!(lib.empty_slot_count(), 14);
    assert_eq!(catalog.len(), 25);
    for slot in 0..24 {
        assert_eq!(lib.slots()[slot].tape_id, Some(format!("{:06}S1", slot + 1)));
    }
    assert!(lib.slots()[24..].iter().all(|s| s.tape_id.is_none()));

    // The loaded tape is homed on the first empty slot
    assert_eq!(lib.drives()[0].home_slot, Some(24));
    assert_eq!(lib.snapshot().drives[0].home_slot, Some(25));

    lib.free_all_drives().unwrap();
    assert_eq!(lib.tape_in_slot("000025S1"), Some(24));
    assert_eq!(lib.empty_slot_count(), 13);
}

#[test]
fn test_inventory_retry_keeps_catalog() {
    let mut catalog = MemoryCatalog::new();
    let mut lib = library(40);
    assert!(matches!(
        lib.inventory_with_retry(Some(&mut catalog), 3),
        Err(SumsError::SlotCountMismatch { .. })
    ));

    let mut catalog = MemoryCatalog::new();
    let mut lib = library(38);
    lib.inventory_with_retry(Some(&mut catalog), 3).unwrap();
    assert_eq!(catalog.len(), 24);
    assert_eq!(catalog.state("000001S1"), Some(TapeState::Active));
}

#[test]
fn test_load_unload_and_free_drives() {
    let mut lib = library(38);
    lib.inventory(None).unwrap();

    lib.slot_to_drive(4, 0).unwrap();
    assert_eq!(lib.verify(VerifyAction::Load { slot: 4, drive: 0 }), Verification::Verified);
    assert_eq!(lib.tape_in_drive("000005S1"), Some(0));
    assert_eq!(lib.empty_slot_count(), 15);

    lib.slot_to_drive(0, 1).unwrap();
    assert_eq!(lib.find_free_drive(), None);
    assert!(matches!(lib.slot_to_drive(1, 1), Err(SumsError::InvalidRequest(_))));

    lib.slot_to_slot(2, 30).unwrap();
    assert_eq!(lib.verify(VerifyAction::Transfer { from: 2, to: 30 }), Verification::Verified);
    // Import/export slots do not count as parked
    assert_eq!(lib.tape_in_slot("000003S1"), None);

    lib.free_all_drives().unwrap();
    assert_eq!(lib.find_free_drive(), Some(0));
    // Tapes go back to the first free live slots
    assert_eq!(lib.tape_in_slot("000005S1"), Some(0));
    assert_eq!(lib.tape_in_slot("000001S1"), Some(2));
}

#[test]
fn test_reinventory_sees_manual_moves() {
    let mut lib = library(38);
    lib.inventory(None).unwrap();
    lib.slot_to_drive(7, 1).unwrap();

    lib.reinventory().unwrap();
    assert_eq!(lib.drives()[1].tape_id.as_deref(), Some("000008S1"));
    assert_eq!(lib.drives()[1].file_number, -1);
    assert_eq!(lib.empty_slot_count(), 15);
}
