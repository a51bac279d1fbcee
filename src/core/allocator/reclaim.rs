//! Delete-pending reclaim
//!
//! Each pass works out how many bytes every partition and allocation set is
//! short of its free-space target, then walks the delete-pending list in
//! allocation order removing units until the shortfall is covered. Units
//! held open by a session and units whose effective date lies in the future
//! are left alone.

use crate::core::allocator::SpaceAllocator;
use crate::core::config::ReclaimConfig;
use crate::core::unit::{Sunum, UnitStore};
use crate::error::Result;
use ahash::AHashMap;
use chrono::{NaiveDateTime, Timelike};

/// Outcome of one reclaim pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclaimReport {
    /// Units whose disk copy was removed (or would be, under `noop`)
    pub removed: Vec<Sunum>,
    pub bytes_freed: f64,
    /// Skipped because a session holds them
    pub skipped_held: usize,
    /// Skipped because their effective date has not arrived
    pub skipped_future: usize,
    /// Pass suppressed by the no-run window
    pub suppressed: bool,
}

/// Delete-pending reclaimer
#[derive(Debug, Clone)]
pub struct Reclaimer {
    config: ReclaimConfig,
}

impl Reclaimer {
    pub fn new(config: ReclaimConfig) -> Self {
        Reclaimer { config }
    }

    pub fn config(&self) -> &ReclaimConfig {
        &self.config
    }

    /// Bytes each partition and set must give back
    fn shortfall(&self, store: &UnitStore) -> (AHashMap<String, f64>, AHashMap<i32, f64>) {
        let table = store.partitions();
        let part_need = table
            .iter()
            .map(|p| {
                let target = p.bytes_total * self.config.part_percent_free / 100.0;
                (p.name.clone(), (target - p.bytes_left).max(0.0))
            })
            .collect();
        let set_need = table
            .sets()
            .into_iter()
            .map(|set| {
                let need = self.config.max_free_for(set) - table.bytes_left(set);
                (set, need.max(0.0))
            })
            .collect();
        (part_need, set_need)
    }

    /// Run one reclaim pass at time `now`
    pub fn run_once(&self, store: &mut UnitStore, now: NaiveDateTime) -> Result<ReclaimReport> {
        let mut report = ReclaimReport::default();
        if self.config.in_norun_window(now.hour()) {
            tracing::debug!("Reclaim suppressed at hour {}", now.hour());
            report.suppressed = true;
            return Ok(report);
        }

        let (mut part_need, mut set_need) = self.shortfall(store);
        let still_short = |p: &AHashMap<String, f64>, s: &AHashMap<i32, f64>| {
            p.values().any(|&b| b > 0.0) || s.values().any(|&b| b > 0.0)
        };
        if !still_short(&part_need, &set_need) {
            return Ok(report);
        }

        let candidates: Vec<Sunum> = store.delete_pending().iter().map(|e| e.sunum).collect();
        for sunum in candidates {
            if !still_short(&part_need, &set_need) {
                break;
            }
            let su = store.info(sunum)?;
            let p_need = part_need.get(&su.partition).copied().unwrap_or(0.0);
            let s_need = set_need.get(&su.set).copied().unwrap_or(0.0);
            if p_need <= 0.0 && s_need <= 0.0 {
                continue;
            }
            if store.is_held(sunum) {
                report.skipped_held += 1;
                continue;
            }
            if su.effective_date.is_after(now) {
                report.skipped_future += 1;
                continue;
            }

            if self.config.noop {
                tracing::info!(sunum, wd = %su.wd.display(), "noop: would remove");
            } else {
                store.reclaim(sunum)?;
                tracing::info!(sunum, wd = %su.wd.display(), bytes = su.bytes, "Removed");
            }
            report.removed.push(sunum);
            report.bytes_freed += su.bytes;
            if let Some(b) = part_need.get_mut(&su.partition) {
                *b -= su.bytes;
            }
            if let Some(b) = set_need.get_mut(&su.set) {
                *b -= su.bytes;
            }
        }

        tracing::info!(
            "Reclaim pass freed {} bytes from {} units",
            report.bytes_freed,
            report.removed.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::allocator::PartitionTable;
    use crate::core::config::PartitionConfig;
    use crate::core::unit::{EffectiveDate, SuStatus};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    /// One 1000-byte partition with four 200-byte delete-pending units
    fn full_store(dir: &TempDir) -> (UnitStore, Vec<Sunum>) {
        let name = dir.path().join("SUM1").to_string_lossy().to_string();
        let table =
            PartitionTable::from_config(&[PartitionConfig::new(name, 0, Some(1000.0))]).unwrap();
        let mut store = UnitStore::new(table, 1);
        let units = store.new_slots(4, "s", 200.0, 0, 0, at(0)).unwrap();
        let sunums: Vec<Sunum> = units.iter().map(|u| u.sunum).collect();
        for &s in &sunums {
            store.mark_delete_pending(s, EffectiveDate(at(1))).unwrap();
        }
        (store, sunums)
    }

    fn config(percent: f64) -> ReclaimConfig {
        ReclaimConfig {
            part_percent_free: percent,
            ..Default::default()
        }
    }

    #[test]
    fn test_frees_until_target_met() {
        let dir = TempDir::new().unwrap();
        let (mut store, sunums) = full_store(&dir);

        // Need 500 free, have 200: remove two units in sunum order
        let report = Reclaimer::new(config(50.0)).run_once(&mut store, at(12)).unwrap();
        assert_eq!(report.removed, sunums[..2].to_vec());
        assert_eq!(report.bytes_freed, 400.0);
        assert_eq!(store.partitions().bytes_left(0), 600.0);
        assert_eq!(store.delete_pending().len(), 2);
        assert!(store.info(sunums[0]).is_err());
    }

    #[test]
    fn test_nothing_to_do_when_space_is_free() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = full_store(&dir);
        let report = Reclaimer::new(config(10.0)).run_once(&mut store, at(12)).unwrap();
        assert!(report.removed.is_empty());
    }

    #[test]
    fn test_skips_held_and_future_units() {
        let dir = TempDir::new().unwrap();
        let (mut store, sunums) = full_store(&dir);
        store.hold(42, sunums[0]).unwrap();
        store
            .mark_delete_pending(sunums[1], EffectiveDate(at(23)))
            .unwrap();

        let report = Reclaimer::new(config(50.0)).run_once(&mut store, at(12)).unwrap();
        assert_eq!(report.skipped_held, 1);
        assert_eq!(report.skipped_future, 1);
        assert_eq!(report.removed, vec![sunums[2], sunums[3]]);
        assert_eq!(store.info(sunums[0]).unwrap().status, SuStatus::DeletePending);
    }

    #[test]
    fn test_noop_and_norun() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = full_store(&dir);

        let noop = ReclaimConfig {
            noop: true,
            ..config(50.0)
        };
        let report = Reclaimer::new(noop).run_once(&mut store, at(12)).unwrap();
        assert_eq!(report.removed.len(), 2);
        assert_eq!(store.delete_pending().len(), 4);
        assert_eq!(store.partitions().bytes_left(0), 200.0);

        let norun = ReclaimConfig {
            norun_start: 10,
            norun_stop: 14,
            ..config(50.0)
        };
        let report = Reclaimer::new(norun).run_once(&mut store, at(12)).unwrap();
        assert!(report.suppressed);
        assert!(report.removed.is_empty());
    }

    #[test]
    fn test_set_target() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = full_store(&dir);
        let cfg = ReclaimConfig {
            max_free: vec![crate::core::config::SetLimit {
                set: 0,
                bytes: 350.0,
            }],
            ..config(0.0)
        };
        let report = Reclaimer::new(cfg).run_once(&mut store, at(12)).unwrap();
        assert_eq!(report.removed.len(), 1);
    }
}
