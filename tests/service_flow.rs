//! End-to-end tests of the async service
//!
//! Drives the request API against a simulated drive manager and robot.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sums::archive::{SubmitStatus, WriteRequest};
use sums::config::{LibraryConfig, PartitionConfig};
use sums::service::{
    CancelToken, DriveChannel, DriveEvent, ReadRequest, Request, Response, RobotWorker,
    SimulatedDrive, SumsService,
};
use sums::tape::{SimulatedRobot, TapeLibrary};
use sums::unit::{ArchiveSubtype, SuStatus, UnitAvailability};
use sums::{SumsConfig, SumsError};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn config(dir: &TempDir) -> SumsConfig {
    let mut config = SumsConfig::default();
    config.partitions = vec![PartitionConfig::new(
        dir.path().join("SUM1").to_string_lossy().to_string(),
        0,
        Some(1e9),
    )];
    config.archive.tar_file_size = 1000;
    config
}

async fn open(svc: &SumsService, cancel: &CancelToken) -> u64 {
    match svc.handle(Request::Open { user: "production".into() }, cancel).await {
        Ok(Response::Opened(uid)) => uid,
        other => panic!("unexpected {:?}", other),
    }
}

async fn wait_for_status(svc: &SumsService, sunum: u64, status: SuStatus) {
    for _ in 0..200 {
        if svc.info(&[sunum]).unwrap()[0].status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("unit {} never reached {}", sunum, status);
}

#[tokio::test]
async fn test_run_loop_completes_archive_writes() {
    let dir = TempDir::new().unwrap();
    let (drive, events) = SimulatedDrive::new("SIM042");
    let svc = Arc::new(SumsService::new(config(&dir), 500, Arc::new(drive), None).unwrap());
    let cancel = CancelToken::new();
    let uid = open(&svc, &cancel).await;

    let units = match svc
        .handle(
            Request::Alloc {
                uid,
                count: 2,
                series: "hmi.V_45s".into(),
                bytes: 600.0,
                lifetime_days: 7,
                set: 0,
            },
            &cancel,
        )
        .await
        .unwrap()
    {
        Response::Units(units) => units,
        other => panic!("unexpected {:?}", other),
    };
    for su in &units {
        let put = Request::Put {
            uid,
            sunum: su.sunum,
            archive: true,
            group_id: 3,
            subtype: ArchiveSubtype::Permanent,
        };
        assert_eq!(svc.handle(put, &cancel).await.unwrap(), Response::Committed);
    }

    match svc.handle(Request::ArchiveTick, &cancel).await.unwrap() {
        Response::Archive(run) => assert_eq!(run.submitted, vec![500]),
        other => panic!("unexpected {:?}", other),
    }

    // The completion is already queued; the loop settles it
    let looping = tokio::spawn(Arc::clone(&svc).run(events, cancel.clone()));
    wait_for_status(&svc, 501, SuStatus::DeletePending).await;
    let su = svc.info(&[501]).unwrap().remove(0);
    assert_eq!(su.tape.unwrap().tape_id, "SIM042");

    cancel.cancel();
    looping.await.unwrap().unwrap();
}

/// Drive manager that turns reads away until switched on
struct Gated {
    inner: SimulatedDrive,
    reads_open: AtomicBool,
}

#[async_trait]
impl DriveChannel for Gated {
    async fn submit_write(&self, request: WriteRequest) -> sums::Result<SubmitStatus> {
        self.inner.submit_write(request).await
    }

    async fn submit_read(&self, request: ReadRequest) -> sums::Result<SubmitStatus> {
        if !self.reads_open.load(Ordering::SeqCst) {
            return Ok(SubmitStatus::Offline);
        }
        self.inner.submit_read(request).await
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<DriveEvent>) -> DriveEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_rejected_reads_are_retried() {
    let dir = TempDir::new().unwrap();
    let (inner, mut events) = SimulatedDrive::new("SIM007");
    let gated = Arc::new(Gated {
        inner,
        reads_open: AtomicBool::new(false),
    });
    let drive: Arc<dyn DriveChannel> = gated.clone();
    let svc = SumsService::new(config(&dir), 1, drive, None).unwrap();
    let cancel = CancelToken::new();
    let uid = open(&svc, &cancel).await;

    let sunum = svc.alloc(uid, 1, "aia.lev1", 2000.0, 1, 0).unwrap()[0].sunum;
    svc.put(uid, sunum, true, 1, ArchiveSubtype::Permanent).unwrap();
    svc.archive_tick(&cancel).await.unwrap();
    let DriveEvent::Write(outcome) = next_event(&mut events).await else {
        panic!("expected a write completion");
    };
    svc.on_write_complete(&outcome, &cancel).await.unwrap();
    svc.with_store(|s| s.reclaim(sunum)).unwrap();

    let found = svc.get(uid, &[sunum], true, &cancel).await.unwrap();
    assert!(matches!(found[0], UnitAvailability::Retrieving(_)));
    assert!(events.try_recv().is_err());

    gated.reads_open.store(true, Ordering::SeqCst);
    assert_eq!(svc.retry_needed_reads(&cancel).await.unwrap(), 1);
    let DriveEvent::Read(read) = next_event(&mut events).await else {
        panic!("expected a read completion");
    };
    svc.on_read_complete(&read).unwrap();
    assert!(svc.info(&[sunum]).unwrap()[0].online);

    // Asking again finds the unit online without a second read
    let found = svc.get(uid, &[sunum], true, &cancel).await.unwrap();
    assert!(matches!(found[0], UnitAvailability::Online(_)));
    assert_eq!(svc.retry_needed_reads(&cancel).await.unwrap(), 0);
}

#[tokio::test]
async fn test_inventory_through_robot_worker() {
    let dir = TempDir::new().unwrap();
    let status = "Data Transfer Element 0:Full (Storage Element 2 Loaded):VolumeTag = T00002
      Storage Element 1:Full :VolumeTag=T00001
      Storage Element 2:Empty
      Storage Element 3:Empty
      Storage Element 4 IMPORT/EXPORT:Empty
";
    let library_config = LibraryConfig {
        max_slots: 4,
        max_drives: 1,
        num_imp_exp: 1,
        ..Default::default()
    };
    let robot = SimulatedRobot::from_status(status, Duration::ZERO);
    let worker = RobotWorker::with_library(TapeLibrary::new(library_config, Box::new(robot)))
        .unwrap();

    let (drive, _events) = SimulatedDrive::new("SIM001");
    let svc = SumsService::new(config(&dir), 1, Arc::new(drive), Some(worker)).unwrap();
    let cancel = CancelToken::new();

    let snapshot = match svc.handle(Request::Inventory, &cancel).await.unwrap() {
        Response::Inventory(snapshot) => snapshot,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(snapshot.empty_slots, 3);
    assert_eq!(snapshot.drives[0].tape_id.as_deref(), Some("T00002"));
}

#[tokio::test]
async fn test_delete_requests() {
    let dir = TempDir::new().unwrap();
    let (drive, _events) = SimulatedDrive::new("SIM001");
    let svc = SumsService::new(config(&dir), 1, Arc::new(drive), None).unwrap();
    let cancel = CancelToken::new();
    let uid = open(&svc, &cancel).await;

    let units = svc.alloc(uid, 3, "scratch", 10.0, 1, 0).unwrap();
    let deleted = svc
        .handle(Request::Delete { uid, sunum: units[0].sunum }, &cancel)
        .await
        .unwrap();
    assert_eq!(deleted, Response::Deleted(1));
    assert!(!units[0].wd.exists());

    let deleted = svc
        .handle(Request::DeleteSeries { series: "scratch".into() }, &cancel)
        .await
        .unwrap();
    assert_eq!(deleted, Response::Deleted(2));
    assert_eq!(svc.info(&[units[1].sunum]).unwrap()[0].status, SuStatus::DeletePending);

    assert!(matches!(
        svc.info(&[units[0].sunum]),
        Err(sums::service::ServiceError::Sums(SumsError::UnknownUnit(_)))
    ));
}
