//! Async request dispatch over the SUMS engine
//!
//! [`SumsService`] owns the allocator state, the archive batcher and the
//! drive queues, each behind its own lock, and talks to the drive manager
//! through a [`DriveChannel`] and to the tape robot through a
//! [`RobotWorker`]. Locks are never held across an `.await`.
//!
//! Tape writes and reads complete out of band: the drive manager reports a
//! [`DriveEvent`], which [`SumsService::run`] hands back to the service.

pub mod cancel;
pub mod drive;
pub mod error;
pub mod robot_worker;

pub use cancel::CancelToken;
pub use drive::{
    submit_with_timeout, DriveChannel, DriveEvent, ReadOutcome, ReadRequest, SimulatedDrive,
};
pub use error::{ServiceError, ServiceResult};
pub use robot_worker::RobotWorker;

use crate::core::allocator::{PartitionTable, ReclaimReport, Reclaimer};
use crate::core::archive::{ArchiveBatcher, ArchiveRun, SubmitStatus, WriteOutcome};
use crate::core::config::SumsConfig;
use crate::core::tape::{LibrarySnapshot, QueueKind, TapeQueue, TqEntry};
use crate::core::unit::{ArchiveSubtype, StorageUnit, Sunum, UnitAvailability, UnitStore};
use crate::error::SumsError;
use ahash::AHashMap;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Open {
        user: String,
    },
    Close {
        uid: u64,
    },
    Alloc {
        uid: u64,
        count: usize,
        series: String,
        bytes: f64,
        lifetime_days: i64,
        set: i32,
    },
    Get {
        uid: u64,
        sunums: Vec<Sunum>,
        retrieve: bool,
    },
    Put {
        uid: u64,
        sunum: Sunum,
        archive: bool,
        group_id: i32,
        subtype: ArchiveSubtype,
    },
    Info {
        sunums: Vec<Sunum>,
    },
    Delete {
        uid: u64,
        sunum: Sunum,
    },
    DeleteSeries {
        series: String,
    },
    ArchiveTick,
    Inventory,
    Shutdown {
        query: bool,
    },
    Nop,
}

/// Answer to a [`Request`]
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Opened(u64),
    Closed,
    Units(Vec<StorageUnit>),
    Availability(Vec<UnitAvailability>),
    Committed,
    Deleted(usize),
    Archive(ArchiveRun),
    Inventory(LibrarySnapshot),
    Shutdown { shutting_down: bool, sessions: usize },
    Ok,
}

#[derive(Debug, Clone)]
struct Session {
    user: String,
    opened: NaiveDateTime,
}

#[derive(Debug, Default)]
struct Sessions {
    open: AHashMap<u64, Session>,
    next_uid: u64,
    no_open: bool,
}

/// Async SUMS service
pub struct SumsService {
    config: SumsConfig,
    store: Mutex<UnitStore>,
    batcher: Mutex<ArchiveBatcher>,
    queue: Mutex<TapeQueue>,
    /// Units still to be read, by (tape_id, file_number); one queue entry
    /// stands for each tape file
    wanted: Mutex<AHashMap<(String, i32), Vec<Sunum>>>,
    /// Sessions waiting for each unit to come back online
    waiters: Mutex<AHashMap<Sunum, Vec<u64>>>,
    /// Reads handed to the drive manager, by sunum
    reading: Mutex<AHashMap<Sunum, TqEntry>>,
    sessions: Mutex<Sessions>,
    /// Serializes batching passes so a batch is submitted once
    archive_gate: tokio::sync::Mutex<()>,
    reclaimer: Reclaimer,
    drive: Arc<dyn DriveChannel>,
    robot: Option<RobotWorker>,
}

impl std::fmt::Debug for SumsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SumsService")
            .field("units", &self.store.lock().len())
            .field("outstanding_writes", &self.batcher.lock().outstanding())
            .field("sessions", &self.sessions.lock().open.len())
            .finish()
    }
}

impl SumsService {
    /// Build a service over the configured partitions
    pub fn new(
        config: SumsConfig,
        first_sunum: Sunum,
        drive: Arc<dyn DriveChannel>,
        robot: Option<RobotWorker>,
    ) -> ServiceResult<Self> {
        config.validate()?;
        let table = PartitionTable::from_config(&config.partitions)?;
        Ok(SumsService {
            store: Mutex::new(UnitStore::new(table, first_sunum)),
            batcher: Mutex::new(ArchiveBatcher::new(config.archive.clone())),
            queue: Mutex::new(TapeQueue::new()),
            wanted: Mutex::new(AHashMap::new()),
            waiters: Mutex::new(AHashMap::new()),
            reading: Mutex::new(AHashMap::new()),
            sessions: Mutex::new(Sessions {
                next_uid: 1,
                ..Default::default()
            }),
            archive_gate: tokio::sync::Mutex::new(()),
            reclaimer: Reclaimer::new(config.reclaim.clone()),
            config,
            drive,
            robot,
        })
    }

    pub fn config(&self) -> &SumsConfig {
        &self.config
    }

    /// Run `f` against the unit store
    pub fn with_store<T>(&self, f: impl FnOnce(&mut UnitStore) -> T) -> T {
        f(&mut self.store.lock())
    }

    /// Dispatch one request
    pub async fn handle(&self, request: Request, cancel: &CancelToken) -> ServiceResult<Response> {
        match request {
            Request::Open { user } => self.open(&user).map(Response::Opened),
            Request::Close { uid } => self.close(uid).map(|()| Response::Closed),
            Request::Alloc {
                uid,
                count,
                series,
                bytes,
                lifetime_days,
                set,
            } => self
                .alloc(uid, count, &series, bytes, lifetime_days, set)
                .map(Response::Units),
            Request::Get {
                uid,
                sunums,
                retrieve,
            } => self
                .get(uid, &sunums, retrieve, cancel)
                .await
                .map(Response::Availability),
            Request::Put {
                uid,
                sunum,
                archive,
                group_id,
                subtype,
            } => self
                .put(uid, sunum, archive, group_id, subtype)
                .map(|()| Response::Committed),
            Request::Info { sunums } => self.info(&sunums).map(Response::Units),
            Request::Delete { uid, sunum } => {
                self.check_session(uid)?;
                self.store.lock().free(sunum)?;
                Ok(Response::Deleted(1))
            }
            Request::DeleteSeries { series } => {
                let n = self.store.lock().delete_series(&series, now())?;
                Ok(Response::Deleted(n))
            }
            Request::ArchiveTick => self.archive_tick(cancel).await.map(Response::Archive),
            Request::Inventory => self.inventory().await.map(Response::Inventory),
            Request::Shutdown { query } => {
                let (shutting_down, sessions) = self.shutdown(query);
                Ok(Response::Shutdown {
                    shutting_down,
                    sessions,
                })
            }
            Request::Nop => Ok(Response::Ok),
        }
    }

    /// Open a session
    pub fn open(&self, user: &str) -> ServiceResult<u64> {
        let mut sessions = self.sessions.lock();
        if sessions.no_open {
            return Err(ServiceError::ShuttingDown);
        }
        let uid = sessions.next_uid;
        sessions.next_uid += 1;
        sessions.open.insert(
            uid,
            Session {
                user: user.to_string(),
                opened: now(),
            },
        );
        tracing::info!(uid, user, "Session opened");
        Ok(uid)
    }

    /// Close a session, dropping its holds and queued reads
    pub fn close(&self, uid: u64) -> ServiceResult<()> {
        let session = self
            .sessions
            .lock()
            .open
            .remove(&uid)
            .ok_or(ServiceError::UnknownSession(uid))?;
        let dropped = self.drop_waiter(uid);
        tracing::info!(
            uid,
            user = %session.user,
            opened = %session.opened,
            dropped,
            "Session closed"
        );
        Ok(())
    }

    /// Release the holds of `uid` and forget reads only it was waiting for
    fn drop_waiter(&self, uid: u64) -> usize {
        let mut store = self.store.lock();
        store.release(uid);
        let mut wanted = self.wanted.lock();
        let mut waiters = self.waiters.lock();
        let reading = self.reading.lock();

        let mut orphaned = Vec::new();
        waiters.retain(|&sunum, uids| {
            uids.retain(|&u| u != uid);
            if uids.is_empty() {
                orphaned.push(sunum);
                return false;
            }
            true
        });

        let mut dropped = 0;
        for sunum in orphaned {
            if reading.contains_key(&sunum) {
                continue;
            }
            for sunums in wanted.values_mut() {
                sunums.retain(|&s| s != sunum);
            }
            if let Err(e) = store.retrieve_failed(sunum) {
                tracing::warn!(sunum, "Failed to release retrieval directory: {}", e);
            }
            dropped += 1;
        }
        wanted.retain(|_, sunums| !sunums.is_empty());
        dropped
    }

    fn check_session(&self, uid: u64) -> ServiceResult<()> {
        if self.sessions.lock().open.contains_key(&uid) {
            Ok(())
        } else {
            Err(ServiceError::UnknownSession(uid))
        }
    }

    /// Refuse new sessions unless `query`; report the state and open sessions
    pub fn shutdown(&self, query: bool) -> (bool, usize) {
        let mut sessions = self.sessions.lock();
        if !query && !sessions.no_open {
            tracing::warn!("Shutdown requested, {} sessions open", sessions.open.len());
            sessions.no_open = true;
        }
        (sessions.no_open, sessions.open.len())
    }

    /// Accept new sessions again
    pub fn clear_shutdown(&self) {
        self.sessions.lock().no_open = false;
    }

    pub fn alloc(
        &self,
        uid: u64,
        count: usize,
        series: &str,
        bytes: f64,
        lifetime_days: i64,
        set: i32,
    ) -> ServiceResult<Vec<StorageUnit>> {
        self.check_session(uid)?;
        let units = self
            .store
            .lock()
            .new_slots(count, series, bytes, lifetime_days, set, now())?;
        Ok(units)
    }

    pub fn put(
        &self,
        uid: u64,
        sunum: Sunum,
        archive: bool,
        group_id: i32,
        subtype: ArchiveSubtype,
    ) -> ServiceResult<()> {
        self.check_session(uid)?;
        self.store.lock().commit(sunum, archive, group_id, subtype)?;
        Ok(())
    }

    pub fn info(&self, sunums: &[Sunum]) -> ServiceResult<Vec<StorageUnit>> {
        let store = self.store.lock();
        let units = sunums
            .iter()
            .map(|&s| store.info(s))
            .collect::<crate::error::Result<Vec<_>>>()?;
        Ok(units)
    }

    /// Open units for reading, starting tape reads for offline ones when
    /// `retrieve` is set
    pub async fn get(
        &self,
        uid: u64,
        sunums: &[Sunum],
        retrieve: bool,
        cancel: &CancelToken,
    ) -> ServiceResult<Vec<UnitAvailability>> {
        self.check_session(uid)?;
        let user = self.user_of(uid);
        let found = {
            let mut store = self.store.lock();
            let found = store.request_units(sunums, retrieve)?;
            let mut queue = self.queue.lock();
            let mut wanted = self.wanted.lock();
            let mut waiters = self.waiters.lock();
            let reading = self.reading.lock();
            let mut waiting = 0;
            let mut tapes = Vec::new();
            for (ds_index, availability) in found.iter().enumerate() {
                let su = availability.unit();
                store.hold(uid, su.sunum)?;
                let (UnitAvailability::Retrieving(_), Some(tape)) = (availability, &su.tape) else {
                    continue;
                };
                let uids = waiters.entry(su.sunum).or_default();
                if !uids.contains(&uid) {
                    uids.push(uid);
                    waiting += 1;
                    tapes.push(tape.tape_id.clone());
                }

                let key = (tape.tape_id.clone(), tape.file_number);
                let queued = wanted.get(&key).is_some_and(|s| s.contains(&su.sunum));
                if queued || reading.contains_key(&su.sunum) {
                    continue;
                }
                let sunums = wanted.entry(key).or_default();
                sunums.push(su.sunum);
                if sunums.len() == 1 {
                    let mut entry =
                        TqEntry::read(uid, ds_index as u64, &tape.tape_id, tape.file_number);
                    entry.user = user.clone();
                    queue.insert_rd_sorted(entry);
                }
            }
            if waiting > 0 {
                let counts = store.offline_counts();
                counts.add(uid, waiting);
                for tape_id in &tapes {
                    counts.add_tape(uid, tape_id);
                }
            }
            found
        };
        self.dispatch_reads(cancel).await?;
        Ok(found)
    }

    fn user_of(&self, uid: u64) -> String {
        self.sessions
            .lock()
            .open
            .get(&uid)
            .map(|s| s.user.clone())
            .unwrap_or_default()
    }

    /// Hand queued reads to the drive manager, one tape at a time
    ///
    /// On a submission error every read taken off the queue and not yet
    /// submitted goes back to the needed queue before the error returns.
    async fn dispatch_reads(&self, cancel: &CancelToken) -> ServiceResult<()> {
        loop {
            let batch = {
                let mut queue = self.queue.lock();
                let Some(tape) = queue.front(QueueKind::Read).map(|e| e.tape_id.clone()) else {
                    return Ok(());
                };
                queue.take_for_tape(&tape)
            };

            let mut batch = batch.into_iter();
            while let Some(entry) = batch.next() {
                let key = (entry.tape_id.clone(), entry.file_number);
                let Some(sunums) = self.wanted.lock().remove(&key) else {
                    continue;
                };
                if let Err(e) = self.submit_file_reads(&entry, sunums, cancel).await {
                    let mut queue = self.queue.lock();
                    for rest in batch {
                        queue.insert_rd_need(rest);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Submit the reads of every wanted unit in one tape file
    async fn submit_file_reads(
        &self,
        entry: &TqEntry,
        sunums: Vec<Sunum>,
        cancel: &CancelToken,
    ) -> ServiceResult<()> {
        let limit = Duration::from_secs(self.config.archive.submit_timeout_secs);
        let mut rejected = Vec::new();
        let mut sunums = sunums.into_iter();

        while let Some(sunum) = sunums.next() {
            let su = match self.store.lock().info(sunum) {
                Ok(su) => su,
                Err(e) => {
                    tracing::warn!(sunum, "Dropping read: {}", e);
                    continue;
                }
            };
            let request = ReadRequest {
                uid: entry.uid,
                ds_index: entry.ds_index,
                sunum,
                tape_id: entry.tape_id.clone(),
                file_number: entry.file_number,
                wd: su.wd,
            };
            self.reading.lock().insert(sunum, entry.clone());
            let status =
                match submit_with_timeout(self.drive.submit_read(request), limit, cancel).await {
                    Ok(status) => status,
                    Err(e) => {
                        self.reading.lock().remove(&sunum);
                        rejected.push(sunum);
                        rejected.extend(sunums);
                        self.park_reads(entry, rejected);
                        return Err(e);
                    }
                };
            match status {
                SubmitStatus::Accepted | SubmitStatus::Pending => {}
                other => {
                    tracing::warn!(
                        sunum,
                        tape_id = %entry.tape_id,
                        "Read not accepted ({:?}), keeping it as needed",
                        other
                    );
                    self.reading.lock().remove(&sunum);
                    rejected.push(sunum);
                }
            }
        }
        self.park_reads(entry, rejected);
        Ok(())
    }

    /// Keep unsubmitted reads of a tape file on the needed queue
    fn park_reads(&self, entry: &TqEntry, sunums: Vec<Sunum>) {
        if sunums.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        let key = (entry.tape_id.clone(), entry.file_number);
        self.wanted.lock().entry(key).or_default().extend(sunums);
        queue.insert_rd_need(entry.clone());
    }

    /// Requeue reads the drive manager turned away earlier; returns the
    /// number of units requeued
    pub async fn retry_needed_reads(&self, cancel: &CancelToken) -> ServiceResult<usize> {
        let moved = {
            let mut queue = self.queue.lock();
            let wanted = self.wanted.lock();
            let mut moved = 0;
            while let Some(entry) = queue.delete_front(QueueKind::ReadNeed) {
                let key = (entry.tape_id.clone(), entry.file_number);
                moved += wanted.get(&key).map_or(0, Vec::len);
                queue.insert_rd_sorted(entry);
            }
            moved
        };
        if moved > 0 {
            self.dispatch_reads(cancel).await?;
        }
        Ok(moved)
    }

    /// Settle a finished tape read
    pub fn on_read_complete(&self, outcome: &ReadOutcome) -> ServiceResult<()> {
        let mut store = self.store.lock();
        let uids = self
            .waiters
            .lock()
            .remove(&outcome.sunum)
            .unwrap_or_default();
        if self.reading.lock().remove(&outcome.sunum).is_none() {
            tracing::warn!(sunum = outcome.sunum, "Completion for a read not in progress");
        }
        if outcome.status == 0 {
            store.retrieve_complete(outcome.sunum, now())?;
        } else {
            tracing::error!(sunum = outcome.sunum, status = outcome.status, "Tape read failed");
            store.retrieve_failed(outcome.sunum)?;
        }
        for uid in uids {
            if let Some(left) = store.offline_counts().decrement(uid) {
                tracing::debug!(uid, left, "Read finished");
            }
        }
        Ok(())
    }

    /// Submit archive batches; the first pass of a run submits up to
    /// `initial_chunk` of them
    pub async fn archive_tick(&self, cancel: &CancelToken) -> ServiceResult<ArchiveRun> {
        self.submit_batches(self.config.archive.initial_chunk, cancel).await
    }

    async fn submit_batches(&self, chunk: usize, cancel: &CancelToken) -> ServiceResult<ArchiveRun> {
        let _gate = self.archive_gate.lock().await;
        let plan = {
            let mut store = self.store.lock();
            self.batcher.lock().plan(&mut store)?
        };
        let mut run = ArchiveRun {
            abandoned: plan.abandoned,
            reclassified: plan.reclassified,
            missing: plan.missing,
            ..Default::default()
        };
        let limit = Duration::from_secs(self.config.archive.submit_timeout_secs);

        for request in plan.batches {
            if run.submitted.len() >= chunk {
                break;
            }
            let first = request.first_sunum();
            let status =
                match submit_with_timeout(self.drive.submit_write(request.clone()), limit, cancel)
                    .await
                {
                    Ok(status) => status,
                    Err(ServiceError::Cancelled) => {
                        // The drive manager may have it; never submit it again
                        self.batcher
                            .lock()
                            .record_submit(request, SubmitStatus::Pending)?;
                        return Err(ServiceError::Cancelled);
                    }
                    Err(e) => return Err(e),
                };
            if self.batcher.lock().record_submit(request, status)? {
                run.submitted.extend(first);
            }
        }
        Ok(run)
    }

    /// Settle a finished tape write and submit the next batch
    pub async fn on_write_complete(
        &self,
        outcome: &WriteOutcome,
        cancel: &CancelToken,
    ) -> ServiceResult<ArchiveRun> {
        {
            let mut store = self.store.lock();
            self.batcher.lock().complete_write(&mut store, outcome, now())?;
        }
        self.submit_batches(1, cancel).await
    }

    /// Inventory the tape library
    pub async fn inventory(&self) -> ServiceResult<LibrarySnapshot> {
        match &self.robot {
            Some(robot) => robot.inventory().await,
            None => Err(SumsError::ServiceOffline.into()),
        }
    }

    /// One reclaim pass on the blocking pool
    pub async fn reclaim(self: &Arc<Self>) -> ServiceResult<ReclaimReport> {
        let svc = Arc::clone(self);
        tokio::task::spawn_blocking(move || svc.reclaim_blocking()).await?
    }

    fn reclaim_blocking(&self) -> ServiceResult<ReclaimReport> {
        let mut store = self.store.lock();
        let c = self.reclaimer.config();
        if let Err(e) = store
            .partitions_mut()
            .sync_filesystem(c.offline_below, c.online_above)
        {
            tracing::warn!("Partition refresh failed: {}", e);
        }
        Ok(self.reclaimer.run_once(&mut store, now())?)
    }

    /// Serve drive events, archive ticks and reclaim passes until cancelled
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<DriveEvent>,
        cancel: CancelToken,
    ) -> ServiceResult<()> {
        let sleep = Duration::from_secs(self.config.reclaim.sleep_secs.max(1));
        let mut ticks = tokio::time::interval(sleep);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(DriveEvent::Write(outcome)) => {
                        if let Err(e) = self.on_write_complete(&outcome, &cancel).await {
                            tracing::error!(group = outcome.group_id, "Write completion: {}", e);
                        }
                    }
                    Some(DriveEvent::Read(outcome)) => {
                        if let Err(e) = self.on_read_complete(&outcome) {
                            tracing::error!(sunum = outcome.sunum, "Read completion: {}", e);
                        }
                    }
                    None => {
                        tracing::warn!("Drive manager channel closed");
                        break;
                    }
                },
                _ = ticks.tick() => {
                    match self.archive_tick(&cancel).await {
                        Ok(run) if !run.submitted.is_empty() => {
                            tracing::info!("Archive tick submitted {} batches", run.submitted.len());
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("Archive tick: {}", e),
                    }
                    if let Err(e) = self.reclaim().await {
                        tracing::error!("Reclaim: {}", e);
                    }
                }
            }
        }
        tracing::info!("Service loop stopped");
        Ok(())
    }
}
