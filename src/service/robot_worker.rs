//! Dedicated thread for the tape robot
//!
//! Inventories and tape moves take seconds each. They run one at a time on
//! a thread that owns the [`TapeLibrary`], fed through a crossbeam channel;
//! answers come back on oneshot channels so async callers never block.

use crate::core::config::LibraryConfig;
use crate::core::tape::{
    LibrarySnapshot, MemoryCatalog, MtxRobot, RobotExecutor, SimulatedRobot, TapeLibrary,
    Verification, VerifyAction,
};
use crate::error::Result;
use crate::service::error::{ServiceError, ServiceResult};
use crossbeam::channel::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;

/// Inventory attempts before a wrong slot count is reported
const INVENTORY_ATTEMPTS: u32 = 3;

/// Time limit for inventories and moves
const ROBOT_TIMEOUT: Duration = Duration::from_secs(600);

type Reply<T> = oneshot::Sender<Result<T>>;

enum RobotJob {
    Inventory(Reply<LibrarySnapshot>),
    Reinventory(Reply<LibrarySnapshot>),
    Load {
        slot: usize,
        drive: usize,
        reply: Reply<Verification>,
    },
    Unload {
        drive: usize,
        slot: usize,
        reply: Reply<Verification>,
    },
    Transfer {
        from: usize,
        to: usize,
        reply: Reply<Verification>,
    },
    FreeAllDrives(Reply<LibrarySnapshot>),
    Snapshot(Reply<LibrarySnapshot>),
}

/// Handle to the robot thread
#[derive(Debug)]
pub struct RobotWorker {
    jobs: Option<Sender<RobotJob>>,
    handle: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl RobotWorker {
    /// Start a worker for the configured library (real or simulated)
    pub fn start(config: &LibraryConfig) -> Result<Self> {
        let robot: Box<dyn RobotExecutor> = if config.simulate {
            Box::new(SimulatedRobot::new(config)?)
        } else {
            Box::new(MtxRobot::new(config))
        };
        Self::with_library(TapeLibrary::new(config.clone(), robot))
    }

    /// Start a worker owning `library`
    pub fn with_library(library: TapeLibrary) -> Result<Self> {
        let (jobs, rx) = channel::unbounded::<RobotJob>();
        let handle = thread::Builder::new()
            .name("sums-robot".into())
            .spawn(move || {
                let mut library = library;
                let mut catalog = MemoryCatalog::new();
                for job in rx {
                    run_job(&mut library, &mut catalog, job);
                }
                tracing::debug!("Robot worker stopped");
            })?;
        Ok(RobotWorker {
            jobs: Some(jobs),
            handle: Some(handle),
            timeout: ROBOT_TIMEOUT,
        })
    }

    /// Override the time limit for robot operations
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call<T>(&self, job: impl FnOnce(Reply<T>) -> RobotJob) -> ServiceResult<T> {
        let (tx, rx) = oneshot::channel();
        let jobs = self.jobs.as_ref().ok_or(ServiceError::ChannelClosed)?;
        jobs.send(job(tx)).map_err(|_| ServiceError::ChannelClosed)?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer?),
            Ok(Err(_)) => Err(ServiceError::ChannelClosed),
            Err(_) => Err(ServiceError::Timeout),
        }
    }

    /// Full inventory, retried while the slot count is wrong
    pub async fn inventory(&self) -> ServiceResult<LibrarySnapshot> {
        self.call(RobotJob::Inventory).await
    }

    pub async fn reinventory(&self) -> ServiceResult<LibrarySnapshot> {
        self.call(RobotJob::Reinventory).await
    }

    pub async fn load(&self, slot: usize, drive: usize) -> ServiceResult<Verification> {
        self.call(|reply| RobotJob::Load { slot, drive, reply }).await
    }

    pub async fn unload(&self, drive: usize, slot: usize) -> ServiceResult<Verification> {
        self.call(|reply| RobotJob::Unload { drive, slot, reply }).await
    }

    pub async fn transfer(&self, from: usize, to: usize) -> ServiceResult<Verification> {
        self.call(|reply| RobotJob::Transfer { from, to, reply }).await
    }

    pub async fn free_all_drives(&self) -> ServiceResult<LibrarySnapshot> {
        self.call(RobotJob::FreeAllDrives).await
    }

    pub async fn snapshot(&self) -> ServiceResult<LibrarySnapshot> {
        self.call(RobotJob::Snapshot).await
    }
}

impl Drop for RobotWorker {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_job(library: &mut TapeLibrary, catalog: &mut MemoryCatalog, job: RobotJob) {
    match job {
        RobotJob::Inventory(reply) => {
            let result = library
                .inventory_with_retry(Some(catalog), INVENTORY_ATTEMPTS)
                .map(|()| library.snapshot());
            if let Ok(snapshot) = &result {
                for tape in library.duplicate_tapes() {
                    tracing::error!("Tape {} seen in more than one place", tape);
                }
                tracing::info!("Inventory: {} empty slots", snapshot.empty_slots);
            }
            let _ = reply.send(result);
        }
        RobotJob::Reinventory(reply) => {
            let _ = reply.send(library.reinventory().map(|()| library.snapshot()));
        }
        RobotJob::Load { slot, drive, reply } => {
            let result = library
                .slot_to_drive(slot, drive)
                .map(|()| library.verify(VerifyAction::Load { slot, drive }));
            let _ = reply.send(result);
        }
        RobotJob::Unload { drive, slot, reply } => {
            let result = library
                .drive_to_slot(drive, slot)
                .map(|()| library.verify(VerifyAction::Unload { drive, slot }));
            let _ = reply.send(result);
        }
        RobotJob::Transfer { from, to, reply } => {
            let result = library
                .slot_to_slot(from, to)
                .map(|()| library.verify(VerifyAction::Transfer { from, to }));
            let _ = reply.send(result);
        }
        RobotJob::FreeAllDrives(reply) => {
            let _ = reply.send(library.free_all_drives().map(|()| library.snapshot()));
        }
        RobotJob::Snapshot(reply) => {
            let _ = reply.send(Ok(library.snapshot()));
        }
    }
}
