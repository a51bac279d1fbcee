//! Channel to the drive manager
//!
//! Submissions return as soon as the drive manager has answered; the tape
//! operation itself completes later as a [`DriveEvent`].

use crate::core::archive::{SubmitStatus, WriteOutcome, WriteRequest};
use crate::core::unit::Sunum;
use crate::error::Result;
use crate::service::cancel::CancelToken;
use crate::service::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Read of one tape file into a retrieval directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub uid: u64,
    pub ds_index: u64,
    pub sunum: Sunum,
    pub tape_id: String,
    pub file_number: i32,
    pub wd: PathBuf,
}

/// Completion of a read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOutcome {
    /// Zero on success
    pub status: i32,
    pub uid: u64,
    pub ds_index: u64,
    pub sunum: Sunum,
}

/// Completion delivered by the drive manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveEvent {
    Write(WriteOutcome),
    Read(ReadOutcome),
}

/// Drive manager submission trait
#[async_trait]
pub trait DriveChannel: Send + Sync {
    async fn submit_write(&self, request: WriteRequest) -> Result<SubmitStatus>;

    async fn submit_read(&self, request: ReadRequest) -> Result<SubmitStatus>;
}

/// Await a submission with a time limit and a cancellation token
///
/// Running out of time means the submission may still be in progress, so
/// it yields [`SubmitStatus::Pending`].
pub async fn submit_with_timeout<F>(
    submission: F,
    limit: Duration,
    cancel: &CancelToken,
) -> ServiceResult<SubmitStatus>
where
    F: Future<Output = Result<SubmitStatus>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ServiceError::Cancelled),
        answer = tokio::time::timeout(limit, submission) => match answer {
            Ok(status) => Ok(status?),
            Err(_) => Ok(SubmitStatus::Pending),
        },
    }
}

/// In-process drive manager
///
/// Accepts everything and completes each operation at once through the
/// event channel. Writes go to consecutive files of one tape.
#[derive(Debug)]
pub struct SimulatedDrive {
    tape_id: String,
    next_file: Mutex<i32>,
    events: mpsc::UnboundedSender<DriveEvent>,
}

impl SimulatedDrive {
    pub fn new(tape_id: &str) -> (Self, mpsc::UnboundedReceiver<DriveEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let drive = SimulatedDrive {
            tape_id: tape_id.to_string(),
            next_file: Mutex::new(1),
            events,
        };
        (drive, rx)
    }

    fn deliver(&self, event: DriveEvent) -> SubmitStatus {
        match self.events.send(event) {
            Ok(()) => SubmitStatus::Accepted,
            Err(_) => SubmitStatus::Offline,
        }
    }
}

#[async_trait]
impl DriveChannel for SimulatedDrive {
    async fn submit_write(&self, request: WriteRequest) -> Result<SubmitStatus> {
        let Some(first_sunum) = request.first_sunum() else {
            return Ok(SubmitStatus::Failed(-1));
        };
        let file_number = {
            let mut next = self.next_file.lock();
            let n = *next;
            *next += 1;
            n
        };
        tracing::debug!(
            tape_id = %self.tape_id,
            file_number,
            units = request.len(),
            "Simulated tape write"
        );
        Ok(self.deliver(DriveEvent::Write(WriteOutcome {
            status: 0,
            group_id: request.group_id,
            first_sunum,
            tape_id: self.tape_id.clone(),
            file_number,
        })))
    }

    async fn submit_read(&self, request: ReadRequest) -> Result<SubmitStatus> {
        let status = match std::fs::create_dir_all(&request.wd) {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!(sunum = request.sunum, "Simulated read failed: {}", e);
                1
            }
        };
        Ok(self.deliver(DriveEvent::Read(ReadOutcome {
            status,
            uid: request.uid,
            ds_index: request.ds_index,
            sunum: request.sunum,
        })))
    }
}
