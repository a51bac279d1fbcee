//! Archive batching
//!
//! Walks the archive-pending list (descending group id) and cuts it into
//! tape write requests. A batch grows while its units share a group, until
//! it reaches the tar-file size target or the per-request unit cap; only
//! batches closed that way are written. A batch cut short by a new group or
//! by the end of the list stays archive-pending for a later pass, so tape
//! files are never fragmented.
//!
//! Submissions are asynchronous. Each accepted batch stays outstanding,
//! keyed by its first sunum, until its completion arrives; its units are not
//! batched again meanwhile.

use crate::core::config::ArchiveConfig;
use crate::core::unit::{ArchiveSubtype, Sunum, UnitStore};
use crate::error::{Result, SumsError};
use ahash::{AHashMap, AHashSet};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One unit in a write request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteEntry {
    pub sunum: Sunum,
    pub wd: PathBuf,
    pub bytes: f64,
    pub group_id: i32,
    pub archive_subtype: ArchiveSubtype,
}

/// Batch descriptor sent to the drive manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub group_id: i32,
    pub entries: Vec<WriteEntry>,
    pub total_bytes: f64,
}

impl WriteRequest {
    fn new(group_id: i32) -> Self {
        WriteRequest {
            group_id,
            entries: Vec::new(),
            total_bytes: 0.0,
        }
    }

    fn push(&mut self, entry: WriteEntry) {
        self.total_bytes += entry.bytes;
        self.entries.push(entry);
    }

    /// Key of the batch while it is outstanding
    pub fn first_sunum(&self) -> Option<Sunum> {
        self.entries.first().map(|e| e.sunum)
    }

    pub fn sunums(&self) -> Vec<Sunum> {
        self.entries.iter().map(|e| e.sunum).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Drive manager's answer to a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitStatus {
    Accepted,
    /// No answer in time; the write may still happen
    Pending,
    NoTapeInGroup,
    Offline,
    Failed(i32),
}

/// Completion of a submitted write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// Zero on success
    pub status: i32,
    pub group_id: i32,
    pub first_sunum: Sunum,
    pub tape_id: String,
    pub file_number: i32,
}

impl WriteOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == 0
    }
}

/// Synchronous write submission
pub trait WriteSubmitter {
    fn submit(&mut self, request: &WriteRequest) -> SubmitStatus;
}

/// What one batching pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveRun {
    /// First sunums of the batches submitted
    pub submitted: Vec<Sunum>,
    /// Units left archive-pending in undersized batches
    pub abandoned: usize,
    /// Do-not-archive units moved to delete-pending
    pub reclassified: usize,
    /// Units skipped because their directory is gone
    pub missing: usize,
}

/// Batches returned by [`ArchiveBatcher::plan`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchivePlan {
    pub batches: Vec<WriteRequest>,
    pub abandoned: usize,
    pub reclassified: usize,
    pub missing: usize,
}

/// Archive batching state
#[derive(Debug)]
pub struct ArchiveBatcher {
    config: ArchiveConfig,
    /// Submitted batches by first sunum
    outstanding: AHashMap<Sunum, WriteRequest>,
    in_flight: AHashSet<Sunum>,
}

impl ArchiveBatcher {
    pub fn new(config: ArchiveConfig) -> Self {
        ArchiveBatcher {
            config,
            outstanding: AHashMap::new(),
            in_flight: AHashSet::new(),
        }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Batches submitted and not yet completed
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, first_sunum: Sunum) -> bool {
        self.outstanding.contains_key(&first_sunum)
    }

    fn is_full(&self, batch: &WriteRequest) -> bool {
        batch.total_bytes >= self.config.tar_file_size as f64
            || batch.len() >= self.config.max_request_units
    }

    /// Cut the archive-pending list into full batches
    ///
    /// Do-not-archive units are moved to delete-pending on the way.
    pub fn plan(&self, store: &mut UnitStore) -> Result<ArchivePlan> {
        let mut plan = ArchivePlan::default();
        let pending: Vec<_> = store.archive_pending().iter().cloned().collect();
        let mut batch: Option<WriteRequest> = None;

        for unit in pending {
            if self.in_flight.contains(&unit.sunum) {
                continue;
            }
            if unit.archive_subtype == ArchiveSubtype::DoNotArchive {
                store.mark_delete_pending(unit.sunum, unit.effective_date)?;
                plan.reclassified += 1;
                continue;
            }
            if self.config.skip_missing_dirs && !unit.wd.is_dir() {
                tracing::warn!(sunum = unit.sunum, wd = %unit.wd.display(), "Skipping missing dir");
                plan.missing += 1;
                continue;
            }

            if let Some(current) = batch.as_ref() {
                if current.group_id != unit.group_id {
                    tracing::debug!(
                        group = current.group_id,
                        bytes = current.total_bytes,
                        "Leaving undersized batch for a later pass"
                    );
                    plan.abandoned += current.len();
                    batch = None;
                }
            }
            let current = batch.get_or_insert_with(|| WriteRequest::new(unit.group_id));
            current.push(WriteEntry {
                sunum: unit.sunum,
                wd: unit.wd.clone(),
                bytes: unit.bytes,
                group_id: unit.group_id,
                archive_subtype: unit.archive_subtype,
            });
            if self.is_full(current) {
                if let Some(full) = batch.take() {
                    plan.batches.push(full);
                }
            }
        }
        if let Some(rest) = batch {
            plan.abandoned += rest.len();
        }
        Ok(plan)
    }

    /// Record how the drive manager answered a submission
    ///
    /// A missing tape for the group and an offline drive manager end the
    /// pass. Other failures are logged and the pass goes on.
    pub fn record_submit(&mut self, request: WriteRequest, status: SubmitStatus) -> Result<bool> {
        let first = match request.first_sunum() {
            Some(first) => first,
            None => return Ok(false),
        };
        match status {
            SubmitStatus::Accepted => {}
            SubmitStatus::Pending => {
                tracing::warn!(
                    group = request.group_id,
                    first_sunum = first,
                    "Write submit timed out, assuming pending"
                );
            }
            SubmitStatus::NoTapeInGroup => {
                tracing::error!(
                    group = request.group_id,
                    bytes = request.total_bytes,
                    "No tape in group"
                );
                return Err(SumsError::NoTapeInGroup(request.group_id));
            }
            SubmitStatus::Offline => {
                tracing::error!("Tape service offline");
                return Err(SumsError::ServiceOffline);
            }
            SubmitStatus::Failed(code) => {
                tracing::error!(
                    group = request.group_id,
                    bytes = request.total_bytes,
                    code,
                    "Write submit failed"
                );
                return Ok(false);
            }
        }
        tracing::info!(
            group = request.group_id,
            first_sunum = first,
            units = request.len(),
            bytes = request.total_bytes,
            "Write submitted"
        );
        self.in_flight.extend(request.entries.iter().map(|e| e.sunum));
        self.outstanding.insert(first, request);
        Ok(true)
    }

    /// Submit up to `chunk_count` full batches
    pub fn store_unit_arch(
        &mut self,
        store: &mut UnitStore,
        chunk_count: usize,
        submitter: &mut dyn WriteSubmitter,
    ) -> Result<ArchiveRun> {
        let plan = self.plan(store)?;
        let mut run = ArchiveRun {
            abandoned: plan.abandoned,
            reclassified: plan.reclassified,
            missing: plan.missing,
            ..Default::default()
        };
        let mut batches = plan.batches.into_iter();
        while run.submitted.len() < chunk_count {
            let Some(request) = batches.next() else { break };
            let first = request.first_sunum();
            let status = submitter.submit(&request);
            if self.record_submit(request, status)? {
                run.submitted.extend(first);
            }
        }
        Ok(run)
    }

    /// Settle a completed write
    ///
    /// On success the batch's units get their tape location; on failure
    /// they stay archive-pending and are batched again later.
    pub fn complete_write(
        &mut self,
        store: &mut UnitStore,
        outcome: &WriteOutcome,
        now: NaiveDateTime,
    ) -> Result<Option<WriteRequest>> {
        let request = match self.outstanding.remove(&outcome.first_sunum) {
            Some(request) => request,
            None => {
                tracing::warn!(
                    first_sunum = outcome.first_sunum,
                    "Completion for unknown write"
                );
                return Ok(None);
            }
        };
        let sunums = request.sunums();
        for sunum in &sunums {
            self.in_flight.remove(sunum);
        }

        if outcome.succeeded() {
            let settled =
                store.archive_complete(&sunums, &outcome.tape_id, outcome.file_number, now);
            if settled < sunums.len() {
                tracing::warn!(
                    group = outcome.group_id,
                    first_sunum = outcome.first_sunum,
                    "{} units of the batch changed while in flight",
                    sunums.len() - settled
                );
            }
        } else {
            tracing::error!(
                group = outcome.group_id,
                first_sunum = outcome.first_sunum,
                status = outcome.status,
                "Tape write failed"
            );
        }
        Ok(Some(request))
    }

    /// Settle a completed write and submit the next batch
    pub fn on_write_complete(
        &mut self,
        store: &mut UnitStore,
        outcome: &WriteOutcome,
        now: NaiveDateTime,
        submitter: &mut dyn WriteSubmitter,
    ) -> Result<ArchiveRun> {
        self.complete_write(store, outcome, now)?;
        self.store_unit_arch(store, 1, submitter)
    }
}
