//! Drive request queues
//!
//! Reads are kept in ascending file-number order so a mounted tape is read
//! front to back. The `*_need` queues remember tape files a request still
//! needs and hold each `(tape_id, file_number)` at most once.

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Which queue an entry lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    Read,
    Write,
    ReadNeed,
    WriteNeed,
}

/// One queued tape request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TqEntry {
    /// Session that issued the request
    pub uid: u64,
    /// Index of the unit within the request
    pub ds_index: u64,
    pub tape_id: String,
    pub file_number: i32,
    pub user: String,
    /// Archive group, for writes
    pub group_id: Option<i32>,
}

impl TqEntry {
    pub fn read(uid: u64, ds_index: u64, tape_id: &str, file_number: i32) -> Self {
        TqEntry {
            uid,
            ds_index,
            tape_id: tape_id.to_string(),
            file_number,
            user: String::new(),
            group_id: None,
        }
    }

    pub fn write(uid: u64, ds_index: u64, group_id: i32) -> Self {
        TqEntry {
            uid,
            ds_index,
            tape_id: String::new(),
            file_number: 0,
            user: String::new(),
            group_id: Some(group_id),
        }
    }
}

/// The four request queues of a drive pool
#[derive(Debug, Clone, Default)]
pub struct TapeQueue {
    read: VecDeque<TqEntry>,
    write: VecDeque<TqEntry>,
    read_need: VecDeque<TqEntry>,
    write_need: VecDeque<TqEntry>,
}

impl TapeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: QueueKind) -> &VecDeque<TqEntry> {
        match kind {
            QueueKind::Read => &self.read,
            QueueKind::Write => &self.write,
            QueueKind::ReadNeed => &self.read_need,
            QueueKind::WriteNeed => &self.write_need,
        }
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut VecDeque<TqEntry> {
        match kind {
            QueueKind::Read => &mut self.read,
            QueueKind::Write => &mut self.write,
            QueueKind::ReadNeed => &mut self.read_need,
            QueueKind::WriteNeed => &mut self.write_need,
        }
    }

    /// Insert a read before the first entry with a higher file number
    pub fn insert_rd_sorted(&mut self, entry: TqEntry) {
        let at = self
            .read
            .iter()
            .position(|e| e.file_number > entry.file_number)
            .unwrap_or(self.read.len());
        self.read.insert(at, entry);
    }

    /// Remember a needed read unless that tape file is already remembered
    ///
    /// Returns false for a duplicate.
    pub fn insert_rd_need(&mut self, entry: TqEntry) -> bool {
        let dup = self
            .read_need
            .iter()
            .any(|e| e.tape_id == entry.tape_id && e.file_number == entry.file_number);
        if dup {
            tracing::debug!(
                tape_id = %entry.tape_id,
                file_number = entry.file_number,
                "Read already needed"
            );
            return false;
        }
        self.read_need.push_back(entry);
        true
    }

    pub fn push_back(&mut self, kind: QueueKind, entry: TqEntry) {
        self.queue_mut(kind).push_back(entry);
    }

    pub fn front(&self, kind: QueueKind) -> Option<&TqEntry> {
        self.queue(kind).front()
    }

    pub fn delete_front(&mut self, kind: QueueKind) -> Option<TqEntry> {
        self.queue_mut(kind).pop_front()
    }

    /// Remove the entry of request `uid`, unit `ds_index`
    pub fn delete(&mut self, kind: QueueKind, uid: u64, ds_index: u64) -> Option<TqEntry> {
        let q = self.queue_mut(kind);
        let at = q.iter().position(|e| e.uid == uid && e.ds_index == ds_index)?;
        q.remove(at)
    }

    /// Queued reads against `tape_id`, wherever they sit in the queue
    pub fn entries_for_tape<'a>(&'a self, tape_id: &'a str) -> impl Iterator<Item = &'a TqEntry> + 'a {
        self.read.iter().filter(move |e| e.tape_id == tape_id)
    }

    /// Take every queued read against `tape_id`, in file order
    pub fn take_for_tape(&mut self, tape_id: &str) -> Vec<TqEntry> {
        let (mine, rest): (VecDeque<TqEntry>, VecDeque<TqEntry>) =
            self.read.drain(..).partition(|e| e.tape_id == tape_id);
        self.read = rest;
        mine.into()
    }

    /// Drop every entry of session `uid`
    pub fn remove_uid(&mut self, uid: u64) -> usize {
        let mut removed = 0;
        for q in [
            &mut self.read,
            &mut self.write,
            &mut self.read_need,
            &mut self.write_need,
        ] {
            let before = q.len();
            q.retain(|e| e.uid != uid);
            removed += before - q.len();
        }
        removed
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.queue(kind).len()
    }

    pub fn is_empty(&self, kind: QueueKind) -> bool {
        self.queue(kind).is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct OfflineCount {
    offcnt: usize,
    tapes: AHashSet<String>,
}

/// Per-session count of units still waiting for a tape read
#[derive(Debug, Clone, Default)]
pub struct OfflineCounts {
    by_uid: AHashMap<u64, OfflineCount>,
}

impl OfflineCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting `offcnt` outstanding reads for `uid`
    pub fn set(&mut self, uid: u64, offcnt: usize) {
        self.by_uid.insert(
            uid,
            OfflineCount {
                offcnt,
                tapes: AHashSet::new(),
            },
        );
    }

    /// Count `n` more outstanding reads for `uid`, keeping its tapes
    pub fn add(&mut self, uid: u64, n: usize) {
        self.by_uid.entry(uid).or_default().offcnt += n;
    }

    /// Outstanding reads for `uid`
    pub fn get(&self, uid: u64) -> Option<usize> {
        self.by_uid.get(&uid).map(|c| c.offcnt)
    }

    /// Record that `uid` needs `tape_id`; returns false if already recorded
    pub fn add_tape(&mut self, uid: u64, tape_id: &str) -> bool {
        match self.by_uid.get_mut(&uid) {
            Some(c) => c.tapes.insert(tape_id.to_string()),
            None => false,
        }
    }

    /// Distinct tapes `uid` needs
    pub fn unique_tapes(&self, uid: u64) -> usize {
        self.by_uid.get(&uid).map_or(0, |c| c.tapes.len())
    }

    /// One read of `uid` finished; returns the reads still outstanding
    pub fn decrement(&mut self, uid: u64) -> Option<usize> {
        let c = self.by_uid.get_mut(&uid)?;
        c.offcnt = c.offcnt.saturating_sub(1);
        Some(c.offcnt)
    }

    pub fn remove(&mut self, uid: u64) -> bool {
        self.by_uid.remove(&uid).is_some()
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(q: &TapeQueue) -> Vec<i32> {
        q.read.iter().map(|e| e.file_number).collect()
    }

    #[test]
    fn test_insert_rd_sorted() {
        let mut q = TapeQueue::new();
        for (i, f) in [5, 2, 9, 2, 7].into_iter().enumerate() {
            q.insert_rd_sorted(TqEntry::read(1, i as u64, "T1", f));
        }
        assert_eq!(files(&q), vec![2, 2, 5, 7, 9]);
        // Equal file numbers keep arrival order
        let order: Vec<u64> = q.read.iter().map(|e| e.ds_index).collect();
        assert_eq!(&order[..2], &[1, 3]);
    }

    #[test]
    fn test_read_need_dedupe() {
        let mut q = TapeQueue::new();
        assert!(q.insert_rd_need(TqEntry::read(1, 0, "T1", 3)));
        assert!(!q.insert_rd_need(TqEntry::read(2, 0, "T1", 3)));
        assert!(q.insert_rd_need(TqEntry::read(2, 0, "T2", 3)));
        assert_eq!(q.len(QueueKind::ReadNeed), 2);
    }

    #[test]
    fn test_delete_single_and_middle() {
        let mut q = TapeQueue::new();
        q.push_back(QueueKind::Write, TqEntry::write(1, 0, 4));
        assert!(q.delete(QueueKind::Write, 1, 0).is_some());
        assert!(q.is_empty(QueueKind::Write));
        assert!(q.delete_front(QueueKind::Write).is_none());

        for i in 0..3 {
            q.push_back(QueueKind::Write, TqEntry::write(1, i, 4));
        }
        assert!(q.delete(QueueKind::Write, 1, 1).is_some());
        assert!(q.delete(QueueKind::Write, 1, 1).is_none());
        assert_eq!(q.delete_front(QueueKind::Write).unwrap().ds_index, 0);
        assert_eq!(q.front(QueueKind::Write).unwrap().ds_index, 2);
    }

    #[test]
    fn test_take_for_tape() {
        let mut q = TapeQueue::new();
        q.insert_rd_sorted(TqEntry::read(1, 0, "A", 4));
        q.insert_rd_sorted(TqEntry::read(1, 1, "B", 1));
        q.insert_rd_sorted(TqEntry::read(2, 0, "A", 2));
        assert_eq!(q.entries_for_tape("A").count(), 2);

        let taken = q.take_for_tape("A");
        assert_eq!(taken.iter().map(|e| e.file_number).collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(files(&q), vec![1]);
    }

    #[test]
    fn test_remove_uid() {
        let mut q = TapeQueue::new();
        q.insert_rd_sorted(TqEntry::read(1, 0, "A", 4));
        q.insert_rd_need(TqEntry::read(1, 1, "A", 5));
        q.push_back(QueueKind::Write, TqEntry::write(2, 0, 1));
        assert_eq!(q.remove_uid(1), 2);
        assert_eq!(q.len(QueueKind::Write), 1);
    }

    #[test]
    fn test_offline_counts() {
        let mut c = OfflineCounts::new();
        assert!(!c.add_tape(9, "T1"));
        c.set(9, 2);
        assert!(c.add_tape(9, "T1"));
        assert!(!c.add_tape(9, "T1"));
        assert!(c.add_tape(9, "T2"));
        assert_eq!(c.unique_tapes(9), 2);
        assert_eq!(c.decrement(9), Some(1));
        assert_eq!(c.decrement(9), Some(0));
        assert_eq!(c.decrement(9), Some(0));
        assert!(c.remove(9));
        assert_eq!(c.get(9), None);
        assert!(c.is_empty());

        // Adding keeps the tapes already recorded
        c.set(4, 1);
        c.add_tape(4, "T1");
        c.add(4, 2);
        assert_eq!(c.get(4), Some(3));
        assert_eq!(c.unique_tapes(4), 1);
        c.add(5, 1);
        assert_eq!(c.get(5), Some(1));
    }
}
