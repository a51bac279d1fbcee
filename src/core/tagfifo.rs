//! Bounded FIFO with tagged claims
//!
//! Producers push `(tag, item)` pairs. A consumer either takes the oldest
//! item of any tag or waits for the oldest item carrying its own tag; items
//! of other tags stay queued for their consumers. Each item is handed to
//! exactly one consumer.
//!
//! Corking the queue refuses further pushes. Consumers keep draining what
//! is queued and then see `None`.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Retry interval for a consumer whose tag is not queued yet
const RETRY: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct State<T> {
    items: VecDeque<(u64, T)>,
    corked: bool,
}

/// Bounded multi-producer multi-consumer tagged queue
#[derive(Debug)]
pub struct TagFifo<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    /// Signalled when an item is pushed or the queue is corked
    not_empty: Condvar,
    /// Signalled when an item is taken
    not_full: Condvar,
}

impl<T> TagFifo<T> {
    /// Create a queue holding at most `capacity` items (at least one)
    pub fn new(capacity: usize) -> Self {
        TagFifo {
            state: Mutex::new(State {
                items: VecDeque::new(),
                corked: false,
            }),
            capacity: capacity.max(1),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Queue `item` under `tag`, blocking while the queue is full
    ///
    /// A corked queue hands the item back.
    pub fn push(&self, tag: u64, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.corked {
            self.not_full.wait(&mut state);
        }
        if state.corked {
            return Err(item);
        }
        state.items.push_back((tag, item));
        drop(state);
        self.not_empty.notify_all();
        Ok(())
    }

    fn take_tagged(&self, state: &mut State<T>, tag: u64) -> Option<T> {
        let at = state.items.iter().position(|(t, _)| *t == tag)?;
        let (_, item) = state.items.remove(at)?;
        self.not_full.notify_one();
        Some(item)
    }

    /// Oldest item tagged `tag`, if one is queued now
    pub fn try_pop_tagged(&self, tag: u64) -> Option<T> {
        let mut state = self.state.lock();
        self.take_tagged(&mut state, tag)
    }

    /// Wait for the oldest item tagged `tag`
    ///
    /// Returns `None` once the queue is corked and holds no item with this
    /// tag.
    pub fn pop_tagged(&self, tag: u64) -> Option<T> {
        loop {
            let mut state = self.state.lock();
            if let Some(item) = self.take_tagged(&mut state, tag) {
                return Some(item);
            }
            if state.corked {
                return None;
            }
            // Items of other tags belong to other consumers; wait for the
            // queue to change, then let them run before looking again
            self.not_empty.wait_for(&mut state, RETRY);
            drop(state);
            std::thread::yield_now();
        }
    }

    /// Wait for the oldest item of any tag
    ///
    /// Returns `None` once the queue is corked and empty.
    pub fn pop_any(&self) -> Option<(u64, T)> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(entry);
            }
            if state.corked {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Refuse further pushes and wake every waiter
    pub fn cork(&self) {
        self.state.lock().corked = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_corked(&self) -> bool {
        self.state.lock().corked
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order_within_tag() {
        let q = TagFifo::new(8);
        q.push(1, "a").unwrap();
        q.push(2, "b").unwrap();
        q.push(1, "c").unwrap();

        assert_eq!(q.pop_tagged(1), Some("a"));
        assert_eq!(q.pop_tagged(1), Some("c"));
        assert_eq!(q.try_pop_tagged(1), None);
        assert_eq!(q.pop_any(), Some((2, "b")));
        assert!(q.is_empty());
    }

    #[test]
    fn test_cork_drains_then_stops() {
        let q = TagFifo::new(4);
        q.push(7, 70).unwrap();
        q.cork();
        assert_eq!(q.push(7, 71), Err(71));
        assert_eq!(q.pop_tagged(3), None);
        assert_eq!(q.pop_any(), Some((7, 70)));
        assert_eq!(q.pop_any(), None);
    }

    #[test]
    fn test_push_blocks_while_full() {
        let q = Arc::new(TagFifo::new(1));
        q.push(0, 0).unwrap();

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(0, 1))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_any(), Some((0, 0)));
        producer.join().unwrap().unwrap();
        assert_eq!(q.pop_any(), Some((0, 1)));
    }

    #[test]
    fn test_waiting_consumer_gets_later_push() {
        let q = Arc::new(TagFifo::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop_tagged(5))
        };
        q.push(4, "other").unwrap();
        thread::sleep(Duration::from_millis(20));
        q.push(5, "mine").unwrap();
        assert_eq!(consumer.join().unwrap(), Some("mine"));
        assert_eq!(q.len(), 1);
    }
}
