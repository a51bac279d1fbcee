//! Concurrency tests for the tagged FIFO
//!
//! Many producers and consumers share a small queue; every item must reach
//! exactly one consumer of its tag, in push order per producer.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use sums::tagfifo::TagFifo;

const PRODUCERS: u64 = 4;
const TAGS: u64 = 3;
const ITEMS: u64 = 250;

#[test]
fn test_tagged_consumers_get_only_their_items() {
    let fifo = Arc::new(TagFifo::<(u64, u64)>::new(8));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                for seq in 0..ITEMS {
                    fifo.push(seq % TAGS, (p, seq)).unwrap();
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..TAGS)
        .map(|tag| {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(item) = fifo.pop_tagged(tag) {
                    got.push(item);
                }
                (tag, got)
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    fifo.cork();

    let mut seen = HashSet::new();
    for c in consumers {
        let (tag, got) = c.join().unwrap();
        let mut last = vec![None; PRODUCERS as usize];
        for (p, seq) in got {
            assert_eq!(seq % TAGS, tag);
            assert!(seen.insert((p, seq)), "item {:?} delivered twice", (p, seq));
            // Items from one producer arrive in push order
            assert!(last[p as usize].map_or(true, |prev| prev < seq));
            last[p as usize] = Some(seq);
        }
    }
    assert_eq!(seen.len() as u64, PRODUCERS * ITEMS);
    assert!(fifo.is_empty());
}

#[test]
fn test_competing_consumers_share_one_tag() {
    let fifo = Arc::new(TagFifo::<u64>::new(4));

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                let mut got = Vec::new();
                while let Some((_, item)) = fifo.pop_any() {
                    got.push(item);
                }
                got
            })
        })
        .collect();

    for i in 0..600 {
        fifo.push(7, i).unwrap();
    }
    fifo.cork();
    assert_eq!(fifo.push(7, 600), Err(600));

    let mut all: Vec<u64> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..600).collect::<Vec<_>>());
}

#[test]
fn test_cork_releases_blocked_producer() {
    let fifo = Arc::new(TagFifo::<u32>::new(1));
    fifo.push(1, 10).unwrap();

    let blocked = {
        let fifo = Arc::clone(&fifo);
        thread::spawn(move || fifo.push(1, 11))
    };
    thread::sleep(std::time::Duration::from_millis(20));
    fifo.cork();
    assert_eq!(blocked.join().unwrap(), Err(11));

    // Queued work still drains after corking
    assert_eq!(fifo.pop_tagged(1), Some(10));
    assert_eq!(fifo.pop_tagged(1), None);
}
