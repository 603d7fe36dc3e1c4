//! Support for caching and keeping send & receive window.
//!
//! All positions in this module are offsets in the sequence space counted from the initial
//! sequence number, which never wrap. The connection converts them from and to `SeqNum`s.

use std::cmp::{max, min};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Represents a queue cache. The `Queue` holds continuous bytes from the oldest unacknowledged
/// byte to the last byte written by the application. The `Queue` is used as the send buffer of a
/// TCP connection.
#[derive(Debug)]
pub struct Queue {
    buffer: VecDeque<u8>,
    capacity: usize,
    offset: u64,
}

impl Queue {
    /// Creates a new `Queue` with the specified capacity, beginning at the given offset.
    pub fn with_capacity(capacity: usize, offset: u64) -> Queue {
        Queue {
            buffer: VecDeque::new(),
            capacity,
            offset,
        }
    }

    /// Appends as many bytes as possible to the end of the queue and returns the size appended.
    pub fn append(&mut self, payload: &[u8]) -> usize {
        let size = min(self.remaining(), payload.len());
        self.buffer.extend(&payload[..size]);

        size
    }

    /// Invalidates queue to the certain offset.
    pub fn invalidate_to(&mut self, offset: u64) {
        if offset <= self.offset {
            return;
        }
        let size = min((offset - self.offset) as usize, self.buffer.len());
        self.buffer.drain(..size);
        self.offset = offset;
    }

    /// Returns the payload from the certain offset of the queue in at most the given size.
    pub fn get(&self, offset: u64, size: usize) -> Vec<u8> {
        if offset < self.offset || offset >= self.recv_next() {
            return Vec::new();
        }
        let begin = (offset - self.offset) as usize;
        let end = min(begin + size, self.buffer.len());

        self.buffer.range(begin..end).copied().collect()
    }

    /// Returns the offset of the first byte of the queue.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the offset after the last byte of the queue.
    pub fn recv_next(&self) -> u64 {
        self.offset + self.buffer.len() as u64
    }

    /// Returns the length of the queue.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns the remaining size of the queue.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    /// Returns the capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Represents a segment in flight.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Flight {
    /// Represents the offset after the last sequence number of the segment.
    pub end: u64,
    /// Represents when the segment was last sent.
    pub sent_at: Instant,
    /// Represents if the segment has been sent more than once.
    pub retransmitted: bool,
}

/// Represents the retransmission queue of a TCP connection. Segments are keyed by their beginning
/// offset so that they can be trimmed as acknowledgements advance.
#[derive(Debug, Default)]
pub struct Flights {
    flights: BTreeMap<u64, Flight>,
}

impl Flights {
    /// Creates a new `Flights`.
    pub fn new() -> Flights {
        Flights::default()
    }

    /// Records a segment in `[begin, end)` sent at the given instant.
    pub fn push(&mut self, begin: u64, end: u64, now: Instant) {
        if end <= begin {
            return;
        }
        self.flights.insert(
            begin,
            Flight {
                end,
                sent_at: now,
                retransmitted: false,
            },
        );
    }

    /// Acknowledges segments to the certain offset and returns the RTT measured from the latest
    /// segment fully acknowledged, unless that segment has been retransmitted (Karn's algorithm).
    pub fn acknowledge(&mut self, offset: u64, now: Instant) -> Option<Duration> {
        let mut rtt = None;

        while let Some((&begin, &flight)) = self.flights.iter().next() {
            if begin >= offset {
                break;
            }
            self.flights.remove(&begin);
            if flight.end <= offset {
                rtt = match flight.retransmitted {
                    true => None,
                    false => Some(now.saturating_duration_since(flight.sent_at)),
                };
            } else {
                // Partially acknowledged
                self.flights.insert(offset, flight);
                break;
            }
        }

        rtt
    }

    /// Marks the segment beginning at the certain offset as retransmitted at the given instant.
    pub fn retransmit(&mut self, begin: u64, now: Instant) -> Option<Flight> {
        let flight = self.flights.get_mut(&begin)?;
        flight.retransmitted = true;
        flight.sent_at = now;

        Some(*flight)
    }

    /// Returns the oldest segment in flight.
    pub fn first(&self) -> Option<(u64, Flight)> {
        self.flights.iter().next().map(|(&begin, &flight)| (begin, flight))
    }

    /// Returns the number of segments in flight.
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    /// Returns if there are no segments in flight.
    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    /// Removes all segments in flight.
    pub fn clear(&mut self) {
        self.flights.clear();
    }
}

/// Represents a window cache. The `Window` holds discontinuous bytes and pops them out when they
/// are completed. The `Window` is used as the reassembly buffer of a TCP connection.
#[derive(Debug)]
pub struct Window {
    offset: u64,
    /// Represents filled ranges which are neither overlapped nor adjacent.
    edges: BTreeMap<u64, Vec<u8>>,
    /// Represents the beginning of the range updated most recently.
    latest: Option<u64>,
}

impl Window {
    /// Creates a new `Window` expecting the given offset.
    pub fn new(offset: u64) -> Window {
        Window {
            offset,
            edges: BTreeMap::new(),
            latest: None,
        }
    }

    /// Appends some bytes to the window and returns continuous bytes from the expected offset.
    pub fn append(&mut self, offset: u64, payload: &[u8]) -> Option<Vec<u8>> {
        // Trim bytes already popped
        let (mut begin, mut payload) = match offset < self.offset {
            true => {
                let skip = (self.offset - offset) as usize;
                if skip >= payload.len() {
                    return None;
                }
                (self.offset, payload[skip..].to_vec())
            }
            false => (offset, payload.to_vec()),
        };
        if payload.is_empty() {
            return None;
        }

        // Merge the previous range
        let prev = self
            .edges
            .range(..=begin)
            .next_back()
            .map(|(&key, value)| (key, key + value.len() as u64));
        if let Some((key, end)) = prev {
            if end >= begin {
                if let Some(value) = self.edges.remove(&key) {
                    let merged = merge(key, value, begin, payload);
                    begin = merged.0;
                    payload = merged.1;
                }
            }
        }

        // Merge the next ranges
        loop {
            let end = begin + payload.len() as u64;
            let next = self
                .edges
                .range(begin..=end)
                .next()
                .map(|(&key, _)| key);
            match next {
                Some(key) => {
                    if let Some(value) = self.edges.remove(&key) {
                        let merged = merge(begin, payload, key, value);
                        begin = merged.0;
                        payload = merged.1;
                    }
                }
                None => break,
            }
        }

        // Pop if possible
        if begin == self.offset {
            self.offset += payload.len() as u64;
            self.latest = None;

            return Some(payload);
        }

        self.edges.insert(begin, payload);
        self.latest = Some(begin);

        None
    }

    /// Returns the expected offset of the window.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the size of the bytes held out of order.
    pub fn len(&self) -> usize {
        self.edges.values().map(|v| v.len()).sum()
    }

    /// Returns if no bytes are held.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Returns the end of the last range held.
    pub fn end(&self) -> u64 {
        self.edges
            .iter()
            .next_back()
            .map(|(&key, value)| key + value.len() as u64)
            .unwrap_or(self.offset)
    }

    /// Returns the filled edges of the window as `[begin, end)`, the most recently updated first.
    pub fn filled(&self) -> Vec<(u64, u64)> {
        let mut v = self
            .edges
            .iter()
            .map(|(&key, value)| (key, key + value.len() as u64))
            .collect::<Vec<_>>();
        if let Some(latest) = self.latest {
            if let Some(i) = v.iter().position(|(begin, _)| *begin == latest) {
                let edge = v.remove(i);
                v.insert(0, edge);
            }
        }

        v
    }
}

/// Merges two overlapping or adjacent ranges. Bytes of the first range win where they overlap.
fn merge(a_begin: u64, a: Vec<u8>, b_begin: u64, b: Vec<u8>) -> (u64, Vec<u8>) {
    let begin = min(a_begin, b_begin);
    let end = max(a_begin + a.len() as u64, b_begin + b.len() as u64);
    let mut v = vec![0u8; (end - begin) as usize];

    let b_pos = (b_begin - begin) as usize;
    v[b_pos..b_pos + b.len()].copy_from_slice(&b);
    let a_pos = (a_begin - begin) as usize;
    v[a_pos..a_pos + a.len()].copy_from_slice(&a);

    (begin, v)
}

#[test]
fn queue_append_and_invalidate() {
    let mut q = Queue::with_capacity(9, 1);

    let v = (0..8).collect::<Vec<u8>>();
    assert_eq!(q.append(&v), 8);
    assert_eq!(q.recv_next(), 9);

    q.invalidate_to(3);
    assert_eq!(q.len(), 6);
    assert_eq!(q.get(3, 2), vec![2, 3]);

    let v = (8..15).collect::<Vec<u8>>();
    assert_eq!(q.append(&v), 3);
    assert_eq!(q.get(3, 100), vec![2, 3, 4, 5, 6, 7, 8, 9, 10]);
    assert_eq!(q.remaining(), 0);
}

#[test]
fn queue_get_out_of_range() {
    let mut q = Queue::with_capacity(16, 10);
    q.append(&[1, 2, 3]);
    assert!(q.get(9, 1).is_empty());
    assert!(q.get(13, 1).is_empty());
    q.invalidate_to(100);
    assert!(q.is_empty());
    assert_eq!(q.offset(), 100);
}

#[test]
fn flights_acknowledge() {
    let now = Instant::now();
    let mut f = Flights::new();
    f.push(1, 101, now);
    f.push(101, 201, now + Duration::from_millis(10));
    f.push(201, 301, now + Duration::from_millis(20));

    let rtt = f.acknowledge(201, now + Duration::from_millis(50));
    assert_eq!(rtt, Some(Duration::from_millis(40)));
    assert_eq!(f.len(), 1);

    // Partially acknowledged
    assert_eq!(f.acknowledge(250, now + Duration::from_millis(60)), None);
    assert_eq!(f.first().map(|(begin, flight)| (begin, flight.end)), Some((250, 301)));
}

#[test]
fn flights_karn() {
    let now = Instant::now();
    let mut f = Flights::new();
    f.push(0, 1, now);
    f.retransmit(0, now + Duration::from_secs(1));
    assert_eq!(f.acknowledge(1, now + Duration::from_secs(2)), None);
    assert!(f.is_empty());
}

#[test]
fn window_append_in_order() {
    let mut w = Window::new(1);
    assert_eq!(w.append(1, &[1, 2, 3]), Some(vec![1, 2, 3]));
    assert_eq!(w.offset(), 4);
    assert!(w.is_empty());
}

#[test]
fn window_append_out_of_order() {
    let mut w = Window::new(0);
    assert_eq!(w.append(8, &[8, 9]), None);
    assert_eq!(w.append(4, &[4, 5]), None);
    assert_eq!(w.filled(), vec![(4, 6), (8, 10)]);
    assert_eq!(w.append(12, &[12]), None);
    assert_eq!(w.filled(), vec![(12, 13), (4, 6), (8, 10)]);
    assert_eq!(w.len(), 5);

    assert_eq!(w.append(6, &[6, 7]), None);
    assert_eq!(w.filled(), vec![(4, 10), (12, 13)]);

    assert_eq!(
        w.append(0, &[0, 1, 2, 3, 4]),
        Some(vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9])
    );
    assert_eq!(w.offset(), 10);
    assert_eq!(w.filled(), vec![(12, 13)]);
}

#[test]
fn window_append_duplicate() {
    let mut w = Window::new(0);
    assert_eq!(w.append(0, &[0, 1]), Some(vec![0, 1]));
    assert_eq!(w.append(0, &[0, 1]), None);
    assert_eq!(w.append(1, &[1, 2, 3]), Some(vec![2, 3]));
    assert_eq!(w.append(6, &[6, 7, 8]), None);
    assert_eq!(w.append(5, &[5, 6, 7, 8, 9]), None);
    assert_eq!(w.filled(), vec![(5, 10)]);
    assert_eq!(w.end(), 10);
}
