//! Support for statistics.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Represents the counters of a TCP stack. All counters are monotonic.
#[derive(Debug, Default)]
pub struct Stats {
    segments_received: AtomicUsize,
    segments_sent: AtomicUsize,
    malformed: AtomicUsize,
    checksum: AtomicUsize,
    resets_sent: AtomicUsize,
    established: AtomicUsize,
    accepted: AtomicUsize,
    backlog_refused: AtomicUsize,
    retransmissions: AtomicUsize,
}

/// Enumeration of counters in `Stats`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Counter {
    /// Represents segments decoded successfully.
    SegmentsReceived,
    /// Represents segments handed to the network layer.
    SegmentsSent,
    /// Represents segments dropped for structural violations.
    Malformed,
    /// Represents segments dropped for invalid checksums.
    Checksum,
    /// Represents resets sent.
    ResetsSent,
    /// Represents connections reaching ESTABLISHED.
    Established,
    /// Represents connections handed to listeners.
    Accepted,
    /// Represents synchronizations refused because the backlog is full.
    BacklogRefused,
    /// Represents segments retransmitted.
    Retransmissions,
}

impl Stats {
    /// Creates a new `Stats`.
    pub fn new() -> Stats {
        Stats::default()
    }

    fn counter(&self, counter: Counter) -> &AtomicUsize {
        match counter {
            Counter::SegmentsReceived => &self.segments_received,
            Counter::SegmentsSent => &self.segments_sent,
            Counter::Malformed => &self.malformed,
            Counter::Checksum => &self.checksum,
            Counter::ResetsSent => &self.resets_sent,
            Counter::Established => &self.established,
            Counter::Accepted => &self.accepted,
            Counter::BacklogRefused => &self.backlog_refused,
            Counter::Retransmissions => &self.retransmissions,
        }
    }

    /// Increases the counter by `n`.
    pub fn add(&self, counter: Counter, n: usize) {
        self.counter(counter).fetch_add(n, Ordering::Relaxed);
    }

    /// Increases the counter by one.
    pub fn increase(&self, counter: Counter) {
        self.add(counter, 1);
    }

    /// Returns the value of the counter.
    pub fn get(&self, counter: Counter) -> usize {
        self.counter(counter).load(Ordering::Relaxed)
    }
}

#[test]
fn stats_increase() {
    let stats = Stats::new();
    stats.increase(Counter::Checksum);
    stats.add(Counter::SegmentsSent, 3);
    assert_eq!(stats.get(Counter::Checksum), 1);
    assert_eq!(stats.get(Counter::SegmentsSent), 3);
    assert_eq!(stats.get(Counter::Malformed), 0);
}
