//! Support for TCP congestion control.

use std::cmp::max;
use std::fmt::{self, Display, Formatter};

/// Represents the initial slow start threshold rate for congestion window in a TCP connection.
const INITIAL_SSTHRESH_RATE: usize = 100;

/// Enumeration of phases of the congestion control.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Phase {
    /// Represents the slow start phase.
    SlowStart,
    /// Represents the congestion avoidance phase.
    CongestionAvoidance,
    /// Represents the fast recovery phase.
    FastRecovery,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Phase::SlowStart => write!(f, "slow start"),
            Phase::CongestionAvoidance => write!(f, "congestion avoidance"),
            Phase::FastRecovery => write!(f, "fast recovery"),
        }
    }
}

/// Represents the TCP Reno congestion control state of a TCP connection.
#[derive(Clone, Debug)]
pub struct RenoCcState {
    mss: usize,
    cwnd: usize,
    ssthresh: usize,
    phase: Phase,
}

impl RenoCcState {
    /// Creates a new `RenoCcState` with the initial window in segments.
    pub fn new(mss: usize, initial_window: usize) -> RenoCcState {
        RenoCcState {
            mss,
            cwnd: mss.saturating_mul(max(1, initial_window)),
            ssthresh: mss.saturating_mul(INITIAL_SSTHRESH_RATE),
            phase: Phase::SlowStart,
        }
    }

    fn update_ssthresh(&mut self) {
        self.ssthresh = max(self.cwnd / 2, self.mss.saturating_mul(2));
    }

    /// Indicates an acknowledgement covering new data.
    pub fn ack(&mut self) {
        match self.phase {
            Phase::SlowStart => {
                self.cwnd = self.cwnd.saturating_add(self.mss);
                if self.cwnd >= self.ssthresh {
                    self.phase = Phase::CongestionAvoidance;
                }
            }
            Phase::CongestionAvoidance => {
                let delta = max(1, self.mss.saturating_mul(self.mss) / self.cwnd);
                self.cwnd = self.cwnd.saturating_add(delta);
            }
            Phase::FastRecovery => {
                // The acknowledgement covers the retransmitted data
                self.cwnd = self.ssthresh;
                self.phase = Phase::CongestionAvoidance;
            }
        }
    }

    /// Indicates a duplicate acknowledgement received in the fast recovery.
    pub fn duplicate(&mut self) {
        if self.phase == Phase::FastRecovery {
            self.cwnd = self.cwnd.saturating_add(self.mss);
        }
    }

    /// Indicates a fast retransmission triggered by 3 duplicate acknowledgements.
    pub fn fast_retransmission(&mut self) {
        self.update_ssthresh();
        self.cwnd = self.ssthresh.saturating_add(self.mss.saturating_mul(3));
        self.phase = Phase::FastRecovery;
    }

    /// Indicates a retransmission timeout.
    pub fn timedout(&mut self) {
        self.update_ssthresh();
        self.cwnd = self.mss;
        self.phase = Phase::SlowStart;
    }

    /// Returns the congestion window.
    pub fn cwnd(&self) -> usize {
        self.cwnd
    }

    /// Returns the slow start threshold.
    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    /// Returns the phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns the MSS used by the congestion control.
    pub fn mss(&self) -> usize {
        self.mss
    }
}

impl Display for RenoCcState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "TCP Reno State: {}, cwnd = {}, ssthresh = {}",
            self.phase, self.cwnd, self.ssthresh
        )
    }
}

#[test]
fn reno_slow_start() {
    let mut cc = RenoCcState::new(1000, 1);
    assert_eq!(cc.cwnd(), 1000);
    assert_eq!(cc.ssthresh(), 100_000);

    cc.ack();
    cc.ack();
    assert_eq!(cc.cwnd(), 3000);
    assert_eq!(cc.phase(), Phase::SlowStart);
}

#[test]
fn reno_slow_start_to_congestion_avoidance() {
    let mut cc = RenoCcState::new(1000, 1);
    for _ in 0..99 {
        cc.ack();
    }
    assert_eq!(cc.cwnd(), 100_000);
    assert_eq!(cc.phase(), Phase::CongestionAvoidance);

    cc.ack();
    // 1000 * 1000 / 100000
    assert_eq!(cc.cwnd(), 100_010);
}

#[test]
fn reno_fast_recovery() {
    let mut cc = RenoCcState::new(1000, 10);
    cc.fast_retransmission();
    assert_eq!(cc.ssthresh(), 5000);
    assert_eq!(cc.cwnd(), 8000);
    assert_eq!(cc.phase(), Phase::FastRecovery);

    cc.duplicate();
    assert_eq!(cc.cwnd(), 9000);

    cc.ack();
    assert_eq!(cc.cwnd(), 5000);
    assert_eq!(cc.phase(), Phase::CongestionAvoidance);
}

#[test]
fn reno_fast_recovery_minimum_ssthresh() {
    let mut cc = RenoCcState::new(1000, 2);
    cc.fast_retransmission();
    assert_eq!(cc.ssthresh(), 2000);
    assert_eq!(cc.cwnd(), 5000);
}

#[test]
fn reno_timedout() {
    let mut cc = RenoCcState::new(1000, 10);
    cc.ack();
    cc.timedout();
    assert_eq!(cc.cwnd(), 1000);
    assert_eq!(cc.ssthresh(), 5500);
    assert_eq!(cc.phase(), Phase::SlowStart);

    cc.duplicate();
    assert_eq!(cc.cwnd(), 1000);
}
