//! Support for estimating the retransmission timeout of a TCP connection.

use std::cmp::{max, min};
use std::time::Duration;

const RTO_K: u32 = 4;
const RTO_ALPHA: f64 = 1.0 / 8.0;
const RTO_BETA: f64 = 1.0 / 4.0;

/// Represents the retransmission & timing state of a TCP connection.
#[derive(Clone, Debug)]
pub struct RtoState {
    srtt: Option<Duration>,
    rttvar: Option<Duration>,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    retries: u32,
}

impl RtoState {
    /// Creates a new `RtoState`.
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> RtoState {
        RtoState {
            srtt: None,
            rttvar: None,
            rto: min(max_rto, max(min_rto, initial_rto)),
            min_rto,
            max_rto,
            retries: 0,
        }
    }

    fn set_rto(&mut self, rto: Duration) {
        self.rto = min(self.max_rto, max(self.min_rto, rto));
    }

    /// Updates the RTO with a newly sampled RTT.
    pub fn sample(&mut self, rtt: Duration) {
        let (srtt, rttvar) = match (self.srtt, self.rttvar) {
            (Some(prev_srtt), Some(prev_rttvar)) => {
                // RTTVAR uses the previous SRTT
                let diff = match prev_srtt > rtt {
                    true => prev_srtt - rtt,
                    false => rtt - prev_srtt,
                };
                let rttvar = prev_rttvar.mul_f64(1.0 - RTO_BETA) + diff.mul_f64(RTO_BETA);
                let srtt = prev_srtt.mul_f64(1.0 - RTO_ALPHA) + rtt.mul_f64(RTO_ALPHA);

                (srtt, rttvar)
            }
            _ => (rtt, rtt / 2),
        };

        self.srtt = Some(srtt);
        self.rttvar = Some(rttvar);
        self.set_rto(srtt + rttvar * RTO_K);
    }

    /// Doubles the RTO and counts a timeout. Returns the count of consecutive timeouts.
    pub fn backoff(&mut self) -> u32 {
        self.set_rto(self.rto.checked_mul(2).unwrap_or(self.max_rto));
        self.retries = self.retries.saturating_add(1);

        self.retries
    }

    /// Clears the count of consecutive timeouts.
    pub fn clear_retries(&mut self) {
        self.retries = 0;
    }

    /// Returns the count of consecutive timeouts.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Returns the RTO.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Returns the smoothed RTT.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Returns the RTT variance.
    pub fn rttvar(&self) -> Option<Duration> {
        self.rttvar
    }
}

#[cfg(test)]
fn rto_state() -> RtoState {
    RtoState::new(
        Duration::from_secs(1),
        Duration::from_millis(200),
        Duration::from_secs(60),
    )
}

#[test]
fn rto_first_sample() {
    let mut s = rto_state();
    assert_eq!(s.rto(), Duration::from_secs(1));

    s.sample(Duration::from_millis(100));
    assert_eq!(s.srtt(), Some(Duration::from_millis(100)));
    assert_eq!(s.rttvar(), Some(Duration::from_millis(50)));
    // 100 + 4 * 50
    assert_eq!(s.rto(), Duration::from_millis(300));
}

#[test]
fn rto_subsequent_sample() {
    let mut s = rto_state();
    s.sample(Duration::from_millis(800));
    s.sample(Duration::from_millis(400));
    // RTTVAR = 3/4 * 400 + 1/4 * |800 - 400| = 400
    // SRTT = 7/8 * 800 + 1/8 * 400 = 750
    let srtt = s.srtt().unwrap().as_micros();
    let rttvar = s.rttvar().unwrap().as_micros();
    assert!((749_999..=750_001).contains(&srtt));
    assert!((399_999..=400_001).contains(&rttvar));
    let rto = s.rto().as_micros();
    assert!((2_349_998..=2_350_002).contains(&rto));
}

#[test]
fn rto_clamped() {
    let mut s = rto_state();
    s.sample(Duration::from_millis(1));
    assert_eq!(s.rto(), Duration::from_millis(200));

    s.sample(Duration::from_secs(100));
    assert_eq!(s.rto(), Duration::from_secs(60));
}

#[test]
fn rto_backoff() {
    let mut s = rto_state();
    assert_eq!(s.backoff(), 1);
    assert_eq!(s.rto(), Duration::from_secs(2));
    assert_eq!(s.backoff(), 2);
    assert_eq!(s.rto(), Duration::from_secs(4));
    for _ in 0..10 {
        s.backoff();
    }
    assert_eq!(s.rto(), Duration::from_secs(60));
    s.clear_retries();
    assert_eq!(s.retries(), 0);
}
