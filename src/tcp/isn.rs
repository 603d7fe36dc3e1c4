//! Support for generating initial sequence numbers.

use super::seq::SeqNum;
use rand::Rng;
use std::time::Instant;

/// Represents the largest random increment added to each initial sequence number.
const MAX_INCREMENT: u32 = 1 << 16;

/// Represents a generator of initial sequence numbers. The sequence number is driven by a
/// monotonic clock ticking every 4 microseconds, started from a random offset, plus a random
/// increment for each connection.
#[derive(Debug)]
pub struct IsnGenerator {
    epoch: Instant,
    offset: u32,
}

impl IsnGenerator {
    /// Creates a new `IsnGenerator`.
    pub fn new() -> IsnGenerator {
        IsnGenerator {
            epoch: Instant::now(),
            offset: rand::thread_rng().gen(),
        }
    }

    /// Generates an initial sequence number.
    pub fn generate(&self) -> SeqNum {
        let ticks = (self.epoch.elapsed().as_micros() / 4) as u32;
        let increment = rand::thread_rng().gen_range(0..MAX_INCREMENT);

        SeqNum::new(self.offset.wrapping_add(ticks).wrapping_add(increment))
    }
}

impl Default for IsnGenerator {
    fn default() -> IsnGenerator {
        IsnGenerator::new()
    }
}

#[test]
fn isn_generator_unpredictable() {
    let g = IsnGenerator::new();
    let isns = (0..16).map(|_| g.generate()).collect::<Vec<_>>();
    assert!(isns.windows(2).any(|w| w[0] != w[1]));
}
