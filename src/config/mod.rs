//! Support for configuring TCP connections.

use std::time::Duration;

/// Represents the maximum window scale defined in RFC 7323.
pub const MAX_WINDOW_SCALE: u8 = 14;

/// Represents the maximum of any configured timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Represents the configuration of a TCP stack.
#[derive(Clone, Debug)]
pub struct Config {
    /// Represents the maximum segment size the stack is willing to receive and send.
    pub mss: u16,
    /// Represents the initial congestion window in segments.
    pub initial_window: usize,
    /// Represents the size of the receive buffer of a connection in bytes.
    pub recv_buffer: usize,
    /// Represents the size of the send buffer of a connection in bytes.
    pub send_buffer: usize,
    /// Represents the window scale offered in the synchronization.
    pub window_scale: u8,
    /// Represents the maximum count of consecutive timeouts before a connection is aborted.
    pub max_retransmits: u32,
    /// Represents the retransmission timeout before any RTT is sampled.
    pub initial_rto: Duration,
    /// Represents the minimum retransmission timeout.
    pub min_rto: Duration,
    /// Represents the maximum retransmission timeout.
    pub max_rto: Duration,
    /// Represents the time a connection lingers in TIME-WAIT.
    pub linger: Duration,
    /// Represents the time a connection released by its handle waits in FIN-WAIT-2 for the FIN
    /// of the peer.
    pub fin_timeout: Duration,
    /// Represents the default backlog of listeners.
    pub backlog: usize,
    /// Represents if selective acknowledgements are offered.
    pub sack: bool,
    /// Represents if fast open is enabled.
    pub fast_open: bool,
    /// Represents if timestamps are offered.
    pub timestamps: bool,
    /// Represents the number of fast open cookies cached on the client side.
    pub fast_open_cache: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mss: 1460,
            initial_window: 2,
            recv_buffer: 256 * 1024,
            send_buffer: 256 * 1024,
            window_scale: 7,
            max_retransmits: 8,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
            linger: Duration::from_secs(2),
            fin_timeout: Duration::from_secs(60),
            backlog: 128,
            sack: true,
            fast_open: false,
            timestamps: true,
            fast_open_cache: 64,
        }
    }
}

impl Config {
    /// Creates a new `Config` with default values.
    pub fn new() -> Config {
        Config::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        // RFC 879 minimum
        if self.mss < 536 {
            return Err(format!("validate mss {}: {}", self.mss, "less than 536"));
        }
        if self.initial_window == 0 {
            return Err(format!("validate initial window: {}", "zero"));
        }
        if self.recv_buffer < self.mss as usize {
            return Err(format!(
                "validate receive buffer {}: {}",
                self.recv_buffer, "less than mss"
            ));
        }
        if self.window_scale > MAX_WINDOW_SCALE {
            return Err(format!(
                "validate window scale {}: {}",
                self.window_scale, "greater than 14"
            ));
        }
        if self.recv_buffer > (u16::MAX as usize) << self.window_scale as usize {
            return Err(format!(
                "validate receive buffer {}: {}",
                self.recv_buffer, "not representable with window scale"
            ));
        }
        if self.send_buffer == 0 {
            return Err(format!("validate send buffer: {}", "zero"));
        }
        if self.min_rto.as_millis() == 0 {
            return Err(format!("validate minimum RTO: {}", "zero"));
        }
        if self.min_rto > self.max_rto {
            return Err(format!(
                "validate RTO range {:?}..{:?}: {}",
                self.min_rto, self.max_rto, "minimum greater than maximum"
            ));
        }
        if self.max_rto > MAX_TIMEOUT {
            return Err(format!(
                "validate maximum RTO {:?}: {}",
                self.max_rto, "greater than 1 hour"
            ));
        }
        if self.initial_rto > MAX_TIMEOUT {
            return Err(format!(
                "validate initial RTO {:?}: {}",
                self.initial_rto, "greater than 1 hour"
            ));
        }
        if self.linger > MAX_TIMEOUT {
            return Err(format!(
                "validate linger {:?}: {}",
                self.linger, "greater than 1 hour"
            ));
        }
        if self.fin_timeout > MAX_TIMEOUT {
            return Err(format!(
                "validate FIN timeout {:?}: {}",
                self.fin_timeout, "greater than 1 hour"
            ));
        }
        if self.backlog == 0 {
            return Err(format!("validate backlog: {}", "zero"));
        }
        if self.fast_open && self.fast_open_cache == 0 {
            return Err(format!("validate fast open cache: {}", "zero"));
        }

        Ok(())
    }

    /// Returns the receive window which is able to be advertised.
    pub fn max_recv_window(&self) -> usize {
        std::cmp::min(
            self.recv_buffer,
            (u16::MAX as usize) << std::cmp::min(self.window_scale, MAX_WINDOW_SCALE) as usize,
        )
    }
}

#[test]
fn config_default_is_valid() {
    assert!(Config::default().validate().is_ok());
}

#[test]
fn config_validate_rejects() {
    let mut config = Config::default();
    config.mss = 100;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.window_scale = 15;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.window_scale = 0;
    config.recv_buffer = 1 << 20;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.min_rto = std::time::Duration::from_secs(120);
    assert!(config.validate().is_err());
}

#[test]
fn config_validate_rejects_out_of_range() {
    let mut config = Config::default();
    config.window_scale = 64;
    assert!(config.validate().is_err());
    assert_eq!(config.max_recv_window(), config.recv_buffer);

    let mut config = Config::default();
    config.max_rto = Duration::MAX;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.initial_rto = Duration::MAX;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.linger = Duration::MAX;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.fin_timeout = Duration::MAX;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.initial_rto = MAX_TIMEOUT;
    config.max_rto = MAX_TIMEOUT;
    config.linger = MAX_TIMEOUT;
    assert!(config.validate().is_ok());
}
