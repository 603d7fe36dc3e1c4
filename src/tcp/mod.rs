//! Support for tracking TCP connections.
//!
//! A `Tcb` drives one connection from the handshake to the teardown. It performs no I/O: arriving
//! segments are fed with `on_segment`, expired timers with `on_timer`, and the segments it wants
//! sent are collected with `take_outbox`. Time is always passed in by the caller.

use crate::config::{Config, MAX_WINDOW_SCALE};
use crate::error::{Error, Result};
use crate::packet::option::MAX_SACK_BLOCKS;
use crate::packet::{Flags, Segment, TcpOption};
use log::trace;
use std::cmp::{max, min};
use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub mod cache;
pub mod cc;
pub mod isn;
pub mod rto;
pub mod seq;

use cache::{Flights, Queue, Window};
pub use cc::{Phase, RenoCcState};
pub use isn::IsnGenerator;
use rto::RtoState;
pub use seq::SeqNum;

/// Represents the MSS assumed when the peer does not announce one.
const DEFAULT_MSS: usize = 536;
/// Represents the largest value of the window field.
const MAX_WINDOW: usize = 65535;
/// Represents the count of duplicate acknowledgements triggering a fast retransmission.
const DUPLICATE_THRESHOLD: usize = 3;

/// Enumeration of states of a TCP connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum State {
    /// No connection.
    Closed,
    /// Waiting for a SYN.
    Listen,
    /// SYN sent, waiting for the SYN of the peer.
    SynSent,
    /// SYN received and SYN/ACK sent, waiting for the ACK.
    SynReceived,
    /// Open for data in both directions.
    Established,
    /// FIN sent, waiting for its ACK or the FIN of the peer.
    FinWait1,
    /// FIN acknowledged, waiting for the FIN of the peer.
    FinWait2,
    /// FIN of the peer received before the ACK of ours.
    Closing,
    /// Both directions closed, absorbing delayed segments before closing.
    TimeWait,
    /// FIN of the peer received, waiting for a local close.
    CloseWait,
    /// FIN sent after the FIN of the peer, waiting for its ACK.
    LastAck,
}

impl State {
    /// Returns if both SYNs have been exchanged.
    pub fn is_synchronized(&self) -> bool {
        !matches!(
            self,
            State::Closed | State::Listen | State::SynSent | State::SynReceived
        )
    }

    fn can_send(&self) -> bool {
        matches!(
            self,
            State::Established
                | State::CloseWait
                | State::FinWait1
                | State::Closing
                | State::LastAck
        )
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN-SENT",
            State::SynReceived => "SYN-RECEIVED",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN-WAIT-1",
            State::FinWait2 => "FIN-WAIT-2",
            State::Closing => "CLOSING",
            State::TimeWait => "TIME-WAIT",
            State::CloseWait => "CLOSE-WAIT",
            State::LastAck => "LAST-ACK",
        };

        write!(f, "{}", s)
    }
}

/// Enumeration of fast open behaviors in a handshake.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FastOpen {
    /// Represents fast open is not used.
    Disabled,
    /// Represents a cookie carried in the SYN or the SYN/ACK. An empty cookie in the SYN requests
    /// a cookie, a non-empty one carries data in the SYN.
    Cookie(Vec<u8>),
    /// Represents the data in the SYN is accepted by the server.
    Accepted,
}

/// Enumeration of results of reading from a TCP connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Received {
    /// Represents in-order bytes.
    Data(Vec<u8>),
    /// Represents the peer finished sending and all bytes have been read.
    EndOfStream,
    /// Represents no bytes are available yet.
    Pending,
}

/// Represents the transmission control block of a TCP connection.
///
/// Positions in the sequence space are kept as offsets from the initial sequence numbers, so
/// that the SYN is at offset 0 and the first byte of data at offset 1.
#[derive(Debug)]
pub struct Tcb {
    local: SocketAddr,
    remote: SocketAddr,
    state: State,
    error: Option<Error>,
    passive: bool,
    closed_locally: bool,
    released: bool,
    epoch: Instant,
    linger: Duration,
    time_wait_deadline: Option<Instant>,
    fin_timeout: Duration,
    fin_wait2_deadline: Option<Instant>,
    outbox: Vec<Segment>,
    // Send
    iss: SeqNum,
    snd_una: u64,
    snd_nxt: u64,
    snd_max: u64,
    snd_wnd: usize,
    snd_wl1: SeqNum,
    snd_wl2: SeqNum,
    snd_wscale: u8,
    mss: usize,
    local_mss: u16,
    initial_window: usize,
    queue: Queue,
    fin: Option<u64>,
    flights: Flights,
    rto: RtoState,
    cc: RenoCcState,
    duplicate: usize,
    retransmissions: usize,
    max_retransmits: u32,
    rtx_deadline: Option<Instant>,
    probe_deadline: Option<Instant>,
    // Receive
    irs: Option<SeqNum>,
    wscale: Option<u8>,
    rcv_wscale: u8,
    window: Window,
    readable: VecDeque<u8>,
    recv_capacity: usize,
    peer_fin: Option<u64>,
    fin_received: bool,
    rcv_adv: usize,
    // Options
    sack: bool,
    timestamps: bool,
    ts_recent: u32,
    cookie: Option<Vec<u8>>,
    cookie_received: Option<Vec<u8>>,
}

impl Tcb {
    fn new(
        local: SocketAddr,
        remote: SocketAddr,
        iss: SeqNum,
        config: &Config,
        passive: bool,
        now: Instant,
    ) -> Tcb {
        let mss = max(1, config.mss as usize);
        Tcb {
            local,
            remote,
            state: State::Closed,
            error: None,
            passive,
            closed_locally: false,
            released: false,
            epoch: now,
            linger: config.linger,
            time_wait_deadline: None,
            fin_timeout: config.fin_timeout,
            fin_wait2_deadline: None,
            outbox: Vec::new(),
            iss,
            snd_una: 0,
            snd_nxt: 0,
            snd_max: 0,
            snd_wnd: 0,
            snd_wl1: SeqNum::default(),
            snd_wl2: SeqNum::default(),
            snd_wscale: 0,
            mss,
            local_mss: config.mss,
            initial_window: config.initial_window,
            queue: Queue::with_capacity(config.send_buffer, 1),
            fin: None,
            flights: Flights::new(),
            rto: RtoState::new(config.initial_rto, config.min_rto, config.max_rto),
            cc: RenoCcState::new(mss, config.initial_window),
            duplicate: 0,
            retransmissions: 0,
            max_retransmits: config.max_retransmits,
            rtx_deadline: None,
            probe_deadline: None,
            irs: None,
            wscale: Some(min(config.window_scale, MAX_WINDOW_SCALE)),
            rcv_wscale: 0,
            window: Window::new(1),
            readable: VecDeque::new(),
            recv_capacity: config.recv_buffer,
            peer_fin: None,
            fin_received: false,
            rcv_adv: 0,
            sack: config.sack,
            timestamps: config.timestamps,
            ts_recent: 0,
            cookie: None,
            cookie_received: None,
        }
    }

    /// Creates a new `Tcb` performing an active open. The SYN is left in the outbox. The data is
    /// queued as far as the send buffer allows, and up to one MSS of it rides in the SYN when a
    /// fast open cookie is given.
    pub fn connect(
        local: SocketAddr,
        remote: SocketAddr,
        iss: SeqNum,
        config: &Config,
        fast_open: FastOpen,
        data: &[u8],
        now: Instant,
    ) -> Tcb {
        let mut tcb = Tcb::new(local, remote, iss, config, false, now);
        if let FastOpen::Cookie(cookie) = fast_open {
            tcb.cookie = Some(cookie);
        }
        tcb.queue.append(data);

        tcb.set_state(State::SynSent);
        tcb.send_syn(now);

        tcb
    }

    /// Creates a new `Tcb` answering the SYN arrived at a listening port. The SYN/ACK is left in
    /// the outbox. If fast open is accepted, the data in the SYN is readable at once and the
    /// connection is established without waiting for the final ACK.
    pub fn accept(
        local: SocketAddr,
        remote: SocketAddr,
        syn: &Segment,
        iss: SeqNum,
        config: &Config,
        fast_open: FastOpen,
        now: Instant,
    ) -> Tcb {
        let mut tcb = Tcb::new(local, remote, iss, config, true, now);
        tcb.synchronize(syn);
        tcb.snd_wnd = syn.window as usize;
        tcb.snd_wl1 = syn.sequence;
        tcb.snd_wl2 = iss;

        tcb.set_state(State::SynReceived);
        match fast_open {
            FastOpen::Accepted => {
                if let Some(data) = tcb.window.append(1, &syn.payload) {
                    tcb.readable.extend(data);
                }
                tcb.set_state(State::Established);
            }
            FastOpen::Cookie(cookie) => tcb.cookie = Some(cookie),
            FastOpen::Disabled => {}
        }
        tcb.send_syn(now);

        tcb
    }

    /// Records the initial receive sequence and negotiates options with the SYN of the peer.
    fn synchronize(&mut self, syn: &Segment) {
        self.irs = Some(syn.sequence);
        self.window = Window::new(1);

        let peer_mss = syn
            .mss()
            .filter(|mss| *mss > 0)
            .map(usize::from)
            .unwrap_or(DEFAULT_MSS);
        self.mss = min(self.mss, peer_mss);
        self.cc = RenoCcState::new(self.mss, self.initial_window);

        match (self.wscale, syn.wscale()) {
            (Some(wscale), Some(peer_wscale)) => {
                self.rcv_wscale = wscale;
                self.snd_wscale = min(peer_wscale, MAX_WINDOW_SCALE);
            }
            _ => {
                self.wscale = None;
                self.rcv_wscale = 0;
                self.snd_wscale = 0;
            }
        }
        self.sack = self.sack && syn.is_sack_perm();
        match syn.ts() {
            Some((ts, _)) if self.timestamps => self.ts_recent = ts,
            _ => self.timestamps = false,
        }

        trace!(
            "synchronize TCP {} -> {} at {}, mss = {}, wscale = {}/{}, sack = {}, ts = {}",
            self.local,
            self.remote,
            syn.sequence,
            self.mss,
            self.rcv_wscale,
            self.snd_wscale,
            self.sack,
            self.timestamps
        );
    }

    /// Processes an arriving segment.
    pub fn on_segment(&mut self, segment: &Segment, now: Instant) {
        match self.state {
            State::Closed | State::Listen => {}
            State::SynSent => self.on_segment_syn_sent(segment, now),
            State::TimeWait => self.on_segment_time_wait(segment, now),
            _ => self.on_segment_synchronized(segment, now),
        }
    }

    fn on_segment_syn_sent(&mut self, segment: &Segment, now: Instant) {
        let mut acceptable = false;
        if segment.flags.is_ack() {
            let ack = self.ack_offset(segment.acknowledgement);
            if ack <= self.snd_una as i64 || ack > self.snd_nxt as i64 {
                if !segment.flags.is_rst() {
                    self.send_rst(segment.acknowledgement);
                }
                return;
            }
            acceptable = true;
        }
        if segment.flags.is_rst() {
            if acceptable {
                self.fail(Error::ConnectionRefused);
            }
            return;
        }
        if !segment.flags.is_syn() {
            return;
        }

        self.synchronize(segment);
        self.snd_wnd = segment.window as usize;
        self.snd_wl1 = segment.sequence;
        self.snd_wl2 = segment.acknowledgement;
        if let Some(cookie) = segment.cookie() {
            if !cookie.is_empty() {
                self.cookie_received = Some(cookie.to_vec());
            }
        }

        if !acceptable {
            // Simultaneous open
            self.set_state(State::SynReceived);
            self.flights.clear();
            self.snd_nxt = 0;
            self.send_syn(now);
            return;
        }

        let ack = self.ack_offset(segment.acknowledgement) as u64;
        self.acknowledge(ack, now);
        if self.snd_una < self.snd_nxt {
            // The data in the SYN is not accepted
            self.flights.clear();
            self.snd_nxt = self.snd_una;
            self.rtx_deadline = None;
            trace!(
                "rewind TCP sequence of {} -> {} to {}",
                self.local,
                self.remote,
                self.seq_of(self.snd_nxt)
            );
        }
        self.set_state(State::Established);

        self.process_data(segment, now);
        self.send_ack(now);
        self.transmit(now);
    }

    fn on_segment_time_wait(&mut self, segment: &Segment, now: Instant) {
        if segment.flags.is_fin() && !segment.flags.is_rst() {
            // The ACK of the FIN may be lost
            self.send_ack(now);
            self.time_wait_deadline = Some(now + self.linger);
            trace!(
                "restart TCP linger of {} -> {} to {:?}",
                self.local,
                self.remote,
                self.linger
            );
        }
    }

    fn on_segment_synchronized(&mut self, segment: &Segment, now: Instant) {
        if self.state == State::SynReceived
            && segment.flags.is_syn()
            && !segment.flags.is_ack()
            && Some(segment.sequence) == self.irs
        {
            // The SYN/ACK may be lost
            self.retransmit_first(now);
            return;
        }

        if !self.is_acceptable(segment) {
            if !segment.flags.is_rst() {
                self.send_ack(now);
            }
            return;
        }
        if segment.flags.is_rst() {
            self.fail(Error::ConnectionReset);
            return;
        }
        if segment.flags.is_syn() {
            if let Some(rst) = Segment::new_rst_for(segment) {
                self.outbox.push(rst);
            }
            self.fail(Error::ProtocolViolation);
            return;
        }
        if !segment.flags.is_ack() {
            return;
        }

        if self.timestamps && segment.sequence == self.rcv_nxt() {
            if let Some((ts, _)) = segment.ts() {
                self.ts_recent = ts;
            }
        }

        if !self.process_ack(segment, now) {
            return;
        }
        if self.process_data(segment, now) {
            self.send_ack(now);
        }
        self.transmit(now);
    }

    /// Processes the acknowledgement of a segment. Returns if the segment should be processed
    /// further.
    fn process_ack(&mut self, segment: &Segment, now: Instant) -> bool {
        let ack = self.ack_offset(segment.acknowledgement);
        if self.state == State::SynReceived {
            if ack <= self.snd_una as i64 || ack > self.snd_max as i64 {
                self.send_rst(segment.acknowledgement);
                return false;
            }
            self.set_state(State::Established);
        }
        if ack > self.snd_max as i64 {
            self.send_ack(now);
            return false;
        }

        let window = (segment.window as usize) << self.snd_wscale;
        if ack == self.snd_una as i64 {
            if segment.payload.is_empty()
                && !segment.flags.is_fin()
                && window == self.snd_wnd
                && !self.flights.is_empty()
            {
                self.on_duplicate(now);
            }
        } else if ack > self.snd_una as i64 {
            self.acknowledge(ack as u64, now);
        }

        if self.snd_wl1.before(segment.sequence)
            || (self.snd_wl1 == segment.sequence
                && self.snd_wl2.before_or_eq(segment.acknowledgement))
        {
            self.set_snd_wnd(window);
            self.snd_wl1 = segment.sequence;
            self.snd_wl2 = segment.acknowledgement;
        }

        if self.is_fin_acknowledged() {
            match self.state {
                State::FinWait1 => {
                    self.set_state(State::FinWait2);
                    if self.released {
                        self.arm_fin_wait2(now);
                    }
                }
                State::Closing => self.enter_time_wait(now),
                State::LastAck => {
                    self.set_state(State::Closed);
                    return false;
                }
                _ => {}
            }
        }

        true
    }

    /// Processes the payload and the FIN of a segment. Returns if an ACK is required.
    fn process_data(&mut self, segment: &Segment, now: Instant) -> bool {
        let begin = self.rcv_offset(segment.sequence) + segment.flags.is_syn() as i64;
        if begin < 0 {
            return false;
        }
        let begin = begin as u64;
        let limit = self.rcv_nxt_offset() + self.rcv_wnd_limit() as u64;
        let receiving = matches!(
            self.state,
            State::Established | State::FinWait1 | State::FinWait2
        ) && !self.fin_received;

        let mut ack = false;
        if !segment.payload.is_empty() {
            ack = true;
            let end = min(begin + segment.payload.len() as u64, limit);
            if receiving && end > begin {
                let payload = &segment.payload[..(end - begin) as usize];
                match self.window.append(begin, payload) {
                    Some(data) => {
                        self.readable.extend(data);
                        trace!(
                            "receive TCP data of {} -> {} to {} ({} Bytes readable)",
                            self.remote,
                            self.local,
                            self.rcv_nxt(),
                            self.readable.len()
                        );
                    }
                    None => trace!(
                        "hold TCP out of order data of {} -> {} ({} Bytes held)",
                        self.remote,
                        self.local,
                        self.window.len()
                    ),
                }
            }
        }

        if segment.flags.is_fin() {
            ack = true;
            let fin = begin + segment.payload.len() as u64;
            if receiving && self.peer_fin.is_none() && fin <= limit {
                self.peer_fin = Some(fin);
            }
        }

        if let Some(fin) = self.peer_fin {
            if !self.fin_received && self.window.offset() == fin {
                self.fin_received = true;
                trace!("receive TCP FIN of {} -> {}", self.remote, self.local);
                match self.state {
                    State::Established => self.set_state(State::CloseWait),
                    State::FinWait1 => self.set_state(State::Closing),
                    State::FinWait2 => self.enter_time_wait(now),
                    _ => {}
                }
            }
        }

        ack
    }

    fn on_duplicate(&mut self, now: Instant) {
        self.duplicate += 1;
        trace!(
            "set TCP duplicate acknowledgement of {} -> {} to {}",
            self.local,
            self.remote,
            self.duplicate
        );

        if self.duplicate == DUPLICATE_THRESHOLD {
            self.cc.fast_retransmission();
            trace!("{} of {} -> {}", self.cc, self.local, self.remote);
            self.retransmit_first(now);
            self.rtx_deadline = Some(now + self.rto.rto());
        } else if self.duplicate > DUPLICATE_THRESHOLD {
            self.cc.duplicate();
        }
    }

    /// Acknowledges to the certain offset, which must be after the oldest unacknowledged one.
    fn acknowledge(&mut self, offset: u64, now: Instant) {
        let new_data = offset > max(self.snd_una, 1);

        if let Some(rtt) = self.flights.acknowledge(offset, now) {
            self.rto.sample(rtt);
            trace!(
                "set TCP RTO of {} -> {} to {:?}",
                self.local,
                self.remote,
                self.rto.rto()
            );
        }
        self.snd_una = offset;
        if self.snd_nxt < offset {
            // Acknowledged beyond a rewound sequence
            self.snd_nxt = offset;
        }
        self.queue.invalidate_to(min(offset, self.queue.recv_next()));
        self.rto.clear_retries();
        self.duplicate = 0;
        trace!(
            "acknowledge TCP sequence of {} -> {} to {}",
            self.local,
            self.remote,
            self.seq_of(offset)
        );

        if new_data {
            self.cc.ack();
            trace!("{} of {} -> {}", self.cc, self.local, self.remote);
        }

        self.rtx_deadline = match self.flights.is_empty() {
            true => None,
            false => Some(now + self.rto.rto()),
        };
    }

    /// Sends as many segments as both the send window and the congestion window allow.
    fn transmit(&mut self, now: Instant) {
        if !self.state.can_send() {
            return;
        }

        let window = min(self.snd_wnd, self.cc.cwnd());
        loop {
            let usable = window.saturating_sub(self.flight_size());
            if usable == 0 {
                break;
            }
            let data_end = self.queue.recv_next();
            let begin = self.snd_nxt;
            let (end, flags, payload) = if begin < data_end {
                let size = min(min(self.mss, usable), (data_end - begin) as usize);
                let mut end = begin + size as u64;
                let mut flags = Flags::ACK;
                if end == data_end {
                    flags |= Flags::PSH;
                }
                if self.fin == Some(end) && usable > size {
                    flags |= Flags::FIN;
                    end += 1;
                }

                (end, flags, self.queue.get(begin, size))
            } else if self.fin == Some(begin) {
                (begin + 1, Flags::ACK | Flags::FIN, Vec::new())
            } else {
                break;
            };

            let segment = self.segment(begin, flags, payload, now);
            self.outbox.push(segment);
            self.flights.push(begin, end, now);
            if begin < self.snd_max {
                self.flights.retransmit(begin, now);
                self.retransmissions += 1;
                trace!(
                    "retransmit TCP segment of {} -> {} at {}",
                    self.local,
                    self.remote,
                    self.seq_of(begin)
                );
            }
            self.snd_nxt = end;
            self.snd_max = max(self.snd_max, end);
            if self.rtx_deadline.is_none() {
                self.rtx_deadline = Some(now + self.rto.rto());
            }
        }

        let pending = self.snd_nxt < self.queue.recv_next() || self.fin == Some(self.snd_nxt);
        if pending && self.snd_wnd == 0 && self.flights.is_empty() {
            if self.probe_deadline.is_none() {
                self.probe_deadline = Some(now + self.rto.rto());
            }
        } else {
            self.probe_deadline = None;
        }
    }

    /// Sends the oldest segment in flight again.
    fn retransmit_first(&mut self, now: Instant) {
        let (begin, flight) = match self.flights.first() {
            Some(first) => first,
            None => return,
        };
        self.flights.retransmit(begin, now);

        let mut flags = match (begin, self.irs) {
            (0, Some(_)) => Flags::SYN | Flags::ACK,
            (0, None) => Flags::SYN,
            _ => Flags::ACK,
        };
        let data_begin = max(begin, 1);
        let mut data_end = flight.end;
        if let Some(fin) = self.fin {
            if flight.end > fin {
                flags |= Flags::FIN;
                data_end = fin;
            }
        }
        let payload = match data_end > data_begin {
            true => self
                .queue
                .get(data_begin, (data_end - data_begin) as usize),
            false => Vec::new(),
        };
        if !payload.is_empty() {
            flags |= Flags::PSH;
        }

        self.retransmissions += 1;
        trace!(
            "retransmit TCP segment of {} -> {} at {}",
            self.local,
            self.remote,
            self.seq_of(begin)
        );

        let segment = self.segment(begin, flags, payload, now);
        self.outbox.push(segment);
    }

    fn send_syn(&mut self, now: Instant) {
        let payload = match &self.cookie {
            Some(cookie) if !cookie.is_empty() && !self.passive => self.queue.get(1, self.mss),
            _ => Vec::new(),
        };
        let end = 1 + payload.len() as u64;
        let flags = match self.irs {
            Some(_) => Flags::SYN | Flags::ACK,
            None => Flags::SYN,
        };

        let segment = self.segment(0, flags, payload, now);
        self.outbox.push(segment);
        self.flights.push(0, end, now);
        self.snd_nxt = end;
        self.snd_max = max(self.snd_max, end);
        self.rtx_deadline = Some(now + self.rto.rto());
    }

    fn send_ack(&mut self, now: Instant) {
        let segment = self.segment(self.snd_nxt, Flags::ACK, Vec::new(), now);
        self.outbox.push(segment);
    }

    fn send_rst(&mut self, sequence: SeqNum) {
        let rst = Segment::new(
            self.local.port(),
            self.remote.port(),
            sequence,
            SeqNum::default(),
            Flags::RST,
            0,
        );
        self.outbox.push(rst);
    }

    fn send_probe(&mut self, now: Instant) {
        let segment = self.segment(self.snd_una.saturating_sub(1), Flags::ACK, Vec::new(), now);
        self.outbox.push(segment);
        trace!(
            "probe TCP zero window of {} -> {}",
            self.local,
            self.remote
        );
    }

    /// Builds a segment beginning at the certain offset, filling in the acknowledgement, the
    /// window and the options.
    fn segment(&mut self, offset: u64, flags: Flags, payload: Vec<u8>, now: Instant) -> Segment {
        let acknowledgement = match flags.is_ack() {
            true => self.rcv_nxt(),
            false => SeqNum::default(),
        };
        let wnd = self.rcv_wnd_limit();
        let (window, options) = match flags.is_syn() {
            true => {
                let window = min(wnd, MAX_WINDOW);
                self.rcv_adv = window;
                (window, self.syn_options(now))
            }
            false => {
                let window = min(wnd >> self.rcv_wscale, MAX_WINDOW);
                self.rcv_adv = window << self.rcv_wscale;
                (window, self.options(now))
            }
        };

        let mut segment = Segment::new(
            self.local.port(),
            self.remote.port(),
            self.seq_of(offset),
            acknowledgement,
            flags,
            window as u16,
        );
        segment.options = options;
        segment.payload = payload;

        segment
    }

    fn syn_options(&self, now: Instant) -> Vec<TcpOption> {
        let mut options = vec![TcpOption::MaxSegmentSize(self.local_mss)];
        if let Some(wscale) = self.wscale {
            options.push(TcpOption::WindowScale(wscale));
        }
        if self.sack {
            options.push(TcpOption::SackPermitted);
        }
        if self.timestamps {
            let ts_ecr = match self.irs {
                Some(_) => self.ts_recent,
                None => 0,
            };
            options.push(TcpOption::Timestamps(self.ts_now(now), ts_ecr));
        }
        if let Some(cookie) = &self.cookie {
            options.push(TcpOption::FastOpenCookie(cookie.clone()));
        }

        options
    }

    fn options(&self, now: Instant) -> Vec<TcpOption> {
        let mut options = Vec::new();
        if self.timestamps {
            options.push(TcpOption::Timestamps(self.ts_now(now), self.ts_recent));
        }
        if self.sack && !self.window.is_empty() {
            let count = match self.timestamps {
                true => MAX_SACK_BLOCKS - 1,
                false => MAX_SACK_BLOCKS,
            };
            let irs = self.irs.unwrap_or_default();
            let blocks = self
                .window
                .filled()
                .into_iter()
                .take(count)
                .map(|(begin, end)| (irs + begin as u32, irs + end as u32))
                .collect();
            options.push(TcpOption::SackBlocks(blocks));
        }

        options
    }

    fn ts_now(&self, now: Instant) -> u32 {
        (now.saturating_duration_since(self.epoch).as_millis() as u32).wrapping_add(1)
    }

    /// Processes expired timers.
    pub fn on_timer(&mut self, now: Instant) {
        if let Some(deadline) = self.time_wait_deadline {
            if now >= deadline {
                self.set_state(State::Closed);
                return;
            }
        }
        if let Some(deadline) = self.fin_wait2_deadline {
            if now >= deadline {
                trace!(
                    "expire TCP FIN-WAIT-2 of {} -> {}",
                    self.local,
                    self.remote
                );
                self.fin_wait2_deadline = None;
                self.error = Some(Error::Timeout);
                self.set_state(State::Closed);
                return;
            }
        }

        if let Some(deadline) = self.rtx_deadline {
            if now >= deadline {
                match self.flights.is_empty() {
                    true => self.rtx_deadline = None,
                    false => {
                        self.on_retransmission_timeout(now);
                        if self.state == State::Closed {
                            return;
                        }
                    }
                }
            }
        }

        if let Some(deadline) = self.probe_deadline {
            if now >= deadline {
                self.send_probe(now);
                self.probe_deadline = Some(now + self.rto.rto());
            }
        }
    }

    fn on_retransmission_timeout(&mut self, now: Instant) {
        let retries = self.rto.backoff();
        trace!(
            "set TCP RTO of {} -> {} to {:?} (retry {})",
            self.local,
            self.remote,
            self.rto.rto(),
            retries
        );
        if retries > self.max_retransmits {
            self.fail(Error::Timeout);
            return;
        }

        self.cc.timedout();
        trace!("{} of {} -> {}", self.cc, self.local, self.remote);
        self.duplicate = 0;
        match self.flights.first() {
            Some((begin, _)) if begin > 0 => {
                // Go back to the oldest unacknowledged byte and resend under the collapsed window
                self.flights.clear();
                self.snd_nxt = self.snd_una;
                self.rtx_deadline = None;
                self.probe_deadline = None;
                trace!(
                    "rewind TCP sequence of {} -> {} to {}",
                    self.local,
                    self.remote,
                    self.seq_of(self.snd_nxt)
                );
                self.transmit(now);
            }
            _ => {
                self.retransmit_first(now);
                self.rtx_deadline = Some(now + self.rto.rto());
            }
        }
    }

    /// Returns the earliest instant a timer expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.rtx_deadline,
            self.probe_deadline,
            self.time_wait_deadline,
            self.fin_wait2_deadline,
        ]
        .iter()
        .flatten()
        .min()
        .copied()
    }

    /// Appends data to the send buffer and sends what the windows allow. Returns the size
    /// accepted, which is 0 if the send buffer is full.
    pub fn send(&mut self, payload: &[u8], now: Instant) -> Result<usize> {
        match self.state {
            State::Established | State::CloseWait => {}
            State::Closed => return Err(self.error.clone().unwrap_or(Error::NotConnected)),
            State::Listen | State::SynSent | State::SynReceived => {
                return Err(Error::NotConnected)
            }
            _ => return Err(Error::ConnectionClosing),
        }

        let size = self.queue.append(payload);
        if size > 0 {
            trace!(
                "append TCP send buffer of {} -> {} to {} Bytes",
                self.local,
                self.remote,
                self.queue.len()
            );
            self.transmit(now);
        }

        Ok(size)
    }

    /// Reads at most the given size of in-order bytes.
    pub fn receive(&mut self, max: usize, now: Instant) -> Result<Received> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if !self.readable.is_empty() {
            let size = min(max, self.readable.len());
            let data = self.readable.drain(..size).collect();
            self.update_window(now);

            return Ok(Received::Data(data));
        }
        if self.fin_received || self.state == State::Closed {
            return Ok(Received::EndOfStream);
        }
        if self.closed_locally {
            return Err(Error::ConnectionClosing);
        }

        Ok(Received::Pending)
    }

    /// Sends a window update if the application freed a meaningful amount of receive buffer.
    fn update_window(&mut self, now: Instant) {
        if !matches!(
            self.state,
            State::Established | State::FinWait1 | State::FinWait2
        ) || self.fin_received
        {
            return;
        }

        let wnd = (self.rcv_wnd_limit() >> self.rcv_wscale) << self.rcv_wscale;
        if (self.rcv_adv < self.mss && wnd >= self.mss)
            || wnd >= self.rcv_adv + self.recv_capacity / 2
        {
            trace!(
                "update TCP window of {} -> {} to {}",
                self.local,
                self.remote,
                wnd
            );
            self.send_ack(now);
        }
    }

    /// Closes the sending direction. A FIN is sent after all buffered data.
    pub fn close(&mut self, now: Instant) {
        self.closed_locally = true;
        match self.state {
            State::SynSent => {
                self.error = Some(Error::ConnectionClosing);
                self.set_state(State::Closed);
            }
            State::SynReceived | State::Established => {
                self.queue_fin();
                self.set_state(State::FinWait1);
                self.transmit(now);
            }
            State::CloseWait => {
                self.queue_fin();
                self.set_state(State::LastAck);
                self.transmit(now);
            }
            _ => {}
        }
    }

    /// Closes the connection on behalf of a handle which is gone. Once in FIN-WAIT-2, the
    /// connection waits for the FIN of the peer no longer than the FIN timeout.
    pub fn release(&mut self, now: Instant) {
        self.released = true;
        self.close(now);
        if self.state == State::FinWait2 {
            self.arm_fin_wait2(now);
        }
    }

    fn arm_fin_wait2(&mut self, now: Instant) {
        if self.fin_wait2_deadline.is_none() {
            self.fin_wait2_deadline = Some(now + self.fin_timeout);
            trace!(
                "set TCP FIN timeout of {} -> {} to {:?}",
                self.local,
                self.remote,
                self.fin_timeout
            );
        }
    }

    fn queue_fin(&mut self) {
        let fin = self.queue.recv_next();
        self.fin = Some(fin);
        trace!(
            "queue TCP FIN of {} -> {} at {}",
            self.local,
            self.remote,
            self.seq_of(fin)
        );
    }

    /// Resets the connection. A RST is sent if the peer may hold state of it.
    pub fn abort(&mut self) {
        if self.state == State::Closed {
            return;
        }
        if matches!(
            self.state,
            State::SynReceived
                | State::Established
                | State::FinWait1
                | State::FinWait2
                | State::Closing
                | State::CloseWait
                | State::LastAck
        ) {
            let rst = Segment::new(
                self.local.port(),
                self.remote.port(),
                self.seq_of(self.snd_max),
                self.rcv_nxt(),
                Flags::RST | Flags::ACK,
                0,
            );
            self.outbox.push(rst);
        }

        self.closed_locally = true;
        self.error = Some(Error::ConnectionClosing);
        self.set_state(State::Closed);
    }

    fn fail(&mut self, error: Error) {
        trace!(
            "fail TCP {} -> {} with {}",
            self.local,
            self.remote,
            error
        );
        self.error = Some(error);
        self.set_state(State::Closed);
    }

    fn enter_time_wait(&mut self, now: Instant) {
        self.set_state(State::TimeWait);
        self.flights.clear();
        self.rtx_deadline = None;
        self.probe_deadline = None;
        self.fin_wait2_deadline = None;
        self.time_wait_deadline = Some(now + self.linger);
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        self.state = state;
        trace!(
            "set TCP state of {} -> {} to {}",
            self.local,
            self.remote,
            state
        );

        if state == State::Closed {
            self.flights.clear();
            self.rtx_deadline = None;
            self.probe_deadline = None;
            self.time_wait_deadline = None;
        }
    }

    fn set_snd_wnd(&mut self, window: usize) {
        if self.snd_wnd == window {
            return;
        }
        self.snd_wnd = window;
        trace!(
            "set TCP send window of {} -> {} to {}",
            self.local,
            self.remote,
            window
        );
    }

    fn is_acceptable(&self, segment: &Segment) -> bool {
        let len = segment.len() as u32;
        let wnd = min(self.rcv_wnd_limit(), i32::MAX as usize) as u32;
        let nxt = self.rcv_nxt();

        match (len, wnd) {
            (0, 0) => segment.sequence == nxt,
            (0, _) => segment.sequence.within(nxt, nxt + wnd),
            // Only the acknowledgement is processed
            (_, 0) => segment.sequence == nxt,
            _ => {
                segment.sequence.within(nxt, nxt + wnd)
                    || (segment.sequence + (len - 1)).within(nxt, nxt + wnd)
            }
        }
    }

    fn is_fin_acknowledged(&self) -> bool {
        match self.fin {
            Some(fin) => self.snd_una > fin,
            None => false,
        }
    }

    fn seq_of(&self, offset: u64) -> SeqNum {
        self.iss + offset as u32
    }

    fn ack_offset(&self, acknowledgement: SeqNum) -> i64 {
        self.snd_una as i64 + acknowledgement.distance(self.seq_of(self.snd_una)) as i64
    }

    fn rcv_nxt_offset(&self) -> u64 {
        self.window.offset() + self.fin_received as u64
    }

    fn rcv_offset(&self, sequence: SeqNum) -> i64 {
        self.rcv_nxt_offset() as i64 + sequence.distance(self.rcv_nxt()) as i64
    }

    fn rcv_wnd_limit(&self) -> usize {
        min(
            self.recv_capacity.saturating_sub(self.readable.len()),
            MAX_WINDOW << self.rcv_wscale,
        )
    }

    /// Takes the segments waiting to be sent.
    pub fn take_outbox(&mut self) -> Vec<Segment> {
        std::mem::take(&mut self.outbox)
    }

    /// Takes the fast open cookie granted by the peer.
    pub fn take_cookie(&mut self) -> Option<Vec<u8>> {
        self.cookie_received.take()
    }

    /// Returns the local address.
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Returns the remote address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Returns the state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns the error terminated the connection.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Returns if the connection was opened passively.
    pub fn is_passive(&self) -> bool {
        self.passive
    }

    /// Returns the initial send sequence number.
    pub fn iss(&self) -> SeqNum {
        self.iss
    }

    /// Returns the initial receive sequence number.
    pub fn irs(&self) -> Option<SeqNum> {
        self.irs
    }

    /// Returns the oldest unacknowledged sequence number.
    pub fn snd_una(&self) -> SeqNum {
        self.seq_of(self.snd_una)
    }

    /// Returns the next sequence number to send.
    pub fn snd_nxt(&self) -> SeqNum {
        self.seq_of(self.snd_nxt)
    }

    /// Returns the next sequence number expected.
    pub fn rcv_nxt(&self) -> SeqNum {
        self.irs.unwrap_or_default() + self.rcv_nxt_offset() as u32
    }

    /// Returns the window advertised by the peer, scaled.
    pub fn snd_wnd(&self) -> usize {
        self.snd_wnd
    }

    /// Returns the size of the data in flight, counting SYN and FIN.
    pub fn flight_size(&self) -> usize {
        (self.snd_nxt - self.snd_una) as usize
    }

    /// Returns the remaining space of the send buffer.
    pub fn send_remaining(&self) -> usize {
        self.queue.remaining()
    }

    /// Returns the size of the readable bytes.
    pub fn readable(&self) -> usize {
        self.readable.len()
    }

    /// Returns the MSS used for sending.
    pub fn mss(&self) -> usize {
        self.mss
    }

    /// Returns the congestion window.
    pub fn cwnd(&self) -> usize {
        self.cc.cwnd()
    }

    /// Returns the slow start threshold.
    pub fn ssthresh(&self) -> usize {
        self.cc.ssthresh()
    }

    /// Returns the congestion control phase.
    pub fn phase(&self) -> Phase {
        self.cc.phase()
    }

    /// Returns the RTO.
    pub fn rto(&self) -> Duration {
        self.rto.rto()
    }

    /// Returns the count of segments retransmitted.
    pub fn retransmissions(&self) -> usize {
        self.retransmissions
    }
}

impl Display for Tcb {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "TCP {} -> {} {}: una = {}, nxt = {}, wnd = {}, rcv = {}, {}",
            self.local,
            self.remote,
            self.state,
            self.snd_una(),
            self.snd_nxt(),
            self.snd_wnd,
            self.rcv_nxt(),
            self.cc
        )
    }
}

#[cfg(test)]
fn config() -> Config {
    let mut config = Config::default();
    config.mss = 1000;
    config.initial_window = 10;
    config.recv_buffer = 64 * 1024;
    config.send_buffer = 64 * 1024;

    config
}

#[cfg(test)]
fn client_addr() -> SocketAddr {
    "10.0.0.1:40000".parse().unwrap()
}

#[cfg(test)]
fn server_addr() -> SocketAddr {
    "10.0.0.2:80".parse().unwrap()
}

#[cfg(test)]
fn deliver(from: &mut Tcb, to: &mut Tcb, now: Instant) -> usize {
    let segments = from.take_outbox();
    for segment in &segments {
        to.on_segment(segment, now);
    }

    segments.len()
}

#[cfg(test)]
fn handshake(client_config: &Config, server_config: &Config, now: Instant) -> (Tcb, Tcb) {
    let mut client = Tcb::connect(
        client_addr(),
        server_addr(),
        SeqNum::new(u32::MAX - 100),
        client_config,
        FastOpen::Disabled,
        &[],
        now,
    );
    let syn = client.take_outbox().remove(0);
    let mut server = Tcb::accept(
        server_addr(),
        client_addr(),
        &syn,
        SeqNum::new(5000),
        server_config,
        FastOpen::Disabled,
        now,
    );
    deliver(&mut server, &mut client, now);
    deliver(&mut client, &mut server, now);

    (client, server)
}

#[cfg(test)]
fn read_all(tcb: &mut Tcb, now: Instant) -> Vec<u8> {
    let mut v = Vec::new();
    while let Ok(Received::Data(data)) = tcb.receive(1500, now) {
        v.extend(data);
    }

    v
}

#[test]
fn tcb_syn_options() {
    let now = Instant::now();
    let mut client = Tcb::connect(
        client_addr(),
        server_addr(),
        SeqNum::new(1),
        &config(),
        FastOpen::Cookie(Vec::new()),
        &[],
        now,
    );
    let syn = client.take_outbox().remove(0);
    assert_eq!(syn.flags, Flags::SYN);
    assert_eq!(syn.mss(), Some(1000));
    assert_eq!(syn.wscale(), Some(7));
    assert!(syn.is_sack_perm());
    assert!(syn.ts().is_some());
    assert_eq!(syn.cookie(), Some(&b""[..]));
    assert_eq!(client.state(), State::SynSent);
}

#[test]
fn tcb_handshake() {
    let now = Instant::now();
    let (mut client, mut server) = handshake(&config(), &config(), now);
    assert_eq!(client.state(), State::Established);
    assert_eq!(server.state(), State::Established);

    assert_eq!(client.irs(), Some(server.iss()));
    assert_eq!(server.irs(), Some(client.iss()));
    assert_eq!(client.snd_nxt(), client.iss() + 1);
    assert_eq!(client.snd_una(), client.snd_nxt());
    assert_eq!(server.snd_una(), server.snd_nxt());
    assert_eq!(server.rcv_nxt(), client.snd_nxt());
    assert_eq!(client.rcv_nxt(), server.snd_nxt());
    assert_eq!(client.mss(), 1000);

    assert!(client.take_outbox().is_empty());
    assert!(server.take_outbox().is_empty());
}

#[test]
fn tcb_handshake_negotiates_options() {
    let now = Instant::now();
    let mut server_config = config();
    server_config.sack = false;
    server_config.timestamps = false;
    server_config.mss = 1200;
    let (mut client, mut server) = handshake(&config(), &server_config, now);

    client.send(&[1u8; 10], now).unwrap();
    let segment = client.take_outbox().remove(0);
    assert!(segment.options.is_empty());
    server.on_segment(&segment, now);
    assert_eq!(server.mss(), 1000);
    assert_eq!(read_all(&mut server, now), vec![1u8; 10]);
}

#[test]
fn tcb_in_order_delivery_with_reordering() {
    let now = Instant::now();
    let (mut client, mut server) = handshake(&config(), &config(), now);

    let data = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    assert_eq!(client.send(&data, now), Ok(5000));
    let mut segments = client.take_outbox();
    assert_eq!(segments.len(), 5);
    assert!(segments[4].flags.contains(Flags::PSH));

    segments.reverse();
    for segment in &segments {
        server.on_segment(segment, now);
        // Duplicates are dropped
        server.on_segment(segment, now);
    }
    let acks = server.take_outbox();
    assert!(acks[0].sacks().is_some());
    assert_eq!(acks.last().map(|ack| ack.acknowledgement), Some(client.snd_nxt()));
    assert_eq!(read_all(&mut server, now), data);

    let mut una = client.snd_una();
    for ack in &acks {
        client.on_segment(ack, now);
        assert!(client.snd_una().after_or_eq(una));
        una = client.snd_una();
    }
    assert_eq!(client.snd_una(), client.snd_nxt());
    assert_eq!(client.flight_size(), 0);
}

#[test]
fn tcb_old_acknowledgement_ignored() {
    let now = Instant::now();
    let (mut client, mut server) = handshake(&config(), &config(), now);

    client.send(&[1u8; 2000], now).unwrap();
    deliver(&mut client, &mut server, now);
    let acks = server.take_outbox();
    assert_eq!(acks.len(), 2);
    client.on_segment(&acks[1], now);
    let una = client.snd_una();
    client.on_segment(&acks[0], now);
    assert_eq!(client.snd_una(), una);
}

#[test]
fn tcb_window_respected() {
    let now = Instant::now();
    let mut server_config = config();
    server_config.recv_buffer = 4000;
    let (mut client, mut server) = handshake(&config(), &server_config, now);

    let data = (0..20000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    let mut sent = 0;
    let mut received = Vec::new();
    for i in 0..200 {
        if sent < data.len() {
            sent += client.send(&data[sent..], now).unwrap();
        }
        assert!(client.flight_size() <= min(client.snd_wnd(), client.cwnd()));
        deliver(&mut client, &mut server, now);
        if i % 2 == 1 {
            received.extend(read_all(&mut server, now));
        }
        deliver(&mut server, &mut client, now);
        assert!(client.flight_size() <= min(client.snd_wnd(), client.cwnd()));
        if received.len() == data.len() {
            break;
        }
    }
    assert_eq!(received, data);
}

#[test]
fn tcb_zero_window_probe() {
    let now = Instant::now();
    let mut server_config = config();
    server_config.recv_buffer = 2000;
    let (mut client, mut server) = handshake(&config(), &server_config, now);

    client.send(&[1u8; 3000], now).unwrap();
    assert_eq!(deliver(&mut client, &mut server, now), 2);
    deliver(&mut server, &mut client, now);
    assert_eq!(client.snd_wnd(), 0);
    assert_eq!(client.flight_size(), 0);

    let deadline = client.next_deadline().unwrap();
    client.on_timer(deadline);
    let probes = client.take_outbox();
    assert_eq!(probes.len(), 1);
    assert!(probes[0].payload.is_empty());
    assert_eq!(probes[0].sequence, client.snd_una() - 1);
    assert_eq!(client.flight_size(), 0);

    // The probe is answered with the window
    server.on_segment(&probes[0], deadline);
    assert_eq!(server.take_outbox().len(), 1);

    // The window reopens
    assert_eq!(read_all(&mut server, deadline).len(), 2000);
    deliver(&mut server, &mut client, deadline);
    assert!(client.snd_wnd() > 0);
    assert_eq!(deliver(&mut client, &mut server, deadline), 1);
    assert_eq!(read_all(&mut server, deadline).len(), 1000);
}

#[test]
fn tcb_retransmission_timeout() {
    let now = Instant::now();
    let (mut client, mut server) = handshake(&config(), &config(), now);

    client.send(&[7u8; 3000], now).unwrap();
    let lost = client.take_outbox();
    assert_eq!(lost.len(), 3);

    let rto = client.rto();
    let deadline = client.next_deadline().unwrap();
    assert!(deadline >= now + rto && deadline <= now + rto * 2);

    client.on_timer(deadline - Duration::from_millis(1));
    assert!(client.take_outbox().is_empty());

    client.on_timer(deadline);
    let retransmitted = client.take_outbox();
    assert_eq!(retransmitted.len(), 1);
    assert_eq!(retransmitted[0].sequence, lost[0].sequence);
    assert_eq!(retransmitted[0].payload, lost[0].payload);
    assert_eq!(client.cwnd(), client.mss());
    assert_eq!(client.phase(), Phase::SlowStart);
    assert_eq!(client.rto(), rto * 2);
    assert_eq!(client.retransmissions(), 1);

    server.on_segment(&retransmitted[0], deadline);
    deliver(&mut server, &mut client, deadline);
    assert_eq!(client.snd_una(), lost[1].sequence);
    assert_eq!(read_all(&mut server, deadline), vec![7u8; 1000]);
}

#[test]
fn tcb_retransmission_timeout_resends_window() {
    let now = Instant::now();
    let (mut client, mut server) = handshake(&config(), &config(), now);

    client.send(&[3u8; 4000], now).unwrap();
    let lost = client.take_outbox();
    assert_eq!(lost.len(), 4);
    assert_eq!(client.flight_size(), 4000);

    let deadline = client.next_deadline().unwrap();
    client.on_timer(deadline);
    let mut segments = client.take_outbox();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].sequence, lost[0].sequence);
    assert_eq!(client.cwnd(), client.mss());
    assert_eq!(client.flight_size(), client.cwnd());
    assert_eq!(client.snd_nxt(), lost[1].sequence);

    // The rest follows the growing window without another timeout
    let mut now = deadline;
    let mut rounds = 0;
    while !segments.is_empty() {
        for segment in &segments {
            server.on_segment(segment, now);
        }
        deliver(&mut server, &mut client, now);
        assert!(client.flight_size() <= client.cwnd());
        segments = client.take_outbox();
        rounds += 1;
        now += Duration::from_millis(10);
    }
    assert_eq!(rounds, 3);
    assert_eq!(client.retransmissions(), 4);
    assert_eq!(client.snd_una(), client.snd_nxt());
    assert_eq!(client.snd_nxt(), lost[3].sequence + 1000);
    assert_eq!(client.next_deadline(), None);
    assert_eq!(read_all(&mut server, now), vec![3u8; 4000]);
}

#[test]
fn tcb_retransmission_timeout_cumulative_ack() {
    let now = Instant::now();
    let (mut client, mut server) = handshake(&config(), &config(), now);

    client.send(&[5u8; 4000], now).unwrap();
    let sent = client.take_outbox();
    assert_eq!(sent.len(), 4);
    for segment in &sent[1..] {
        server.on_segment(segment, now);
    }
    // Duplicate ACKs are lost as well
    server.take_outbox();

    let deadline = client.next_deadline().unwrap();
    client.on_timer(deadline);
    let retransmitted = client.take_outbox();
    assert_eq!(retransmitted.len(), 1);
    assert_eq!(retransmitted[0].sequence, sent[0].sequence);

    // One ACK covers the rewound sequence and everything sent before the timeout
    server.on_segment(&retransmitted[0], deadline);
    deliver(&mut server, &mut client, deadline);
    assert_eq!(client.snd_una(), sent[3].sequence + 1000);
    assert_eq!(client.snd_nxt(), client.snd_una());
    assert_eq!(client.flight_size(), 0);
    assert!(client.take_outbox().is_empty());
    assert_eq!(client.next_deadline(), None);
    assert_eq!(read_all(&mut server, deadline), vec![5u8; 4000]);
}

#[test]
fn tcb_connect_timeout() {
    let now = Instant::now();
    let mut config = config();
    config.max_retransmits = 2;
    let mut client = Tcb::connect(
        client_addr(),
        server_addr(),
        SeqNum::new(1),
        &config,
        FastOpen::Disabled,
        &[],
        now,
    );
    let syn = client.take_outbox().remove(0);

    for _ in 0..2 {
        let deadline = client.next_deadline().unwrap();
        client.on_timer(deadline);
        let retransmitted = client.take_outbox();
        assert_eq!(retransmitted.len(), 1);
        assert_eq!(retransmitted[0].flags, Flags::SYN);
        assert_eq!(retransmitted[0].sequence, syn.sequence);
    }

    let deadline = client.next_deadline().unwrap();
    client.on_timer(deadline);
    assert_eq!(client.state(), State::Closed);
    assert_eq!(client.error(), Some(&Error::Timeout));
    assert!(client.next_deadline().is_none());
}

#[test]
fn tcb_fast_retransmission() {
    let now = Instant::now();
    let (mut client, mut server) = handshake(&config(), &config(), now);

    client.send(&[1u8; 1000], now).unwrap();
    deliver(&mut client, &mut server, now);
    deliver(&mut server, &mut client, now);

    client.send(&[2u8; 5000], now).unwrap();
    let mut segments = client.take_outbox();
    assert_eq!(segments.len(), 5);
    let lost = segments.remove(0);
    let cwnd = client.cwnd();

    for segment in &segments[..3] {
        server.on_segment(segment, now);
    }
    let duplicates = server.take_outbox();
    assert_eq!(duplicates.len(), 3);
    for duplicate in &duplicates {
        client.on_segment(duplicate, now);
    }

    let ssthresh = max(cwnd / 2, 2 * client.mss());
    assert_eq!(client.phase(), Phase::FastRecovery);
    assert_eq!(client.ssthresh(), ssthresh);
    assert_eq!(client.cwnd(), ssthresh + 3 * client.mss());
    let retransmitted = client.take_outbox();
    assert_eq!(retransmitted.len(), 1);
    assert_eq!(retransmitted[0].sequence, lost.sequence);
    assert_eq!(retransmitted[0].payload, lost.payload);

    server.on_segment(&segments[3], now);
    deliver(&mut server, &mut client, now);
    assert_eq!(client.cwnd(), ssthresh + 4 * client.mss());

    server.on_segment(&retransmitted[0], now);
    deliver(&mut server, &mut client, now);
    assert_eq!(client.phase(), Phase::CongestionAvoidance);
    assert_eq!(client.cwnd(), ssthresh);
    assert_eq!(client.snd_una(), client.snd_nxt());

    let mut expected = vec![1u8; 1000];
    expected.extend(vec![2u8; 5000]);
    assert_eq!(read_all(&mut server, now), expected);
}

#[test]
fn tcb_connection_refused() {
    let now = Instant::now();
    let mut client = Tcb::connect(
        client_addr(),
        server_addr(),
        SeqNum::new(1),
        &config(),
        FastOpen::Disabled,
        &[],
        now,
    );
    let syn = client.take_outbox().remove(0);

    // A RST without an acceptable acknowledgement is ignored
    let mut rst = Segment::new(80, 40000, SeqNum::new(0), SeqNum::new(9), Flags::RST | Flags::ACK, 0);
    client.on_segment(&rst, now);
    assert_eq!(client.state(), State::SynSent);

    rst = Segment::new_rst_for(&syn).unwrap();
    client.on_segment(&rst, now);
    assert_eq!(client.state(), State::Closed);
    assert_eq!(client.error(), Some(&Error::ConnectionRefused));
    assert_eq!(client.receive(10, now), Err(Error::ConnectionRefused));
    assert_eq!(client.send(&[1], now), Err(Error::ConnectionRefused));
}

#[test]
fn tcb_connection_reset() {
    let now = Instant::now();
    let (mut client, mut server) = handshake(&config(), &config(), now);

    server.abort();
    assert_eq!(server.state(), State::Closed);
    assert_eq!(server.error(), Some(&Error::ConnectionClosing));
    deliver(&mut server, &mut client, now);
    assert_eq!(client.state(), State::Closed);
    assert_eq!(client.error(), Some(&Error::ConnectionReset));
    assert_eq!(client.receive(10, now), Err(Error::ConnectionReset));
}

#[test]
fn tcb_syn_in_window_violates_protocol() {
    let now = Instant::now();
    let (_, mut server) = handshake(&config(), &config(), now);

    let syn = Segment::new(40000, 80, server.rcv_nxt(), SeqNum::default(), Flags::SYN, 1000);
    server.on_segment(&syn, now);
    assert_eq!(server.state(), State::Closed);
    assert_eq!(server.error(), Some(&Error::ProtocolViolation));
    let outbox = server.take_outbox();
    assert_eq!(outbox.len(), 1);
    assert!(outbox[0].flags.is_rst());
}

#[test]
fn tcb_out_of_window_acknowledged() {
    let now = Instant::now();
    let (_, mut server) = handshake(&config(), &config(), now);

    let rcv_nxt = server.rcv_nxt();
    let mut segment = Segment::new(40000, 80, rcv_nxt + 1_000_000, server.snd_nxt(), Flags::ACK, 1000);
    segment.payload = vec![1, 2, 3];
    server.on_segment(&segment, now);
    assert_eq!(server.state(), State::Established);
    assert_eq!(server.rcv_nxt(), rcv_nxt);
    assert_eq!(server.readable(), 0);
    let outbox = server.take_outbox();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].acknowledgement, rcv_nxt);
}

#[test]
fn tcb_graceful_close() {
    let now = Instant::now();
    let config = config();
    let (mut client, mut server) = handshake(&config, &config, now);

    client.send(b"bye", now).unwrap();
    client.close(now);
    assert_eq!(client.state(), State::FinWait1);
    assert_eq!(client.send(b"more", now), Err(Error::ConnectionClosing));
    assert_eq!(deliver(&mut client, &mut server, now), 2);
    assert_eq!(server.state(), State::CloseWait);
    assert_eq!(server.receive(100, now), Ok(Received::Data(b"bye".to_vec())));
    assert_eq!(server.receive(100, now), Ok(Received::EndOfStream));

    deliver(&mut server, &mut client, now);
    assert_eq!(client.state(), State::FinWait2);

    server.close(now);
    assert_eq!(server.state(), State::LastAck);
    deliver(&mut server, &mut client, now);
    assert_eq!(client.state(), State::TimeWait);
    assert_eq!(client.receive(100, now), Ok(Received::EndOfStream));

    deliver(&mut client, &mut server, now);
    assert_eq!(server.state(), State::Closed);
    assert!(server.error().is_none());

    let deadline = client.next_deadline().unwrap();
    assert_eq!(deadline, now + config.linger);
    client.on_timer(deadline);
    assert_eq!(client.state(), State::Closed);
}

#[test]
fn tcb_released_fin_wait2_timeout() {
    let now = Instant::now();
    let mut config = config();
    config.fin_timeout = Duration::from_secs(30);
    let (mut client, mut server) = handshake(&config, &config, now);

    // A connection closed by a live handle waits for the peer as long as it takes
    client.close(now);
    deliver(&mut client, &mut server, now);
    deliver(&mut server, &mut client, now);
    assert_eq!(client.state(), State::FinWait2);
    assert_eq!(client.next_deadline(), None);

    let later = now + Duration::from_secs(1);
    client.release(later);
    let deadline = later + config.fin_timeout;
    assert_eq!(client.next_deadline(), Some(deadline));

    client.on_timer(deadline - Duration::from_millis(1));
    assert_eq!(client.state(), State::FinWait2);
    client.on_timer(deadline);
    assert_eq!(client.state(), State::Closed);
    assert_eq!(client.error(), Some(&Error::Timeout));
    assert_eq!(client.next_deadline(), None);
}

#[test]
fn tcb_released_fin_wait2_peer_fin() {
    let now = Instant::now();
    let mut config = config();
    config.fin_timeout = Duration::from_secs(30);
    let (mut client, mut server) = handshake(&config, &config, now);

    client.release(now);
    assert_eq!(client.state(), State::FinWait1);
    deliver(&mut client, &mut server, now);
    deliver(&mut server, &mut client, now);
    assert_eq!(client.state(), State::FinWait2);
    assert_eq!(client.next_deadline(), Some(now + config.fin_timeout));

    server.close(now);
    deliver(&mut server, &mut client, now);
    assert_eq!(client.state(), State::TimeWait);
    assert_eq!(client.next_deadline(), Some(now + config.linger));
}

#[test]
fn tcb_simultaneous_close() {
    let now = Instant::now();
    let (mut client, mut server) = handshake(&config(), &config(), now);

    client.close(now);
    server.close(now);
    let client_fin = client.take_outbox();
    let server_fin = server.take_outbox();
    for segment in &client_fin {
        server.on_segment(segment, now);
    }
    for segment in &server_fin {
        client.on_segment(segment, now);
    }
    assert_eq!(client.state(), State::Closing);
    assert_eq!(server.state(), State::Closing);

    deliver(&mut client, &mut server, now);
    deliver(&mut server, &mut client, now);
    assert_eq!(client.state(), State::TimeWait);
    assert_eq!(server.state(), State::TimeWait);
}

#[test]
fn tcb_time_wait_acknowledges_fin() {
    let now = Instant::now();
    let (mut client, mut server) = handshake(&config(), &config(), now);

    client.close(now);
    deliver(&mut client, &mut server, now);
    deliver(&mut server, &mut client, now);
    server.close(now);
    let fin = server.take_outbox().remove(0);
    client.on_segment(&fin, now);
    assert_eq!(client.state(), State::TimeWait);
    client.take_outbox();

    // The retransmitted FIN is acknowledged again and restarts the linger
    let later = now + Duration::from_secs(1);
    client.on_segment(&fin, later);
    assert_eq!(client.take_outbox().len(), 1);
    assert_eq!(client.next_deadline(), Some(later + config().linger));

    // Anything else is ignored
    let ack = Segment::new(80, 40000, fin.sequence + 1, client.snd_nxt(), Flags::ACK, 10);
    client.on_segment(&ack, later);
    assert!(client.take_outbox().is_empty());
    assert_eq!(client.state(), State::TimeWait);
}

#[test]
fn tcb_fast_open_accepted() {
    let now = Instant::now();
    let mut config = config();
    config.fast_open = true;
    let cookie = vec![1, 2, 3, 4, 5, 6, 7, 8];

    let mut client = Tcb::connect(
        client_addr(),
        server_addr(),
        SeqNum::new(1),
        &config,
        FastOpen::Cookie(cookie.clone()),
        b"hello",
        now,
    );
    let syn = client.take_outbox().remove(0);
    assert_eq!(syn.payload, b"hello".to_vec());
    assert_eq!(syn.cookie(), Some(&cookie[..]));

    let mut server = Tcb::accept(
        server_addr(),
        client_addr(),
        &syn,
        SeqNum::new(100),
        &config,
        FastOpen::Accepted,
        now,
    );
    assert_eq!(server.state(), State::Established);
    assert_eq!(server.receive(100, now), Ok(Received::Data(b"hello".to_vec())));

    deliver(&mut server, &mut client, now);
    assert_eq!(client.state(), State::Established);
    assert_eq!(client.flight_size(), 0);
    deliver(&mut client, &mut server, now);
    assert_eq!(server.snd_una(), server.snd_nxt());
}

#[test]
fn tcb_fast_open_cookie_rejected() {
    let now = Instant::now();
    let mut config = config();
    config.fast_open = true;
    let fresh = vec![9, 9, 9, 9, 9, 9, 9, 9];

    let mut client = Tcb::connect(
        client_addr(),
        server_addr(),
        SeqNum::new(1),
        &config,
        FastOpen::Cookie(vec![1, 2, 3, 4, 5, 6, 7, 8]),
        b"hello",
        now,
    );
    let syn = client.take_outbox().remove(0);
    let mut server = Tcb::accept(
        server_addr(),
        client_addr(),
        &syn,
        SeqNum::new(100),
        &config,
        FastOpen::Cookie(fresh.clone()),
        now,
    );
    assert_eq!(server.state(), State::SynReceived);
    assert_eq!(server.readable(), 0);

    deliver(&mut server, &mut client, now);
    assert_eq!(client.state(), State::Established);
    assert_eq!(client.take_cookie(), Some(fresh));

    // The data is sent again after the handshake
    assert_eq!(deliver(&mut client, &mut server, now), 2);
    assert_eq!(server.state(), State::Established);
    assert_eq!(read_all(&mut server, now), b"hello".to_vec());
}

#[test]
fn tcb_monotonic_acknowledgement() {
    let now = Instant::now();
    let (mut client, mut server) = handshake(&config(), &config(), now);

    client.send(&[3u8; 8000], now).unwrap();
    let segments = client.take_outbox();
    let order = [3, 0, 5, 1, 7, 2, 6, 4];
    let mut acks = Vec::new();
    for i in order.iter() {
        if let Some(segment) = segments.get(*i) {
            server.on_segment(segment, now);
            acks.extend(server.take_outbox());
        }
    }
    // Deliver the acknowledgements in a scrambled order too
    acks.rotate_left(3);

    let mut una = client.snd_una();
    for ack in &acks {
        client.on_segment(ack, now);
        assert!(client.snd_una().after_or_eq(una));
        una = client.snd_una();
    }
}
