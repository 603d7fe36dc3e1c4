//! Support for demultiplexing TCP segments to connections and serving applications.
//!
//! A `Stack` owns a connection table keyed by the local port and the remote socket address.
//! Every connection is guarded by its own mutex. The table lock is only held to look up,
//! install or remove a connection, and never while a connection is locked.

use log::{debug, trace, warn};
use lru::LruCache;
use rand::Rng;
use std::cmp::max;
use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::hash::{BuildHasher, Hash, Hasher};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::NetworkSender;
use crate::packet::{self, DecodeError, PseudoHeader, Segment, PROTOCOL_TCP};
use crate::stat::{Counter, Stats};
use crate::tcp::{FastOpen, IsnGenerator, Received, State, Tcb};

/// Represents the first ephemeral port.
const EPHEMERAL_PORT_BEGIN: u16 = 49152;
/// Represents the last ephemeral port.
const EPHEMERAL_PORT_END: u16 = 65535;

/// Represents the key of a connection, as the local port and the remote address.
type Key = (u16, SocketAddr);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Socket {
    key: Key,
    tcb: Mutex<Tcb>,
    /// Wakes application calls waiting on the connection.
    changed: Notify,
    /// Wakes the timer task to recompute its deadline.
    rearm: Notify,
    /// The listener a passive connection is queued to.
    backlog: Option<Weak<Backlog>>,
}

impl Socket {
    fn new(tcb: Tcb, backlog: Option<Weak<Backlog>>) -> Socket {
        Socket {
            key: (tcb.local().port(), tcb.remote()),
            tcb: Mutex::new(tcb),
            changed: Notify::new(),
            rearm: Notify::new(),
            backlog,
        }
    }
}

#[derive(Default)]
struct Pending {
    half_open: usize,
    ready: VecDeque<Arc<Socket>>,
    is_closed: bool,
}

struct Backlog {
    port: u16,
    capacity: usize,
    pending: Mutex<Pending>,
    notify: Notify,
}

impl Backlog {
    fn new(port: u16, capacity: usize) -> Backlog {
        Backlog {
            port,
            capacity,
            pending: Mutex::new(Pending::default()),
            notify: Notify::new(),
        }
    }

    /// Reserves a slot for a half-open connection.
    fn reserve(&self) -> bool {
        let mut pending = lock(&self.pending);
        if pending.is_closed || pending.half_open + pending.ready.len() >= self.capacity {
            return false;
        }
        pending.half_open += 1;

        true
    }

    /// Releases the slot of a half-open connection which is closed.
    fn release(&self) {
        let mut pending = lock(&self.pending);
        pending.half_open = pending.half_open.saturating_sub(1);
    }

    /// Moves a half-open connection to the accept queue.
    fn push(&self, socket: Arc<Socket>) -> bool {
        {
            let mut pending = lock(&self.pending);
            pending.half_open = pending.half_open.saturating_sub(1);
            if pending.is_closed {
                return false;
            }
            pending.ready.push_back(socket);
        }
        self.notify.notify_one();

        true
    }

    fn pop(&self) -> Option<Arc<Socket>> {
        lock(&self.pending).ready.pop_front()
    }
}

struct Shared {
    config: Config,
    local: IpAddr,
    sender: Arc<dyn NetworkSender>,
    handle: Handle,
    connections: Mutex<HashMap<Key, Arc<Socket>>>,
    listeners: Mutex<HashMap<u16, Arc<Backlog>>>,
    isn: IsnGenerator,
    cookies: Mutex<LruCache<IpAddr, Vec<u8>>>,
    cookie_key: RandomState,
    stats: Stats,
}

impl Shared {
    /// Runs an operation on a connection, then transmits its output and handles its state
    /// transition. Waiters are woken when `wake` is set or anything observable changed.
    fn drive<T, F>(self: &Arc<Self>, socket: &Arc<Socket>, wake: bool, f: F) -> T
    where
        F: FnOnce(&mut Tcb, Instant) -> T,
    {
        let now = Instant::now();
        let (result, outbox, before, after, cookie, retransmissions) = {
            let mut tcb = lock(&socket.tcb);
            let before = tcb.state();
            let retransmissions = tcb.retransmissions();
            let result = f(&mut *tcb, now);
            let outbox = tcb.take_outbox();
            let cookie = tcb.take_cookie();

            (
                result,
                outbox,
                before,
                tcb.state(),
                cookie,
                tcb.retransmissions().saturating_sub(retransmissions),
            )
        };

        let remote = socket.key.1;
        for segment in outbox.iter() {
            let _ = self.transmit(remote, segment);
        }
        if retransmissions > 0 {
            self.stats.add(Counter::Retransmissions, retransmissions);
        }
        if let Some(cookie) = cookie {
            trace!("cache TCP fast open cookie of {} ({} Bytes)", remote.ip(), cookie.len());
            lock(&self.cookies).put(remote.ip(), cookie);
        }

        if wake || before != after || !outbox.is_empty() {
            socket.changed.notify_waiters();
        }
        socket.rearm.notify_one();
        if before != after {
            self.on_transition(socket, before, after);
        }

        result
    }

    fn on_transition(self: &Arc<Self>, socket: &Arc<Socket>, before: State, after: State) {
        if !before.is_synchronized() && after.is_synchronized() {
            self.stats.increase(Counter::Established);
        }

        if before == State::SynReceived {
            if let Some(ref backlog) = socket.backlog {
                match backlog.upgrade() {
                    Some(backlog) => match after {
                        State::Closed => backlog.release(),
                        _ => {
                            if !backlog.push(Arc::clone(socket)) {
                                debug!(
                                    "abort TCP {}:{} -> {}: listener closed",
                                    self.local, socket.key.0, socket.key.1
                                );
                                self.drive(socket, true, |tcb, _| tcb.abort());
                            }
                        }
                    },
                    None => {
                        if after != State::Closed {
                            debug!(
                                "abort TCP {}:{} -> {}: listener closed",
                                self.local, socket.key.0, socket.key.1
                            );
                            self.drive(socket, true, |tcb, _| tcb.abort());
                        }
                    }
                }
            }
        }

        if after == State::Closed {
            let mut connections = lock(&self.connections);
            let is_current = connections
                .get(&socket.key)
                .map(|current| Arc::ptr_eq(current, socket))
                .unwrap_or(false);
            if is_current {
                connections.remove(&socket.key);
                trace!(
                    "remove TCP connection of {}:{} -> {}",
                    self.local,
                    socket.key.0,
                    socket.key.1
                );
            }
        }
    }

    fn transmit(&self, remote: SocketAddr, segment: &Segment) -> io::Result<()> {
        let pseudo = PseudoHeader::new(self.local, remote.ip());
        let bytes = match packet::encode(segment, &pseudo) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("encode TCP segment {}: {}", segment, e);
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        };

        if let Err(e) = self.sender.send(remote.ip(), PROTOCOL_TCP, &bytes) {
            warn!("send to {}: {}", remote.ip(), e);
            return Err(e);
        }
        self.stats.increase(Counter::SegmentsSent);
        if segment.flags.is_rst() {
            self.stats.increase(Counter::ResetsSent);
        }
        debug!(
            "send to {}: {} ({} Bytes)",
            remote.ip(),
            segment,
            segment.payload.len()
        );

        Ok(())
    }

    fn reset(&self, remote: SocketAddr, segment: &Segment) {
        if let Some(rst) = Segment::new_rst_for(segment) {
            let _ = self.transmit(remote, &rst);
        }
    }

    fn spawn_timer(self: &Arc<Self>, socket: &Arc<Socket>) {
        let shared = Arc::downgrade(self);
        let socket = Arc::downgrade(socket);
        self.handle.spawn(run_timer(shared, socket));
    }

    /// Returns the fast open cookie granted to the client address.
    fn cookie_for(&self, ip: IpAddr) -> Vec<u8> {
        let mut hasher = self.cookie_key.build_hasher();
        ip.hash(&mut hasher);

        hasher.finish().to_be_bytes().to_vec()
    }

    fn fast_open_reply(&self, ip: IpAddr, syn: &Segment) -> FastOpen {
        if !self.config.fast_open {
            return FastOpen::Disabled;
        }
        match syn.cookie() {
            None => FastOpen::Disabled,
            Some(cookie) => {
                let expected = self.cookie_for(ip);
                if !cookie.is_empty() && cookie == &expected[..] {
                    FastOpen::Accepted
                } else {
                    FastOpen::Cookie(expected)
                }
            }
        }
    }

    /// Handles a segment for no known connection.
    fn listen_or_reset(self: &Arc<Self>, key: Key, segment: &Segment) {
        let remote = key.1;
        let is_syn = segment.flags.is_syn() && !segment.flags.is_ack() && !segment.flags.is_rst();
        let backlog = match is_syn {
            true => lock(&self.listeners).get(&key.0).cloned(),
            false => None,
        };
        let backlog = match backlog {
            Some(backlog) => backlog,
            None => {
                trace!(
                    "reset TCP segment to unknown {}:{} from {}",
                    self.local,
                    key.0,
                    remote
                );
                self.reset(remote, segment);
                return;
            }
        };

        if !backlog.reserve() {
            debug!("refuse TCP {}: backlog of port {} full", remote, key.0);
            self.stats.increase(Counter::BacklogRefused);
            self.reset(remote, segment);
            return;
        }

        let fast_open = self.fast_open_reply(remote.ip(), segment);
        let tcb = Tcb::accept(
            SocketAddr::new(self.local, key.0),
            remote,
            segment,
            self.isn.generate(),
            &self.config,
            fast_open,
            Instant::now(),
        );
        let is_established = tcb.state() == State::Established;
        let socket = Arc::new(Socket::new(tcb, Some(Arc::downgrade(&backlog))));

        {
            let mut connections = lock(&self.connections);
            if connections.contains_key(&key) {
                drop(connections);
                backlog.release();
                return;
            }
            connections.insert(key, Arc::clone(&socket));
        }
        trace!(
            "add TCP connection of {}:{} -> {}",
            self.local,
            key.0,
            remote
        );

        self.spawn_timer(&socket);
        self.drive(&socket, false, |_, _| ());
        if is_established {
            self.stats.increase(Counter::Established);
            if !backlog.push(Arc::clone(&socket)) {
                self.drive(&socket, true, |tcb, _| tcb.abort());
            }
        }
    }
}

async fn run_timer(shared: Weak<Shared>, socket: Weak<Socket>) {
    loop {
        let socket = match socket.upgrade() {
            Some(socket) => socket,
            None => return,
        };
        let rearm = socket.rearm.notified();
        let deadline = {
            let tcb = lock(&socket.tcb);
            if tcb.state() == State::Closed {
                return;
            }
            tcb.next_deadline()
        };

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = time::sleep_until(time::Instant::from_std(deadline)) => {
                        match shared.upgrade() {
                            Some(shared) => shared.drive(&socket, true, |tcb, now| tcb.on_timer(now)),
                            None => return,
                        }
                    }
                    _ = rearm => {}
                }
            }
            None => rearm.await,
        }
    }
}

fn allocate_port(connections: &HashMap<Key, Arc<Socket>>, remote: SocketAddr) -> Option<u16> {
    let count = (EPHEMERAL_PORT_END - EPHEMERAL_PORT_BEGIN) as u32 + 1;
    let start = rand::thread_rng().gen_range(0..count);

    (0..count)
        .map(|i| EPHEMERAL_PORT_BEGIN + ((start + i) % count) as u16)
        .find(|port| !connections.contains_key(&(*port, remote)))
}

/// Represents a user-space TCP stack bound to a local address.
#[derive(Clone)]
pub struct Stack {
    inner: Arc<Shared>,
}

impl Stack {
    /// Creates a new `Stack` sending through the network sender. It must be created within a
    /// Tokio runtime, which drives the timers of its connections.
    pub fn new(local: IpAddr, sender: Arc<dyn NetworkSender>, config: Config) -> Result<Stack> {
        config.validate().map_err(Error::InvalidConfig)?;
        let handle = Handle::try_current()
            .map_err(|e| Error::InvalidConfig(format!("runtime: {}", e)))?;
        let cookies = LruCache::new(max(1, config.fast_open_cache));

        Ok(Stack {
            inner: Arc::new(Shared {
                config,
                local,
                sender,
                handle,
                connections: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                isn: IsnGenerator::new(),
                cookies: Mutex::new(cookies),
                cookie_key: RandomState::new(),
                stats: Stats::new(),
            }),
        })
    }

    /// Delivers a packet received from the network layer to the stack. Packets of other
    /// protocols or for other addresses are ignored, malformed segments are dropped.
    pub fn deliver(&self, src: IpAddr, dst: IpAddr, protocol: u8, payload: &[u8]) {
        let shared = &self.inner;
        if protocol != PROTOCOL_TCP || dst != shared.local {
            return;
        }

        let segment = match packet::decode(payload, &PseudoHeader::new(src, dst)) {
            Ok(segment) => segment,
            Err(DecodeError::Checksum) => {
                shared.stats.increase(Counter::Checksum);
                trace!("drop TCP segment from {}: {}", src, DecodeError::Checksum);
                return;
            }
            Err(ref e) => {
                shared.stats.increase(Counter::Malformed);
                debug!("drop TCP segment from {}: {}", src, e);
                return;
            }
        };
        shared.stats.increase(Counter::SegmentsReceived);
        debug!(
            "receive from {}: {} ({} Bytes)",
            src,
            segment,
            segment.payload.len()
        );

        let key = (segment.dst, SocketAddr::new(src, segment.src));
        let socket = lock(&shared.connections).get(&key).cloned();
        match socket {
            Some(socket) => shared.drive(&socket, true, |tcb, now| tcb.on_segment(&segment, now)),
            None => shared.listen_or_reset(key, &segment),
        }
    }

    /// Opens a connection to the remote address.
    pub async fn connect(&self, remote: SocketAddr) -> Result<Connection> {
        self.connect_with(remote, &[]).await
    }

    /// Opens a connection to the remote address and sends the data. The data is placed in
    /// the SYN if fast open is enabled and a cookie of the remote is cached.
    pub async fn connect_with(&self, remote: SocketAddr, data: &[u8]) -> Result<Connection> {
        let shared = &self.inner;
        if remote.is_ipv4() != shared.local.is_ipv4() {
            return Err(Error::Unreachable);
        }

        let fast_open = match shared.config.fast_open {
            true => match lock(&shared.cookies).get(&remote.ip()) {
                Some(cookie) => FastOpen::Cookie(cookie.clone()),
                None => FastOpen::Cookie(Vec::new()),
            },
            false => FastOpen::Disabled,
        };
        let queued = &data[..data.len().min(shared.config.send_buffer)];

        let socket = {
            let mut connections = lock(&shared.connections);
            let port = allocate_port(&connections, remote).ok_or(Error::AddrInUse)?;
            let tcb = Tcb::connect(
                SocketAddr::new(shared.local, port),
                remote,
                shared.isn.generate(),
                &shared.config,
                fast_open,
                queued,
                Instant::now(),
            );
            let socket = Arc::new(Socket::new(tcb, None));
            connections.insert(socket.key, Arc::clone(&socket));

            socket
        };
        trace!(
            "add TCP connection of {}:{} -> {}",
            shared.local,
            socket.key.0,
            remote
        );

        let syn = lock(&socket.tcb).take_outbox();
        for segment in syn.iter() {
            if shared.transmit(remote, segment).is_err() {
                shared.drive(&socket, true, |tcb, _| tcb.abort());
                return Err(Error::Unreachable);
            }
        }
        shared.spawn_timer(&socket);

        let connection = Connection {
            shared: Arc::clone(shared),
            socket,
        };
        connection
            .wait(|tcb, _| match tcb.state() {
                State::SynSent | State::SynReceived => Ok(None),
                State::Closed => Err(tcb.error().cloned().unwrap_or(Error::ConnectionRefused)),
                _ => Ok(Some(())),
            })
            .await?;

        if queued.len() < data.len() {
            connection.send_all(&data[queued.len()..]).await?;
        }

        Ok(connection)
    }

    /// Listens on the local port. A backlog of 0 uses the configured backlog.
    pub fn listen(&self, port: u16, backlog: usize) -> Result<Listener> {
        let capacity = match backlog {
            0 => self.inner.config.backlog,
            n => n,
        };

        let backlog = {
            let mut listeners = lock(&self.inner.listeners);
            if listeners.contains_key(&port) {
                return Err(Error::AddrInUse);
            }
            let backlog = Arc::new(Backlog::new(port, capacity));
            listeners.insert(port, Arc::clone(&backlog));

            backlog
        };
        debug!("listen TCP on {}:{} (backlog {})", self.inner.local, port, capacity);

        Ok(Listener {
            shared: Arc::clone(&self.inner),
            backlog,
        })
    }

    /// Returns the local address of the stack.
    pub fn local_addr(&self) -> IpAddr {
        self.inner.local
    }

    /// Returns the configuration of the stack.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the statistics of the stack.
    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    /// Returns the count of connections in the table.
    pub fn connections(&self) -> usize {
        lock(&self.inner.connections).len()
    }
}

/// Represents a TCP listener.
pub struct Listener {
    shared: Arc<Shared>,
    backlog: Arc<Backlog>,
}

impl Listener {
    /// Waits for a peer to complete the handshake and returns the connection.
    pub async fn accept(&self) -> Result<Connection> {
        loop {
            let notified = self.backlog.notify.notified();
            if let Some(socket) = self.backlog.pop() {
                self.shared.stats.increase(Counter::Accepted);
                return Ok(Connection {
                    shared: Arc::clone(&self.shared),
                    socket,
                });
            }
            notified.await;
        }
    }

    /// Returns the local address of the listener.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.shared.local, self.backlog.port)
    }

    /// Returns the state of the listener.
    pub fn state(&self) -> State {
        State::Listen
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let sockets = {
            let mut pending = lock(&self.backlog.pending);
            pending.is_closed = true;
            pending.ready.drain(..).collect::<Vec<_>>()
        };
        lock(&self.shared.listeners).remove(&self.backlog.port);
        for socket in sockets.iter() {
            self.shared.drive(socket, true, |tcb, _| tcb.abort());
        }
        debug!("close TCP listener on {}", self.local_addr());
    }
}

/// Represents a TCP connection. Dropping a connection closes it in the background.
pub struct Connection {
    shared: Arc<Shared>,
    socket: Arc<Socket>,
}

impl Connection {
    /// Waits until the check returns a value or fails.
    async fn wait<T, F>(&self, mut check: F) -> Result<T>
    where
        F: FnMut(&mut Tcb, Instant) -> Result<Option<T>>,
    {
        loop {
            let notified = self.socket.changed.notified();
            if let Some(value) = self.shared.drive(&self.socket, false, &mut check)? {
                return Ok(value);
            }
            notified.await;
        }
    }

    /// Sends data and returns the count of bytes accepted into the send buffer, waiting while
    /// the buffer is full.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        self.wait(|tcb, now| match tcb.send(data, now)? {
            0 => Ok(None),
            size => Ok(Some(size)),
        })
        .await
    }

    /// Sends all the data, waiting while the send buffer is full.
    pub async fn send_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let size = self.send(data).await?;
            data = &data[size..];
        }

        Ok(())
    }

    /// Sends data without waiting. Fails with `BufferExhausted` if the send buffer is full.
    pub fn try_send(&self, data: &[u8]) -> Result<usize> {
        let size = self
            .shared
            .drive(&self.socket, false, |tcb, now| tcb.send(data, now))?;
        if size == 0 && !data.is_empty() {
            return Err(Error::BufferExhausted);
        }

        Ok(size)
    }

    /// Receives up to `max` bytes in stream order, waiting until data is available. Returns
    /// `None` at the end of stream.
    pub async fn receive(&self, max: usize) -> Result<Option<Vec<u8>>> {
        self.wait(|tcb, now| match tcb.receive(max, now)? {
            Received::Data(data) => Ok(Some(Some(data))),
            Received::EndOfStream => Ok(Some(None)),
            Received::Pending => Ok(None),
        })
        .await
    }

    /// Receives like `receive`, failing with `DeadlineElapsed` if nothing arrives in time.
    pub async fn receive_timeout(
        &self,
        max: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        match time::timeout(timeout, self.receive(max)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineElapsed),
        }
    }

    /// Closes the connection and waits for the teardown with the peer.
    pub async fn close(&self) -> Result<()> {
        self.shared
            .drive(&self.socket, false, |tcb, now| tcb.close(now));

        self.wait(|tcb, _| match tcb.state() {
            State::TimeWait => Ok(Some(())),
            State::Closed => match tcb.error() {
                None | Some(Error::ConnectionClosing) => Ok(Some(())),
                Some(e) => Err(e.clone()),
            },
            _ => Ok(None),
        })
        .await
    }

    /// Resets the connection.
    pub fn abort(&self) {
        self.shared.drive(&self.socket, true, |tcb, _| tcb.abort());
    }

    /// Returns the state of the connection.
    pub fn state(&self) -> State {
        lock(&self.socket.tcb).state()
    }

    /// Returns the local address of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.shared.local, self.socket.key.0)
    }

    /// Returns the remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.socket.key.1
    }

    /// Runs a function with a view of the control block of the connection.
    pub fn inspect<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&Tcb) -> T,
    {
        f(&*lock(&self.socket.tcb))
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", lock(&self.socket.tcb))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared
            .drive(&self.socket, true, |tcb, now| tcb.release(now));
    }
}
