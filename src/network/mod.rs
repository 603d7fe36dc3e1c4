//! Support for the network layer beneath the TCP stack.

use log::{trace, warn};
use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::stack::Stack;

pub mod raw;
pub use raw::RawSocket;

/// Trait for sending packets of the network layer.
pub trait NetworkSender: Send + Sync {
    /// Sends the payload to the destination in a packet carrying the given protocol.
    fn send(&self, dst: IpAddr, protocol: u8, payload: &[u8]) -> io::Result<()>;
}

/// Represents a packet of the network layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    /// Represents the source address.
    pub src: IpAddr,
    /// Represents the destination address.
    pub dst: IpAddr,
    /// Represents the protocol number of the payload, 6 for TCP.
    pub protocol: u8,
    /// Represents the payload, which is a serialized segment for TCP.
    pub payload: Vec<u8>,
}

impl Display for Datagram {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{} -> {} (protocol {}, {} Bytes)",
            self.src,
            self.dst,
            self.protocol,
            self.payload.len()
        )
    }
}

/// Represents a virtual sender which will discard all outgoing traffic.
#[derive(Debug, Default)]
pub struct BlackHole {}

impl BlackHole {
    /// Constructs a new `BlackHole`.
    pub fn new() -> BlackHole {
        BlackHole {}
    }
}

impl NetworkSender for BlackHole {
    fn send(&self, _: IpAddr, _: u8, _: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

type Filter = Box<dyn FnMut(&Datagram) -> bool + Send>;

/// Represents an endpoint of an in-memory link between two stacks.
pub struct Loopback {
    local: IpAddr,
    peer: IpAddr,
    tx: UnboundedSender<Datagram>,
    rx: Mutex<Option<UnboundedReceiver<Datagram>>>,
    filter: Mutex<Option<Filter>>,
}

impl Loopback {
    /// Creates a pair of connected `Loopback`s with the given addresses.
    pub fn pair(a: IpAddr, b: IpAddr) -> (Arc<Loopback>, Arc<Loopback>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a_end = Loopback {
            local: a,
            peer: b,
            tx: b_tx,
            rx: Mutex::new(Some(a_rx)),
            filter: Mutex::new(None),
        };
        let b_end = Loopback {
            local: b,
            peer: a,
            tx: a_tx,
            rx: Mutex::new(Some(b_rx)),
            filter: Mutex::new(None),
        };

        (Arc::new(a_end), Arc::new(b_end))
    }

    /// Returns the address of the endpoint.
    pub fn local_addr(&self) -> IpAddr {
        self.local
    }

    /// Sets a filter on outgoing datagrams. A datagram is dropped if the filter returns `true`.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: FnMut(&Datagram) -> bool + Send + 'static,
    {
        *self.filter.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(filter));
    }

    /// Removes the filter on outgoing datagrams.
    pub fn clear_filter(&self) {
        *self.filter.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Spawns a task which delivers datagrams arriving at the endpoint to the stack. An
    /// endpoint can only be attached once.
    pub fn attach(&self, stack: &Stack) -> io::Result<JoinHandle<()>> {
        let mut rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "loopback attached"))?;

        let stack = stack.clone();
        let handle = tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                stack.deliver(
                    datagram.src,
                    datagram.dst,
                    datagram.protocol,
                    &datagram.payload,
                );
            }
            trace!("loopback closed");
        });

        Ok(handle)
    }
}

impl NetworkSender for Loopback {
    fn send(&self, dst: IpAddr, protocol: u8, payload: &[u8]) -> io::Result<()> {
        if dst != self.peer {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no route to {}", dst),
            ));
        }

        let datagram = Datagram {
            src: self.local,
            dst,
            protocol,
            payload: payload.to_vec(),
        };
        if let Some(ref mut filter) = *self.filter.lock().unwrap_or_else(PoisonError::into_inner) {
            if filter(&datagram) {
                trace!("drop datagram {}", datagram);
                return Ok(());
            }
        }

        if self.tx.send(datagram).is_err() {
            warn!("send to loopback: peer closed");
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "loopback closed"));
        }

        Ok(())
    }
}

#[test]
fn loopback_routes_to_peer_only() {
    use std::net::Ipv4Addr;

    let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let (a_end, b_end) = Loopback::pair(a, b);

    a_end.send(b, 6, &[1, 2, 3]).unwrap();
    let err = a_end
        .send(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 6, &[])
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);

    let mut rx = b_end.rx.lock().unwrap().take().unwrap();
    let datagram = rx.try_recv().unwrap();
    assert_eq!(datagram.src, a);
    assert_eq!(datagram.dst, b);
    assert_eq!(datagram.payload, vec![1, 2, 3]);
    assert!(rx.try_recv().is_err());
}

#[test]
fn loopback_filter_drops() {
    use std::net::Ipv4Addr;

    let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let (a_end, b_end) = Loopback::pair(a, b);

    let mut count = 0;
    a_end.set_filter(move |_| {
        count += 1;
        count == 1
    });
    a_end.send(b, 6, &[1]).unwrap();
    a_end.send(b, 6, &[2]).unwrap();
    a_end.clear_filter();
    a_end.send(b, 6, &[3]).unwrap();

    let mut rx = b_end.rx.lock().unwrap().take().unwrap();
    assert_eq!(rx.try_recv().unwrap().payload, vec![2]);
    assert_eq!(rx.try_recv().unwrap().payload, vec![3]);
}
