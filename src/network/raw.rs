//! Support for a raw socket of the operating system as the network layer.

use log::{debug, trace, warn};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use pnet::transport::{
    self, TransportChannelType, TransportProtocol, TransportReceiver, TransportSender,
};
use std::io;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use super::NetworkSender;
use crate::packet::PROTOCOL_TCP;
use crate::stack::Stack;

/// Represents the buffer size of the raw socket.
const BUFFER_SIZE: usize = 256 * 1024;

/// Represents a raw TCP socket bound to a local address. Opening a raw socket requires
/// privileges. The kernel may answer segments for ports it does not know with resets unless
/// they are filtered.
pub struct RawSocket {
    local: IpAddr,
    tx: Mutex<TransportSender>,
    rx: Mutex<Option<TransportReceiver>>,
}

impl RawSocket {
    /// Opens a new `RawSocket` for the family of the local address.
    pub fn open(local: IpAddr) -> io::Result<RawSocket> {
        let protocol = match local {
            IpAddr::V4(_) => TransportProtocol::Ipv4(IpNextHeaderProtocols::Tcp),
            IpAddr::V6(_) => TransportProtocol::Ipv6(IpNextHeaderProtocols::Tcp),
        };
        let (tx, rx) =
            transport::transport_channel(BUFFER_SIZE, TransportChannelType::Layer4(protocol))?;

        Ok(RawSocket {
            local,
            tx: Mutex::new(tx),
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Returns the local address of the socket.
    pub fn local_addr(&self) -> IpAddr {
        self.local
    }

    /// Spawns a thread which delivers segments received by the socket to the stack. A socket
    /// can only be attached once.
    pub fn attach(&self, stack: &Stack) -> io::Result<JoinHandle<()>> {
        let mut rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "raw socket attached"))?;

        let local = self.local;
        let stack = stack.clone();
        let thread = thread::spawn(move || {
            let mut iter = transport::tcp_packet_iter(&mut rx);
            loop {
                match iter.next() {
                    Ok((packet, src)) => {
                        trace!(
                            "receive from raw socket: {} ({} Bytes)",
                            src,
                            packet.packet().len()
                        );
                        stack.deliver(src, local, PROTOCOL_TCP, packet.packet());
                    }
                    Err(ref e) => {
                        warn!("receive from raw socket: {}", e);
                        if e.kind() != io::ErrorKind::Interrupted {
                            break;
                        }
                    }
                }
            }
            debug!("raw socket on {} closed", local);
        });

        Ok(thread)
    }
}

impl NetworkSender for RawSocket {
    fn send(&self, dst: IpAddr, protocol: u8, payload: &[u8]) -> io::Result<()> {
        if protocol != PROTOCOL_TCP {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported protocol {}", protocol),
            ));
        }
        let packet = TcpPacket::new(payload)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "segment too short"))?;

        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send_to(packet, dst)?;

        Ok(())
    }
}
