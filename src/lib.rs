//! A user-space TCP engine running over raw network-layer packets.
//!
//! A [`Stack`] is bound to a local address and sends segments through a [`NetworkSender`].
//! Packets received from the network layer are handed to [`Stack::deliver`], which
//! demultiplexes them to connections or listeners.
//!
//! ```no_run
//! use rawtcp::{Config, Loopback, Stack};
//! use std::net::{IpAddr, Ipv4Addr, SocketAddr};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
//! let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
//! let (a_link, b_link) = Loopback::pair(a, b);
//!
//! let client = Stack::new(a, a_link.clone(), Config::default())?;
//! let server = Stack::new(b, b_link.clone(), Config::default())?;
//! a_link.attach(&client)?;
//! b_link.attach(&server)?;
//!
//! let listener = server.listen(80, 0)?;
//! let connection = client.connect(SocketAddr::new(b, 80)).await?;
//! let accepted = listener.accept().await?;
//!
//! connection.send_all(b"hello").await?;
//! assert_eq!(accepted.receive(1024).await?, Some(b"hello".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod network;
pub mod packet;
pub mod stack;
pub mod stat;
pub mod tcp;

pub use config::Config;
pub use error::{Error, Result};
pub use network::{BlackHole, Datagram, Loopback, NetworkSender, RawSocket};
pub use packet::{DecodeError, EncodeError, Flags, PseudoHeader, Segment, TcpOption};
pub use stack::{Connection, Listener, Stack};
pub use stat::{Counter, Stats};
pub use tcp::{SeqNum, State};
