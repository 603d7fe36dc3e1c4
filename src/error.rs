//! Support for errors reported by TCP connections.

use std::error;
use std::fmt::{self, Display, Formatter};
use std::io;

/// Enumeration of errors which may be reported to the caller of a TCP connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Represents the peer answered the synchronization with a reset.
    ConnectionRefused,
    /// Represents the peer reset an established connection.
    ConnectionReset,
    /// Represents the connection is closing locally and cannot serve the operation.
    ConnectionClosing,
    /// Represents the retransmission budget is exhausted.
    Timeout,
    /// Represents the operation is not valid in the current state of the connection.
    NotConnected,
    /// Represents the local buffer is full. Retry or wait.
    BufferExhausted,
    /// Represents the peer violated the protocol and the connection is reset.
    ProtocolViolation,
    /// Represents the network layer cannot reach the destination.
    Unreachable,
    /// Represents the local address and port is occupied.
    AddrInUse,
    /// Represents the caller supplied deadline elapsed.
    DeadlineElapsed,
    /// Represents the configuration is invalid.
    InvalidConfig(String),
}

impl Error {
    /// Returns if the error terminates the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::BufferExhausted | Error::DeadlineElapsed | Error::NotConnected
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::ConnectionRefused => write!(f, "connection refused"),
            Error::ConnectionReset => write!(f, "connection reset by peer"),
            Error::ConnectionClosing => write!(f, "connection closing"),
            Error::Timeout => write!(f, "connection timed out"),
            Error::NotConnected => write!(f, "not connected"),
            Error::BufferExhausted => write!(f, "buffer exhausted"),
            Error::ProtocolViolation => write!(f, "protocol violation"),
            Error::Unreachable => write!(f, "destination unreachable"),
            Error::AddrInUse => write!(f, "address in use"),
            Error::DeadlineElapsed => write!(f, "deadline elapsed"),
            Error::InvalidConfig(ref s) => write!(f, "invalid config: {}", s),
        }
    }
}

impl error::Error for Error {}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        let kind = match e {
            Error::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            Error::ConnectionReset | Error::ProtocolViolation => io::ErrorKind::ConnectionReset,
            Error::ConnectionClosing => io::ErrorKind::BrokenPipe,
            Error::Timeout | Error::DeadlineElapsed => io::ErrorKind::TimedOut,
            Error::NotConnected => io::ErrorKind::NotConnected,
            Error::BufferExhausted => io::ErrorKind::WouldBlock,
            Error::Unreachable => io::ErrorKind::AddrNotAvailable,
            Error::AddrInUse => io::ErrorKind::AddrInUse,
            Error::InvalidConfig(_) => io::ErrorKind::InvalidInput,
        };

        io::Error::new(kind, e)
    }
}

/// A specialized `Result` type for TCP connections.
pub type Result<T> = std::result::Result<T, Error>;

#[test]
fn error_into_io_error() {
    let e: io::Error = Error::ConnectionRefused.into();
    assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused);
    assert_eq!(e.to_string(), "connection refused");

    let e: io::Error = Error::BufferExhausted.into();
    assert_eq!(e.kind(), io::ErrorKind::WouldBlock);
}

#[test]
fn error_is_fatal() {
    assert!(Error::ConnectionReset.is_fatal());
    assert!(Error::Timeout.is_fatal());
    assert!(!Error::BufferExhausted.is_fatal());
}
