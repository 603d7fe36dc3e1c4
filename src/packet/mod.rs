//! Support for serializing and deserializing TCP segments.

use crate::tcp::SeqNum;
use pnet::packet::tcp::{self, MutableTcpPacket, TcpPacket};
use pnet::packet::Packet;
use std::error;
use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;

pub mod option;
pub use option::TcpOption;

/// Represents the IP protocol number of TCP.
pub const PROTOCOL_TCP: u8 = 6;

/// Represents the size of a TCP header without options.
pub const MINIMUM_HEADER_LEN: usize = 20;

/// Represents the flags of a TCP segment.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Flags(u16);

impl Flags {
    /// Represents the FIN flag.
    pub const FIN: Flags = Flags(0x01);
    /// Represents the SYN flag.
    pub const SYN: Flags = Flags(0x02);
    /// Represents the RST flag.
    pub const RST: Flags = Flags(0x04);
    /// Represents the PSH flag.
    pub const PSH: Flags = Flags(0x08);
    /// Represents the ACK flag.
    pub const ACK: Flags = Flags(0x10);
    /// Represents the URG flag.
    pub const URG: Flags = Flags(0x20);

    /// Represents no flags.
    pub const fn empty() -> Flags {
        Flags(0)
    }

    /// Creates `Flags` from raw bits. Bits other than the defined flags are dropped.
    pub const fn from_bits(bits: u16) -> Flags {
        Flags(bits & 0x3f)
    }

    /// Returns the raw bits of the flags.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Returns if all of the given flags are set.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns if the SYN flag is set.
    pub fn is_syn(self) -> bool {
        self.contains(Flags::SYN)
    }

    /// Returns if the ACK flag is set.
    pub fn is_ack(self) -> bool {
        self.contains(Flags::ACK)
    }

    /// Returns if the FIN flag is set.
    pub fn is_fin(self) -> bool {
        self.contains(Flags::FIN)
    }

    /// Returns if the RST flag is set.
    pub fn is_rst(self) -> bool {
        self.contains(Flags::RST)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl Display for Flags {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut flags = String::from("[");
        if self.is_syn() {
            flags += "S";
        }
        if self.is_rst() {
            flags += "R";
        }
        if self.is_fin() {
            flags += "F";
        }
        if self.contains(Flags::PSH) {
            flags += "P";
        }
        if self.contains(Flags::URG) {
            flags += "U";
        }
        if self.is_ack() {
            flags += ".";
        }
        flags += "]";

        write!(f, "{}", flags)
    }
}

/// Represents the pseudo header used in computing the checksum.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PseudoHeader {
    /// Represents the source IP address.
    pub src: IpAddr,
    /// Represents the destination IP address.
    pub dst: IpAddr,
}

impl PseudoHeader {
    /// Creates a new `PseudoHeader`.
    pub fn new(src: IpAddr, dst: IpAddr) -> PseudoHeader {
        PseudoHeader { src, dst }
    }

    /// Computes the checksum of the serialized segment. The checksum field is skipped.
    fn checksum(&self, packet: &TcpPacket) -> Option<u16> {
        match (self.src, self.dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Some(tcp::ipv4_checksum(packet, &src, &dst)),
            (IpAddr::V6(src), IpAddr::V6(dst)) => Some(tcp::ipv6_checksum(packet, &src, &dst)),
            _ => None,
        }
    }
}

/// Enumeration of errors in deserializing a segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// Represents the buffer is shorter than the header.
    Truncated,
    /// Represents the header length field is out of range.
    BadHeaderLength(u8),
    /// Represents an option of the kind overruns the option space or has a wrong length.
    BadOption(u8),
    /// Represents the checksum mismatches.
    Checksum,
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "truncated segment"),
            DecodeError::BadHeaderLength(n) => write!(f, "bad header length {}", n),
            DecodeError::BadOption(kind) => write!(f, "bad option of kind {}", kind),
            DecodeError::Checksum => write!(f, "checksum mismatch"),
        }
    }
}

impl error::Error for DecodeError {}

/// Enumeration of errors in serializing a segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncodeError {
    /// Represents the options exceed the option space, in bytes.
    OptionsTooLong(usize),
    /// Represents an option holds invalid values.
    InvalidOption(&'static str),
    /// Represents the source and destination are in different address families.
    AddressFamily,
    /// Represents the buffer is shorter than the header, in bytes.
    BufferTooShort(usize),
}

impl Display for EncodeError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            EncodeError::OptionsTooLong(n) => write!(f, "options too long: {} Bytes", n),
            EncodeError::InvalidOption(s) => write!(f, "invalid option: {}", s),
            EncodeError::AddressFamily => write!(f, "address family mismatch"),
            EncodeError::BufferTooShort(n) => write!(f, "buffer too short: {} Bytes", n),
        }
    }
}

impl error::Error for EncodeError {}

/// Represents a TCP segment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    /// Represents the source port.
    pub src: u16,
    /// Represents the destination port.
    pub dst: u16,
    /// Represents the sequence number.
    pub sequence: SeqNum,
    /// Represents the acknowledgement number.
    pub acknowledgement: SeqNum,
    /// Represents the flags.
    pub flags: Flags,
    /// Represents the window as it is on the wire, unscaled.
    pub window: u16,
    /// Represents the urgent pointer.
    pub urgent: u16,
    /// Represents the options.
    pub options: Vec<TcpOption>,
    /// Represents the payload.
    pub payload: Vec<u8>,
}

impl Segment {
    /// Creates a `Segment` without options and payload.
    pub fn new(
        src: u16,
        dst: u16,
        sequence: SeqNum,
        acknowledgement: SeqNum,
        flags: Flags,
        window: u16,
    ) -> Segment {
        Segment {
            src,
            dst,
            sequence,
            acknowledgement,
            flags,
            window,
            urgent: 0,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Creates a `Segment` represents a TCP RST answering the given segment which belongs to no
    /// connection. Returns `None` if the given segment is a TCP RST itself.
    pub fn new_rst_for(segment: &Segment) -> Option<Segment> {
        if segment.flags.is_rst() {
            return None;
        }

        let rst = match segment.flags.is_ack() {
            true => Segment::new(
                segment.dst,
                segment.src,
                segment.acknowledgement,
                SeqNum::default(),
                Flags::RST,
                0,
            ),
            false => Segment::new(
                segment.dst,
                segment.src,
                SeqNum::default(),
                segment.sequence + segment.len() as u32,
                Flags::RST | Flags::ACK,
                0,
            ),
        };

        Some(rst)
    }

    /// Returns the length of the segment in the sequence space, counting SYN and FIN.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        let mut n = self.payload.len();
        if self.flags.is_syn() {
            n += 1;
        }
        if self.flags.is_fin() {
            n += 1;
        }

        n
    }

    /// Returns the length of the header when converted into a byte-array.
    pub fn header_len(&self) -> usize {
        let options = self.options.iter().map(|o| o.len()).sum::<usize>();

        MINIMUM_HEADER_LEN + (options + 3) / 4 * 4
    }

    /// Returns the MSS option of the segment.
    pub fn mss(&self) -> Option<u16> {
        self.options.iter().find_map(|option| match option {
            TcpOption::MaxSegmentSize(mss) => Some(*mss),
            _ => None,
        })
    }

    /// Returns the window scale option of the segment.
    pub fn wscale(&self) -> Option<u8> {
        self.options.iter().find_map(|option| match option {
            TcpOption::WindowScale(wscale) => Some(*wscale),
            _ => None,
        })
    }

    /// Returns the timestamps option of the segment.
    pub fn ts(&self) -> Option<(u32, u32)> {
        self.options.iter().find_map(|option| match option {
            TcpOption::Timestamps(ts, ts_ecr) => Some((*ts, *ts_ecr)),
            _ => None,
        })
    }

    /// Returns the selective acknowledgements of the segment.
    pub fn sacks(&self) -> Option<&[(SeqNum, SeqNum)]> {
        self.options.iter().find_map(|option| match option {
            TcpOption::SackBlocks(blocks) => Some(blocks.as_slice()),
            _ => None,
        })
    }

    /// Returns the fast open cookie of the segment.
    pub fn cookie(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            TcpOption::FastOpenCookie(cookie) => Some(cookie.as_slice()),
            _ => None,
        })
    }

    /// Returns if the segment indicates selective acknowledgements permitted.
    pub fn is_sack_perm(&self) -> bool {
        self.options
            .iter()
            .any(|option| *option == TcpOption::SackPermitted)
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "TCP: {} -> {} {} seq {} ack {} win {}",
            self.src, self.dst, self.flags, self.sequence, self.acknowledgement, self.window
        )?;
        for option in &self.options {
            write!(f, ", {}", option)?;
        }

        Ok(())
    }
}

/// Deserializes a segment from the given bytes and validates its checksum against the pseudo
/// header.
pub fn decode(bytes: &[u8], pseudo: &PseudoHeader) -> Result<Segment, DecodeError> {
    let packet = TcpPacket::new(bytes).ok_or(DecodeError::Truncated)?;

    let data_offset = packet.get_data_offset();
    let header_len = data_offset as usize * 4;
    if header_len < MINIMUM_HEADER_LEN {
        return Err(DecodeError::BadHeaderLength(data_offset));
    }
    if header_len > bytes.len() {
        return Err(DecodeError::Truncated);
    }

    match pseudo.checksum(&packet) {
        Some(checksum) if checksum == packet.get_checksum() => {}
        _ => return Err(DecodeError::Checksum),
    }

    let options = option::parse_options(&bytes[MINIMUM_HEADER_LEN..header_len])?;

    Ok(Segment {
        src: packet.get_source(),
        dst: packet.get_destination(),
        sequence: SeqNum::new(packet.get_sequence()),
        acknowledgement: SeqNum::new(packet.get_acknowledgement()),
        flags: Flags::from_bits(packet.get_flags() as u16),
        window: packet.get_window(),
        urgent: packet.get_urgent_ptr(),
        options,
        payload: bytes[header_len..].to_vec(),
    })
}

/// Serializes a segment into a byte-array with the checksum computed over the pseudo header.
pub fn encode(segment: &Segment, pseudo: &PseudoHeader) -> Result<Vec<u8>, EncodeError> {
    let options = option::serialize_options(&segment.options)?;
    let header_len = MINIMUM_HEADER_LEN + options.len();

    let mut buffer = vec![0u8; header_len + segment.payload.len()];
    buffer[MINIMUM_HEADER_LEN..header_len].copy_from_slice(&options);
    buffer[header_len..].copy_from_slice(&segment.payload);

    // The buffer always holds the header, since it is sized from the header length
    let size = buffer.len();
    let mut packet =
        MutableTcpPacket::new(&mut buffer).ok_or(EncodeError::BufferTooShort(size))?;
    packet.set_source(segment.src);
    packet.set_destination(segment.dst);
    packet.set_sequence(segment.sequence.get());
    packet.set_acknowledgement(segment.acknowledgement.get());
    packet.set_data_offset((header_len / 4) as u8);
    packet.set_flags(segment.flags.bits() as _);
    packet.set_window(segment.window);
    packet.set_urgent_ptr(segment.urgent);

    // Compute checksum
    let checksum = pseudo
        .checksum(&packet.to_immutable())
        .ok_or(EncodeError::AddressFamily)?;
    packet.set_checksum(checksum);

    Ok(packet.packet().to_vec())
}

#[cfg(test)]
fn pseudo_v4() -> PseudoHeader {
    PseudoHeader::new(
        IpAddr::from([192, 168, 1, 1]),
        IpAddr::from([192, 168, 1, 2]),
    )
}

#[cfg(test)]
fn syn() -> Segment {
    let mut segment = Segment::new(
        40000,
        80,
        SeqNum::new(u32::MAX - 3),
        SeqNum::default(),
        Flags::SYN,
        65535,
    );
    segment.options = vec![
        TcpOption::MaxSegmentSize(1460),
        TcpOption::SackPermitted,
        TcpOption::Timestamps(1000, 0),
        TcpOption::WindowScale(7),
        TcpOption::FastOpenCookie(Vec::new()),
    ];

    segment
}

#[test]
fn segment_round_trip() {
    let pseudo = pseudo_v4();
    let segment = syn();
    let bytes = encode(&segment, &pseudo).unwrap();
    assert_eq!(bytes.len(), segment.header_len());
    assert_eq!(bytes.len() % 4, 0);
    assert_eq!(decode(&bytes, &pseudo).unwrap(), segment);

    let mut segment = Segment::new(
        80,
        40000,
        SeqNum::new(7),
        SeqNum::new(9),
        Flags::ACK | Flags::PSH,
        512,
    );
    segment.payload = b"hello world".to_vec();
    segment.options = vec![TcpOption::SackBlocks(vec![(SeqNum::new(20), SeqNum::new(30))])];
    let bytes = encode(&segment, &pseudo).unwrap();
    assert_eq!(decode(&bytes, &pseudo).unwrap(), segment);
}

#[test]
fn segment_round_trip_v6() {
    let pseudo = PseudoHeader::new(
        "fe80::1".parse().unwrap(),
        "fe80::2".parse().unwrap(),
    );
    let mut segment = syn();
    segment.payload = vec![1, 2, 3];
    let bytes = encode(&segment, &pseudo).unwrap();
    assert_eq!(decode(&bytes, &pseudo).unwrap(), segment);
}

#[test]
fn segment_checksum_rejected() {
    let pseudo = pseudo_v4();
    let mut segment = syn();
    segment.payload = vec![0xaa; 33];
    let bytes = encode(&segment, &pseudo).unwrap();

    for i in 0..bytes.len() {
        let mut corrupted = bytes.clone();
        corrupted[i] ^= 0x01;
        assert_eq!(decode(&corrupted, &pseudo), Err(DecodeError::Checksum));
    }

    // The pseudo header is covered
    let other = PseudoHeader::new(pseudo.src, IpAddr::from([192, 168, 1, 3]));
    assert_eq!(decode(&bytes, &other), Err(DecodeError::Checksum));
}

#[test]
fn segment_malformed() {
    let pseudo = pseudo_v4();
    assert_eq!(decode(&[0u8; 19], &pseudo), Err(DecodeError::Truncated));

    let mut bytes = encode(&syn(), &pseudo).unwrap();
    // Data offset 15 words on a 40 Bytes buffer
    bytes[12] = 0xf0;
    assert_eq!(decode(&bytes[..40], &pseudo), Err(DecodeError::Truncated));

    bytes[12] = 0x40;
    assert_eq!(
        decode(&bytes, &pseudo),
        Err(DecodeError::BadHeaderLength(4))
    );
}

#[test]
fn segment_rst_for() {
    let segment = syn();
    let rst = Segment::new_rst_for(&segment).unwrap();
    assert_eq!(rst.flags, Flags::RST | Flags::ACK);
    assert_eq!(rst.acknowledgement, SeqNum::new(u32::MAX - 2));
    assert_eq!(rst.src, 80);
    assert_eq!(rst.dst, 40000);

    let ack = Segment::new(1, 2, SeqNum::new(5), SeqNum::new(100), Flags::ACK, 0);
    let rst = Segment::new_rst_for(&ack).unwrap();
    assert_eq!(rst.flags, Flags::RST);
    assert_eq!(rst.sequence, SeqNum::new(100));

    assert!(Segment::new_rst_for(&rst).is_none());
}

#[test]
fn segment_encode_address_family() {
    let pseudo = PseudoHeader::new(
        IpAddr::from([192, 168, 1, 1]),
        IpAddr::from([0xfe80, 0, 0, 0, 0, 0, 0, 1]),
    );
    assert_eq!(encode(&syn(), &pseudo), Err(EncodeError::AddressFamily));
    assert!(encode(&syn(), &pseudo_v4()).is_ok());
}

#[test]
fn flags_display() {
    assert_eq!((Flags::SYN | Flags::ACK).to_string(), "[S.]");
    assert_eq!(Flags::from_bits(0x1ff), Flags::from_bits(0x3f));
}
