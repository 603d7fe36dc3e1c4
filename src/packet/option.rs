//! Support for serializing and deserializing TCP options.

use super::{DecodeError, EncodeError};
use crate::tcp::SeqNum;
use std::fmt::{self, Display, Formatter};

const KIND_EOL: u8 = 0;
const KIND_NOP: u8 = 1;
const KIND_MSS: u8 = 2;
const KIND_WSCALE: u8 = 3;
const KIND_SACK_PERMITTED: u8 = 4;
const KIND_SACK: u8 = 5;
const KIND_TIMESTAMPS: u8 = 8;
const KIND_FAST_OPEN: u8 = 34;

/// Represents the maximum size of options in a TCP header.
pub const MAX_OPTIONS_LEN: usize = 40;
/// Represents the maximum count of SACK blocks in an option.
pub const MAX_SACK_BLOCKS: usize = 4;
/// Represents the maximum size of a fast open cookie.
pub const MAX_COOKIE_LEN: usize = 16;

/// Enumeration of TCP options.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum TcpOption {
    /// Represents the maximum segment size.
    MaxSegmentSize(u16),
    /// Represents the window scale.
    WindowScale(u8),
    /// Represents the timestamps, as value and echo reply.
    Timestamps(u32, u32),
    /// Represents selective acknowledgements are permitted.
    SackPermitted,
    /// Represents selective acknowledgement blocks as `[left, right)` edges.
    SackBlocks(Vec<(SeqNum, SeqNum)>),
    /// Represents a fast open cookie. An empty cookie requests a cookie.
    FastOpenCookie(Vec<u8>),
}

#[allow(clippy::len_without_is_empty)]
impl TcpOption {
    /// Returns the length of the option when converted into a byte-array.
    pub fn len(&self) -> usize {
        match self {
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::Timestamps(_, _) => 10,
            TcpOption::SackPermitted => 2,
            TcpOption::SackBlocks(blocks) => 2 + 8 * blocks.len(),
            TcpOption::FastOpenCookie(cookie) => 2 + cookie.len(),
        }
    }

    fn serialize(&self, buffer: &mut Vec<u8>) -> Result<(), EncodeError> {
        match self {
            TcpOption::MaxSegmentSize(mss) => {
                buffer.extend_from_slice(&[KIND_MSS, 4]);
                buffer.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(wscale) => {
                buffer.extend_from_slice(&[KIND_WSCALE, 3, *wscale]);
            }
            TcpOption::Timestamps(ts, ts_ecr) => {
                buffer.extend_from_slice(&[KIND_TIMESTAMPS, 10]);
                buffer.extend_from_slice(&ts.to_be_bytes());
                buffer.extend_from_slice(&ts_ecr.to_be_bytes());
            }
            TcpOption::SackPermitted => {
                buffer.extend_from_slice(&[KIND_SACK_PERMITTED, 2]);
            }
            TcpOption::SackBlocks(blocks) => {
                if blocks.is_empty() || blocks.len() > MAX_SACK_BLOCKS {
                    return Err(EncodeError::InvalidOption("SACK blocks"));
                }
                buffer.extend_from_slice(&[KIND_SACK, self.len() as u8]);
                for (left, right) in blocks {
                    buffer.extend_from_slice(&left.get().to_be_bytes());
                    buffer.extend_from_slice(&right.get().to_be_bytes());
                }
            }
            TcpOption::FastOpenCookie(cookie) => {
                if cookie.len() > MAX_COOKIE_LEN {
                    return Err(EncodeError::InvalidOption("fast open cookie"));
                }
                buffer.extend_from_slice(&[KIND_FAST_OPEN, self.len() as u8]);
                buffer.extend_from_slice(cookie);
            }
        }

        Ok(())
    }
}

impl Display for TcpOption {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            TcpOption::MaxSegmentSize(mss) => write!(f, "mss {}", mss),
            TcpOption::WindowScale(wscale) => write!(f, "wscale {}", wscale),
            TcpOption::Timestamps(ts, ts_ecr) => write!(f, "TS val {} ecr {}", ts, ts_ecr),
            TcpOption::SackPermitted => write!(f, "sackOK"),
            TcpOption::SackBlocks(blocks) => {
                write!(f, "sack {}", blocks.len())?;
                for (left, right) in blocks {
                    write!(f, " {{{}:{}}}", left, right)?;
                }
                Ok(())
            }
            TcpOption::FastOpenCookie(cookie) => match cookie.is_empty() {
                true => write!(f, "tfo cookiereq"),
                false => write!(f, "tfo cookie {} Bytes", cookie.len()),
            },
        }
    }
}

/// Serializes options into a byte-array padded to a multiple of 4 bytes.
pub fn serialize_options(options: &[TcpOption]) -> Result<Vec<u8>, EncodeError> {
    let mut buffer = Vec::with_capacity(MAX_OPTIONS_LEN);
    for option in options {
        option.serialize(&mut buffer)?;
    }
    while buffer.len() % 4 != 0 {
        buffer.push(KIND_EOL);
    }
    if buffer.len() > MAX_OPTIONS_LEN {
        return Err(EncodeError::OptionsTooLong(buffer.len()));
    }

    Ok(buffer)
}

/// Deserializes options from the option space of a TCP header. Unknown options are skipped by
/// their declared length.
pub fn parse_options(bytes: &[u8]) -> Result<Vec<TcpOption>, DecodeError> {
    let mut options = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let kind = bytes[i];
        match kind {
            KIND_EOL => break,
            KIND_NOP => {
                i += 1;
                continue;
            }
            _ => {}
        }

        let length = *bytes.get(i + 1).ok_or(DecodeError::BadOption(kind))? as usize;
        if length < 2 || i + length > bytes.len() {
            return Err(DecodeError::BadOption(kind));
        }
        let data = &bytes[i + 2..i + length];

        let option = match (kind, data.len()) {
            (KIND_MSS, 2) => Some(TcpOption::MaxSegmentSize(u16::from_be_bytes([
                data[0], data[1],
            ]))),
            (KIND_WSCALE, 1) => Some(TcpOption::WindowScale(data[0])),
            (KIND_SACK_PERMITTED, 0) => Some(TcpOption::SackPermitted),
            (KIND_TIMESTAMPS, 8) => Some(TcpOption::Timestamps(
                bytes_to_u32(&data[..4]),
                bytes_to_u32(&data[4..]),
            )),
            (KIND_SACK, n) if n > 0 && n % 8 == 0 && n / 8 <= MAX_SACK_BLOCKS => {
                let blocks = data
                    .chunks(8)
                    .map(|chunk| {
                        (
                            SeqNum::new(bytes_to_u32(&chunk[..4])),
                            SeqNum::new(bytes_to_u32(&chunk[4..])),
                        )
                    })
                    .collect();
                Some(TcpOption::SackBlocks(blocks))
            }
            (KIND_FAST_OPEN, n) if n <= MAX_COOKIE_LEN => {
                Some(TcpOption::FastOpenCookie(data.to_vec()))
            }
            (KIND_MSS, _)
            | (KIND_WSCALE, _)
            | (KIND_SACK_PERMITTED, _)
            | (KIND_TIMESTAMPS, _)
            | (KIND_SACK, _)
            | (KIND_FAST_OPEN, _) => return Err(DecodeError::BadOption(kind)),
            _ => None,
        };
        if let Some(option) = option {
            options.push(option);
        }

        i += length;
    }

    Ok(options)
}

fn bytes_to_u32(bytes: &[u8]) -> u32 {
    let mut result = 0;

    for byte in bytes.iter().take(4) {
        result = result * 256 + *byte as u32;
    }
    result
}

#[test]
fn options_serialize_padding() {
    let buffer = serialize_options(&[
        TcpOption::MaxSegmentSize(1460),
        TcpOption::WindowScale(7),
    ])
    .unwrap();
    assert_eq!(buffer, vec![2, 4, 5, 180, 3, 3, 7, 0]);
}

#[test]
fn options_parse_any_order_with_nops() {
    let bytes = [
        1, 1, 4, 2, 3, 3, 2, 1, 8, 10, 0, 0, 0, 1, 0, 0, 0, 2, 2, 4, 0x05, 0xb4,
    ];
    let options = parse_options(&bytes).unwrap();
    assert_eq!(
        options,
        vec![
            TcpOption::SackPermitted,
            TcpOption::WindowScale(2),
            TcpOption::Timestamps(1, 2),
            TcpOption::MaxSegmentSize(1460),
        ]
    );
}

#[test]
fn options_parse_skip_unknown() {
    // Kind 30 (MPTCP) with 4 bytes of data
    let bytes = [30, 6, 9, 9, 9, 9, 2, 4, 0x02, 0x18, 0, 0];
    let options = parse_options(&bytes).unwrap();
    assert_eq!(options, vec![TcpOption::MaxSegmentSize(536)]);
}

#[test]
fn options_parse_rejects_overflowing_length() {
    let bytes = [2, 4, 0x05, 0xb4, 30, 12, 0, 0];
    assert_eq!(parse_options(&bytes), Err(DecodeError::BadOption(30)));

    let bytes = [2, 3, 0x05, 0];
    assert_eq!(parse_options(&bytes), Err(DecodeError::BadOption(2)));

    let bytes = [8];
    assert_eq!(parse_options(&bytes), Err(DecodeError::BadOption(8)));
}

#[test]
fn options_sack_blocks() {
    let option = TcpOption::SackBlocks(vec![
        (SeqNum::new(100), SeqNum::new(200)),
        (SeqNum::new(u32::MAX - 1), SeqNum::new(10)),
    ]);
    let buffer = serialize_options(&[option.clone()]).unwrap();
    assert_eq!(buffer.len(), 20);
    assert_eq!(parse_options(&buffer).unwrap(), vec![option]);
}

#[test]
fn options_fast_open_cookie_request() {
    let buffer = serialize_options(&[TcpOption::FastOpenCookie(Vec::new())]).unwrap();
    assert_eq!(buffer, vec![34, 2, 0, 0]);
    assert_eq!(
        parse_options(&buffer).unwrap(),
        vec![TcpOption::FastOpenCookie(Vec::new())]
    );
}

#[test]
fn options_too_long() {
    let blocks = (0..4)
        .map(|i| (SeqNum::new(i), SeqNum::new(i + 1)))
        .collect::<Vec<_>>();
    let r = serialize_options(&[TcpOption::Timestamps(1, 2), TcpOption::SackBlocks(blocks)]);
    assert_eq!(r, Err(EncodeError::OptionsTooLong(44)));
}
