//! Wire format shared by both roles.
//!
//! # Handshake header
//!
//! ```text
//! <message_size>,<message_count>      (UDP: one datagram)
//! <message_size>,<message_count>\n    (TCP)
//! ```
//!
//! # Message
//!
//! ```text
//! ┌──────────────────┬─────┬──────────────────────────────┐
//! │ sequence (ASCII) │ '|' │ filler 'x' up to message_size │
//! └──────────────────┴─────┴──────────────────────────────┘
//! ```
//!
//! Sequence numbers start at 1. Over TCP every message is followed by a
//! 3-byte [`ACK`] from the receiver before the next one is sent.

use crate::{Error, Result};
use log::debug;
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Acknowledgment token written by the TCP server after each message.
pub const ACK: &[u8; 3] = b"ACK";

/// Length of [`ACK`].
pub const ACK_LEN: usize = ACK.len();

/// Separates the sequence number from the filler.
pub const SEQUENCE_DELIMITER: u8 = b'|';

/// Byte used to pad every message up to its declared size.
pub const FILLER: u8 = b'x';

/// Upper bound on a TCP handshake line, terminator included.
pub const MAX_HEADER_LEN: usize = 64;

/// Largest message size a TCP peer may declare.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload that fits in a single IPv4 UDP datagram.
pub const MAX_UDP_MESSAGE_SIZE: usize = 65_507;

/// Handshake header announcing the shape of a transfer session.
///
/// # Examples
///
/// ```
/// use msgperf::protocol::HandshakeHeader;
///
/// let header = HandshakeHeader::new(100, 10);
/// assert_eq!(header.encode_tcp(), b"100,10\n");
/// assert_eq!(header.encode_udp(), b"100,10");
///
/// let parsed = HandshakeHeader::parse(b"100,10\n").unwrap();
/// assert_eq!(parsed, header);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    /// Bytes per message, sequence prefix included
    pub message_size: usize,
    /// Number of messages the sender will transmit
    pub message_count: u64,
}

impl HandshakeHeader {
    pub fn new(message_size: usize, message_count: u64) -> Self {
        Self {
            message_size,
            message_count,
        }
    }

    /// Newline-terminated form written to a TCP stream.
    pub fn encode_tcp(&self) -> Vec<u8> {
        format!("{},{}\n", self.message_size, self.message_count).into_bytes()
    }

    /// Unterminated form sent as a standalone UDP datagram.
    pub fn encode_udp(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parses a header from its textual form.
    ///
    /// Surrounding whitespace (including the TCP newline) is ignored. Exactly
    /// two comma-separated decimal fields are required, and the declared size
    /// must be between 1 and [`MAX_MESSAGE_SIZE`].
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::Handshake("header is not valid UTF-8".to_string()))?
            .trim();

        let mut fields = text.split(',');
        let (size, count) = match (fields.next(), fields.next(), fields.next()) {
            (Some(size), Some(count), None) => (size.trim(), count.trim()),
            _ => {
                return Err(Error::Handshake(format!(
                    "expected \"<size>,<count>\", got {:?}",
                    text
                )))
            }
        };

        let message_size: usize = size
            .parse()
            .map_err(|_| Error::Handshake(format!("invalid message size {:?}", size)))?;
        let message_count: u64 = count
            .parse()
            .map_err(|_| Error::Handshake(format!("invalid message count {:?}", count)))?;

        if message_size == 0 || message_size > MAX_MESSAGE_SIZE {
            return Err(Error::Handshake(format!(
                "message size {} outside 1..={}",
                message_size, MAX_MESSAGE_SIZE
            )));
        }

        Ok(Self::new(message_size, message_count))
    }
}

impl fmt::Display for HandshakeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.message_size, self.message_count)
    }
}

/// Reads the newline-terminated TCP header from a buffered stream.
///
/// At most [`MAX_HEADER_LEN`] bytes are consumed. Bytes buffered past the
/// newline stay in `reader` and belong to the first message.
///
/// # Errors
///
/// - [`Error::Handshake`] if the peer closes before the newline or the line
///   does not parse
/// - [`Error::HeaderTooLong`] if no newline appears within the cap
///
/// # Examples
///
/// ```
/// use msgperf::protocol::read_tcp_header;
/// use tokio::io::BufReader;
///
/// # #[tokio::main]
/// # async fn main() -> msgperf::Result<()> {
/// let mut reader = BufReader::new(&b"1000,5\n1|xxx"[..]);
/// let header = read_tcp_header(&mut reader).await?;
/// assert_eq!(header.message_size, 1000);
/// assert_eq!(header.message_count, 5);
/// # Ok(())
/// # }
/// ```
pub async fn read_tcp_header<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HandshakeHeader> {
    let mut line = Vec::with_capacity(MAX_HEADER_LEN);
    let n = reader
        .take(MAX_HEADER_LEN as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if line.last() != Some(&b'\n') {
        if n >= MAX_HEADER_LEN {
            return Err(Error::HeaderTooLong {
                max: MAX_HEADER_LEN,
            });
        }
        return Err(Error::Handshake(
            "connection closed before header was complete".to_string(),
        ));
    }

    debug!("Header line: {:?}", String::from_utf8_lossy(&line));
    HandshakeHeader::parse(&line)
}

/// Number of bytes the `"<seq>|"` prefix occupies.
///
/// # Examples
///
/// ```
/// use msgperf::protocol::prefix_len;
///
/// assert_eq!(prefix_len(1), 2);
/// assert_eq!(prefix_len(1000), 5);
/// ```
pub fn prefix_len(sequence: u64) -> usize {
    let mut digits = 1;
    let mut rest = sequence / 10;
    while rest > 0 {
        digits += 1;
        rest /= 10;
    }
    digits + 1
}

/// Writes message `sequence` into `buf`, which must already have the
/// declared message size. The prefix goes first, the rest is filler.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the prefix does not fit.
pub fn fill_message(buf: &mut [u8], sequence: u64) -> Result<()> {
    let prefix = format!("{}{}", sequence, SEQUENCE_DELIMITER as char);
    if prefix.len() > buf.len() {
        return Err(Error::Protocol(format!(
            "sequence {} needs {} bytes, message is {}",
            sequence,
            prefix.len(),
            buf.len()
        )));
    }

    buf[..prefix.len()].copy_from_slice(prefix.as_bytes());
    buf[prefix.len()..].fill(FILLER);
    Ok(())
}

/// Builds a fresh message of exactly `message_size` bytes.
///
/// # Examples
///
/// ```
/// use msgperf::protocol::encode_message;
///
/// let msg = encode_message(7, 8).unwrap();
/// assert_eq!(msg, b"7|xxxxxx");
/// ```
pub fn encode_message(sequence: u64, message_size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; message_size];
    fill_message(&mut buf, sequence)?;
    Ok(buf)
}

/// Extracts the sequence number from a message prefix.
///
/// Returns `None` when no delimiter is present or the digits before it do not
/// form a decimal number.
///
/// # Examples
///
/// ```
/// use msgperf::protocol::parse_sequence;
///
/// assert_eq!(parse_sequence(b"42|xxxx"), Some(42));
/// assert_eq!(parse_sequence(b"xxxx"), None);
/// ```
pub fn parse_sequence(message: &[u8]) -> Option<u64> {
    // u64::MAX has 20 digits
    let window = &message[..message.len().min(21)];
    let end = window.iter().position(|&b| b == SEQUENCE_DELIMITER)?;
    let digits = &window[..end];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Whether `reply` is exactly the acknowledgment token.
pub fn is_ack(reply: &[u8]) -> bool {
    reply == ACK
}
