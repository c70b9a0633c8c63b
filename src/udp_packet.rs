//! Classification of incoming UDP datagrams.
//!
//! UDP messages use the same `"<seq>|"` framing as TCP, but the receiver
//! accepts any datagram within [`UDP_SIZE_TOLERANCE`] bytes of the declared
//! message size. Everything outside that window, or without a usable sequence
//! number, is discarded without counting as received.
//!
//! # Examples
//!
//! ```
//! use msgperf::protocol::{encode_message, HandshakeHeader};
//! use msgperf::udp_packet::{classify, Datagram};
//!
//! let header = HandshakeHeader::new(100, 10);
//! let packet = encode_message(3, 100).unwrap();
//! assert_eq!(classify(&packet, &header), Datagram::Data { sequence: 3 });
//!
//! assert_eq!(classify(b"3|x", &header), Datagram::Undersized { len: 3 });
//! ```

use crate::protocol::{parse_sequence, HandshakeHeader};

/// Bytes a datagram may deviate from the declared message size.
pub const UDP_SIZE_TOLERANCE: usize = 10;

/// Receive buffer size; large enough for any IPv4 datagram.
pub const UDP_RECV_BUFFER: usize = 65_536;

/// What a received datagram turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram {
    /// A message within the size window carrying an in-range sequence
    Data { sequence: u64 },
    /// Shorter than `message_size - UDP_SIZE_TOLERANCE`
    Undersized { len: usize },
    /// Longer than `message_size + UDP_SIZE_TOLERANCE`
    Oversized { len: usize },
    /// Right size, but no parsable sequence prefix
    Malformed,
    /// Parsable sequence outside `1..=message_count`
    OutOfRange { sequence: u64 },
}

impl Datagram {
    pub fn is_data(&self) -> bool {
        matches!(self, Datagram::Data { .. })
    }
}

/// Classifies `packet` against the session described by `header`.
pub fn classify(packet: &[u8], header: &HandshakeHeader) -> Datagram {
    let len = packet.len();
    if len + UDP_SIZE_TOLERANCE < header.message_size {
        return Datagram::Undersized { len };
    }
    if len > header.message_size + UDP_SIZE_TOLERANCE {
        return Datagram::Oversized { len };
    }

    match parse_sequence(packet) {
        Some(sequence) if (1..=header.message_count).contains(&sequence) => {
            Datagram::Data { sequence }
        }
        Some(sequence) => Datagram::OutOfRange { sequence },
        None => Datagram::Malformed,
    }
}
