use crate::protocol::{prefix_len, MAX_MESSAGE_SIZE, MAX_UDP_MESSAGE_SIZE};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Well-known port shared by both roles.
pub const DEFAULT_PORT: u16 = 5001;

/// Destination used by the sending side when no host is given.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1";

/// Transport protocol type for a transfer session.
///
/// # Examples
///
/// ```
/// use msgperf::{Config, Protocol};
///
/// let tcp_config = Config::client("127.0.0.1".to_string(), 5001)
///     .with_protocol(Protocol::Tcp);
///
/// let udp_config = Config::client("127.0.0.1".to_string(), 5001)
///     .with_protocol(Protocol::Udp);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Acknowledged, stream-oriented transfer
    Tcp,
    /// Best-effort datagram transfer with loss accounting
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Role of this instance: the receiving server or the sending client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Receives messages and acknowledges them (TCP)
    Server,
    /// Sends the handshake header followed by the sequenced messages
    Client,
}

/// Configuration for both sides of a transfer session.
///
/// Use the builder methods to customize it. The server side only reads the
/// protocol, bind address, port and receive timeouts; message size and count
/// arrive with the handshake header.
///
/// # Examples
///
/// ## TCP client
///
/// ```
/// use msgperf::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5001)
///     .with_message_size(1000)
///     .with_message_count(1000)
///     .with_ack_timeout(Duration::from_millis(500))
///     .with_max_retries(3);
/// assert!(config.validate().is_ok());
/// ```
///
/// ## UDP server
///
/// ```
/// use msgperf::{Config, Protocol};
/// use std::time::Duration;
///
/// let config = Config::server(5001)
///     .with_protocol(Protocol::Udp)
///     .with_udp_deadline(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Protocol to use (TCP or UDP)
    pub protocol: Protocol,

    /// Port number to use
    pub port: u16,

    /// Server address (for client mode)
    pub server_addr: Option<String>,

    /// Bind address (for server mode)
    pub bind_addr: Option<IpAddr>,

    /// Bytes per message, sequence prefix included
    pub message_size: usize,

    /// Number of messages declared in the header
    pub message_count: u64,

    /// Bound on establishing the TCP connection
    pub connect_timeout: Duration,

    /// How long the TCP client waits for each acknowledgment
    pub ack_timeout: Duration,

    /// Resends allowed per message before the TCP client aborts
    pub max_retries: u32,

    /// TCP server inactivity bound while a message is expected
    pub read_timeout: Duration,

    /// How long the server waits for the handshake header
    pub header_timeout: Duration,

    /// Absolute UDP session deadline, measured from header receipt
    pub udp_deadline: Duration,

    /// UDP pacing only kicks in above this many messages
    pub pacing_threshold: u64,

    /// Datagrams sent back to back between pacing pauses
    pub pacing_burst: u64,

    /// Length of each pacing pause
    pub pacing_delay: Duration,

    /// Output in JSON format
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            protocol: Protocol::Tcp,
            port: DEFAULT_PORT,
            server_addr: None,
            bind_addr: None,
            message_size: 1000,
            message_count: 1000,
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(1),
            max_retries: 5,
            read_timeout: Duration::from_secs(5),
            header_timeout: Duration::from_secs(5),
            udp_deadline: Duration::from_secs(10),
            pacing_threshold: 500,
            pacing_burst: 32,
            pacing_delay: Duration::from_millis(1),
            json: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    ///
    /// # Examples
    ///
    /// ```
    /// use msgperf::Config;
    ///
    /// let config = Config::new();
    /// assert_eq!(config.port, 5001);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new server configuration listening on `port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use msgperf::{Config, Mode};
    ///
    /// let config = Config::server(5001);
    /// assert_eq!(config.mode, Mode::Server);
    /// ```
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a new client configuration sending to `server_addr:port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use msgperf::Config;
    ///
    /// let config = Config::client("192.168.1.100".to_string(), 5001);
    /// assert_eq!(config.server_addr.as_deref(), Some("192.168.1.100"));
    /// ```
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    /// Sets the protocol to use for the session.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the address the server binds to (default: all interfaces).
    ///
    /// # Examples
    ///
    /// ```
    /// use msgperf::Config;
    /// use std::net::{IpAddr, Ipv4Addr};
    ///
    /// let config = Config::server(0).with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST));
    /// assert_eq!(config.bind_addr, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    /// ```
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Sets the per-message size in bytes, sequence prefix included.
    pub fn with_message_size(mut self, size: usize) -> Self {
        self.message_size = size;
        self
    }

    /// Sets the number of messages to send.
    pub fn with_message_count(mut self, count: u64) -> Self {
        self.message_count = count;
        self
    }

    /// Sets the bound on establishing a TCP connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets how long the TCP client waits for each acknowledgment.
    ///
    /// # Examples
    ///
    /// ```
    /// use msgperf::Config;
    /// use std::time::Duration;
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5001)
    ///     .with_ack_timeout(Duration::from_millis(250));
    /// assert_eq!(config.ack_timeout, Duration::from_millis(250));
    /// ```
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets how many times a single message may be resent.
    ///
    /// A message is transmitted at most `1 + max_retries` times before the
    /// session is aborted.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the TCP server inactivity timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets how long the server waits for the handshake header.
    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    /// Sets the absolute UDP session deadline.
    ///
    /// The UDP server stops when every declared message has arrived or when
    /// this much time has passed since the header, whichever is first.
    pub fn with_udp_deadline(mut self, deadline: Duration) -> Self {
        self.udp_deadline = deadline;
        self
    }

    /// Configures UDP pacing.
    ///
    /// When more than `threshold` messages are sent, the client sleeps for
    /// `delay` after every `burst` datagrams. A zero `delay` disables pacing.
    ///
    /// # Examples
    ///
    /// ```
    /// use msgperf::{Config, Protocol};
    /// use std::time::Duration;
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5001)
    ///     .with_protocol(Protocol::Udp)
    ///     .with_pacing(100, 16, Duration::from_millis(1));
    /// assert_eq!(config.pacing_burst, 16);
    /// ```
    pub fn with_pacing(mut self, threshold: u64, burst: u64, delay: Duration) -> Self {
        self.pacing_threshold = threshold;
        self.pacing_burst = burst;
        self.pacing_delay = delay;
        self
    }

    /// Enables or disables JSON output format.
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Checks that the message parameters can be framed.
    ///
    /// Every message must hold the longest sequence prefix it will carry
    /// (`digits(message_count)` plus the delimiter), and must fit the
    /// transport's size limit.
    ///
    /// # Examples
    ///
    /// ```
    /// use msgperf::Config;
    ///
    /// let too_small = Config::client("127.0.0.1".to_string(), 5001)
    ///     .with_message_size(3)
    ///     .with_message_count(1000);
    /// assert!(too_small.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        if self.message_size == 0 {
            return Err(Error::Config("message size must be at least 1 byte".to_string()));
        }

        let limit = match self.protocol {
            Protocol::Tcp => MAX_MESSAGE_SIZE,
            Protocol::Udp => MAX_UDP_MESSAGE_SIZE,
        };
        if self.message_size > limit {
            return Err(Error::Config(format!(
                "message size {} exceeds the {} limit of {} bytes",
                self.message_size, self.protocol, limit
            )));
        }

        let needed = prefix_len(self.message_count.max(1));
        if self.message_size < needed {
            return Err(Error::Config(format!(
                "message size {} cannot hold a {}-byte sequence prefix",
                self.message_size, needed
            )));
        }

        if self.protocol == Protocol::Tcp && self.ack_timeout.is_zero() {
            return Err(Error::Config("ack timeout must be non-zero".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.protocol, Protocol::Tcp);
        assert_eq!(config.max_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = Config::client("10.0.0.1".to_string(), 6000)
            .with_protocol(Protocol::Udp)
            .with_message_size(200)
            .with_message_count(50)
            .with_udp_deadline(Duration::from_secs(2))
            .with_json(true);

        assert_eq!(config.port, 6000);
        assert_eq!(config.protocol, Protocol::Udp);
        assert_eq!(config.message_size, 200);
        assert_eq!(config.message_count, 50);
        assert_eq!(config.udp_deadline, Duration::from_secs(2));
        assert!(config.json);
    }

    #[test]
    fn test_validate_prefix_fits() {
        // "100|" needs four bytes
        let exact = Config::new().with_message_size(4).with_message_count(100);
        assert!(exact.validate().is_ok());

        let short = Config::new().with_message_size(3).with_message_count(100);
        assert!(matches!(short.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_zero_count_needs_room_for_one_prefix() {
        let config = Config::new().with_message_size(2).with_message_count(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_udp_limit() {
        let config = Config::new()
            .with_protocol(Protocol::Udp)
            .with_message_size(MAX_UDP_MESSAGE_SIZE + 1);
        assert!(config.validate().is_err());

        let tcp = config.with_protocol(Protocol::Tcp);
        assert!(tcp.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_size() {
        let config = Config::new().with_message_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
        assert_eq!(Protocol::Udp.to_string(), "UDP");
    }
}
