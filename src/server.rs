use crate::client::is_disconnect;
use crate::config::{Config, Protocol};
use crate::measurements::{Arrival, GapTracker, Metrics, Role, SessionCounters, Termination};
use crate::protocol::{parse_sequence, read_tcp_header, HandshakeHeader, ACK, MAX_UDP_MESSAGE_SIZE};
use crate::udp_packet::{classify, Datagram, UDP_RECV_BUFFER};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time;

/// Receiving side of a transfer session.
///
/// A server handles exactly one session: it binds, waits for one client,
/// reads the handshake header and then receives until the declared count is
/// reached or the session is cut short. Over TCP every complete message is
/// acknowledged. Over UDP loss is derived from gaps in the sequence numbers.
///
/// # Examples
///
/// ## TCP server
///
/// ```no_run
/// use msgperf::{Server, Config};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::new(Config::server(5001));
/// let metrics = server.run().await?;
/// println!("{}", metrics);
/// # Ok(())
/// # }
/// ```
///
/// ## UDP server on an OS-assigned port
///
/// ```no_run
/// use msgperf::{Server, Config, Protocol};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::server(0).with_protocol(Protocol::Udp);
/// let bound = Server::new(config).bind().await?;
/// println!("listening on {}", bound.local_addr()?);
/// let metrics = bound.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
}

impl Server {
    /// Creates a new server with the given configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Binds and runs a single session.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails, the handshake fails or times out,
    /// or a socket error occurs. A client disconnecting mid-transfer is not an
    /// error; the partial metrics are returned.
    pub async fn run(&self) -> Result<Metrics> {
        self.bind().await?.run().await
    }

    /// Binds the listening socket without waiting for a client yet.
    pub async fn bind(&self) -> Result<BoundServer> {
        let ip = self
            .config
            .bind_addr
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let bind_addr = SocketAddr::new(ip, self.config.port);

        let socket = match self.config.protocol {
            Protocol::Tcp => Listening::Tcp(TcpListener::bind(bind_addr).await?),
            Protocol::Udp => Listening::Udp(UdpSocket::bind(bind_addr).await?),
        };
        let bound = BoundServer {
            config: self.config.clone(),
            socket,
        };
        info!(
            "{} server listening on {}",
            self.config.protocol,
            bound.local_addr()?
        );
        Ok(bound)
    }
}

enum Listening {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// A server whose socket is bound and ready for its one session.
pub struct BoundServer {
    config: Config,
    socket: Listening,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match &self.socket {
            Listening::Tcp(listener) => listener.local_addr()?,
            Listening::Udp(socket) => socket.local_addr()?,
        };
        Ok(addr)
    }

    /// Serves one session; the socket is closed when this returns.
    pub async fn run(self) -> Result<Metrics> {
        let metrics = match self.socket {
            Listening::Tcp(listener) => serve_tcp(listener, &self.config).await?,
            Listening::Udp(socket) => serve_udp(socket, &self.config).await?,
        };
        info!(
            "{} receive finished: {}/{} messages, {} bytes in {:.4}s, {} lost ({})",
            metrics.protocol,
            metrics.messages,
            metrics.expected_messages,
            metrics.total_bytes,
            metrics.elapsed.as_secs_f64(),
            metrics.lost_messages,
            metrics.termination
        );
        Ok(metrics)
    }
}

async fn serve_tcp(listener: TcpListener, config: &Config) -> Result<Metrics> {
    // Blocks until a client shows up
    let (stream, addr) = listener.accept().await?;
    drop(listener);
    info!("Connection from {}", addr);
    stream.set_nodelay(true)?;

    receive_over_stream(stream, config).await
}

/// Receives one acknowledged TCP session over an already accepted stream.
///
/// Messages are reassembled from as many reads as it takes. A message that
/// is cut off by the peer closing ends the session; so does a read that
/// stays idle for `read_timeout`. A resent copy of an already counted message
/// is acknowledged again but not counted twice.
///
/// # Errors
///
/// Handshake failures return an error and no metrics.
pub async fn receive_over_stream<S>(stream: S, config: &Config) -> Result<Metrics>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let header = time::timeout(config.header_timeout, read_tcp_header(&mut reader))
        .await
        .map_err(|_| Error::HeaderTimeout)??;

    info!(
        "[TCP] Receiving {} messages of {} bytes",
        header.message_count, header.message_size
    );

    let mut counters = SessionCounters::new(Protocol::Tcp, Role::Receiver, header);
    let mut message = vec![0u8; header.message_size];
    let mut next_sequence = 1u64;

    let termination = loop {
        if counters.messages >= header.message_count {
            break Termination::Completed;
        }

        match read_frame(&mut reader, &mut message, config.read_timeout).await? {
            Frame::Complete => {}
            Frame::Closed { partial } => {
                if partial > 0 {
                    warn!(
                        "Incomplete message: {} of {} bytes before the client closed",
                        partial, header.message_size
                    );
                } else {
                    warn!("Client closed the connection early");
                }
                break Termination::PeerClosed;
            }
            Frame::Idle { partial } => {
                warn!(
                    "No data for {:?} ({} bytes of the pending message)",
                    config.read_timeout, partial
                );
                break Termination::Timeout;
            }
        }

        match parse_sequence(&message) {
            Some(sequence) if sequence < next_sequence => {
                counters.out_of_order += 1;
                debug!("Duplicate of message {} acknowledged again", sequence);
            }
            sequence => {
                next_sequence = match sequence {
                    Some(sequence) => sequence + 1,
                    None => {
                        warn!("Message without a sequence prefix");
                        next_sequence + 1
                    }
                };
                counters.messages += 1;
                counters.total_bytes += message.len() as u64;
                counters.touch(Instant::now());
            }
        }

        let ack = async {
            let stream = reader.get_mut();
            stream.write_all(ACK).await?;
            stream.flush().await
        };
        match ack.await {
            Ok(()) => {}
            Err(e) if is_disconnect(&e) => {
                warn!("Client went away before acknowledgment: {}", e);
                break if counters.messages >= header.message_count {
                    Termination::Completed
                } else {
                    Termination::PeerClosed
                };
            }
            Err(e) => return Err(e.into()),
        }
    };

    Ok(counters.snapshot(termination))
}

/// Outcome of reassembling one fixed-size message.
enum Frame {
    Complete,
    Closed { partial: usize },
    Idle { partial: usize },
}

async fn read_frame<R>(reader: &mut R, buf: &mut [u8], idle: Duration) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match time::timeout(idle, reader.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => return Ok(Frame::Closed { partial: filled }),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) if is_disconnect(&e) => return Ok(Frame::Closed { partial: filled }),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(Frame::Idle { partial: filled }),
        }
    }
    Ok(Frame::Complete)
}

async fn serve_udp(socket: UdpSocket, config: &Config) -> Result<Metrics> {
    let mut buf = vec![0u8; UDP_RECV_BUFFER];

    let (n, peer) = time::timeout(config.header_timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| {
            warn!(
                "[UDP] No header within {:?}, shutting down",
                config.header_timeout
            );
            Error::HeaderTimeout
        })??;
    let header = HandshakeHeader::parse(&buf[..n])?;
    if header.message_size > MAX_UDP_MESSAGE_SIZE {
        return Err(Error::Handshake(format!(
            "message size {} does not fit a UDP datagram",
            header.message_size
        )));
    }

    info!(
        "[UDP] Receiving {} messages of {} bytes from {}",
        header.message_count, header.message_size, peer
    );

    let deadline = Instant::now() + config.udp_deadline;
    let mut session = UdpSession::new(header);

    while !session.is_complete() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) if from == peer => {
                session.on_datagram(&buf[..n], Instant::now());
            }
            Ok(Ok((_, from))) => debug!("Ignoring datagram from {}", from),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }

    let termination = if session.is_complete() {
        Termination::Completed
    } else {
        warn!(
            "[UDP] Deadline reached with {}/{} messages",
            session.received(),
            header.message_count
        );
        Termination::DeadlineExpired
    };
    Ok(session.finish(termination))
}

/// Receive-side state of one UDP session, after the header.
///
/// Fed one datagram at a time, independent of any socket.
///
/// # Examples
///
/// ```
/// use msgperf::measurements::Termination;
/// use msgperf::protocol::{encode_message, HandshakeHeader};
/// use msgperf::server::UdpSession;
/// use std::time::Instant;
///
/// let mut session = UdpSession::new(HandshakeHeader::new(100, 5));
/// for seq in [1, 2, 4, 5] {
///     session.on_datagram(&encode_message(seq, 100).unwrap(), Instant::now());
/// }
/// let metrics = session.finish(Termination::DeadlineExpired);
/// assert_eq!(metrics.messages, 4);
/// assert_eq!(metrics.lost_messages, 1);
/// ```
#[derive(Debug, Clone)]
pub struct UdpSession {
    counters: SessionCounters,
}

impl UdpSession {
    pub fn new(header: HandshakeHeader) -> Self {
        Self {
            counters: SessionCounters::new(Protocol::Udp, Role::Receiver, header)
                .with_gap_tracking(),
        }
    }

    /// Accounts for one datagram that arrived at `at`.
    pub fn on_datagram(&mut self, packet: &[u8], at: Instant) -> Datagram {
        let kind = classify(packet, &self.counters.header);
        match kind {
            Datagram::Data { sequence } => {
                let gaps = self.counters.gaps.get_or_insert_with(GapTracker::new);
                match gaps.observe(sequence) {
                    Arrival::Late => {
                        self.counters.out_of_order += 1;
                        debug!("[UDP] Late or duplicate message {}", sequence);
                    }
                    arrival => {
                        if let Arrival::AfterGap { missing } = arrival {
                            debug!("[UDP] {} messages missing before {}", missing, sequence);
                        }
                        self.counters.messages += 1;
                        self.counters.total_bytes += packet.len() as u64;
                        self.counters.touch(at);
                    }
                }
            }
            Datagram::Undersized { len } => {
                self.counters.discarded += 1;
                warn!("[UDP] Datagram too small: {} bytes", len);
            }
            Datagram::Oversized { len } => {
                self.counters.discarded += 1;
                warn!("[UDP] Datagram too large: {} bytes", len);
            }
            Datagram::Malformed => {
                self.counters.discarded += 1;
                warn!("[UDP] Datagram without a sequence prefix");
            }
            Datagram::OutOfRange { sequence } => {
                self.counters.discarded += 1;
                warn!("[UDP] Sequence {} outside the session", sequence);
            }
        }
        kind
    }

    pub fn received(&self) -> u64 {
        self.counters.messages
    }

    pub fn is_complete(&self) -> bool {
        self.counters.messages >= self.counters.header.message_count
    }

    pub fn finish(self, termination: Termination) -> Metrics {
        self.counters.snapshot(termination)
    }
}
