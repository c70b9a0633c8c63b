use crate::config::{Config, Protocol};
use crate::measurements::{Metrics, Role, SessionCounters, Termination};
use crate::protocol::{fill_message, is_ack, HandshakeHeader, ACK_LEN};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time;

/// Progress event types reported while a session runs.
///
/// # Examples
///
/// ```no_run
/// use msgperf::{Client, Config, ProgressEvent};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5001)
///     .with_message_size(100)
///     .with_message_count(10);
///
/// let client = Client::new(config)?
///     .with_callback(|event: ProgressEvent| match event {
///         ProgressEvent::RetryScheduled { sequence, reason, .. } => {
///             eprintln!("resending {} ({:?})", sequence, reason);
///         }
///         ProgressEvent::SessionFinished { messages, .. } => {
///             println!("{} messages delivered", messages);
///         }
///         _ => {}
///     });
///
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// The handshake header has been sent.
    SessionStarted {
        protocol: Protocol,
        message_size: usize,
        message_count: u64,
    },
    /// A message was handed to the socket. `attempt` starts at 1 and grows
    /// with every TCP resend of the same sequence number.
    MessageSent { sequence: u64, attempt: u32 },
    /// The TCP server acknowledged `sequence`.
    AckReceived { sequence: u64 },
    /// `sequence` will be sent again.
    RetryScheduled {
        sequence: u64,
        attempt: u32,
        reason: RetryReason,
    },
    /// The session ended, successfully or not.
    SessionFinished {
        messages: u64,
        total_bytes: u64,
        termination: Termination,
    },
}

/// Why a TCP message is being resent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Nothing arrived within the acknowledgment timeout
    AckTimeout,
    /// Three bytes arrived but they were not the acknowledgment token
    InvalidAck,
}

/// Callback trait for receiving progress updates.
///
/// Closures taking a [`ProgressEvent`] implement it automatically.
///
/// # Examples
///
/// ```
/// use msgperf::{ProgressCallback, ProgressEvent};
///
/// struct Retries;
///
/// impl ProgressCallback for Retries {
///     fn on_progress(&self, event: ProgressEvent) {
///         if let ProgressEvent::RetryScheduled { sequence, .. } = event {
///             eprintln!("retry {}", sequence);
///         }
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

type CallbackRef = Arc<dyn ProgressCallback>;

/// Sending side of a transfer session.
///
/// Sends the handshake header and then `message_count` sequenced messages of
/// `message_size` bytes each. Over TCP every message waits for an
/// acknowledgment and is resent on timeout or on a reply that is not the
/// token, at most `max_retries` times. Over UDP datagrams go out back to back
/// with optional pacing.
///
/// # Examples
///
/// ```no_run
/// use msgperf::{Client, Config, Protocol};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5001)
///     .with_protocol(Protocol::Udp)
///     .with_message_size(1000)
///     .with_message_count(1000);
///
/// let metrics = Client::new(config)?.run().await?;
/// println!("{}", metrics);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
    callback: Option<CallbackRef>,
}

impl Client {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration has no server address or its
    /// message parameters cannot be framed (see [`Config::validate`]).
    ///
    /// # Examples
    ///
    /// ```
    /// use msgperf::{Client, Config};
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5001);
    /// let client = Client::new(config).expect("Failed to create client");
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        if config.server_addr.is_none() {
            return Err(Error::Config(
                "Server address is required for client mode".to_string(),
            ));
        }
        config.validate()?;

        Ok(Self {
            config,
            callback: None,
        })
    }

    /// Attaches a progress callback.
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn header(&self) -> HandshakeHeader {
        HandshakeHeader::new(self.config.message_size, self.config.message_count)
    }

    /// Runs one session against the configured server.
    ///
    /// Peer disconnects and exhausted retries still return `Ok` with partial
    /// metrics; check [`Metrics::termination`].
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached or a socket operation
    /// fails for a reason other than the peer going away.
    pub async fn run(&self) -> Result<Metrics> {
        let server_addr = self
            .config
            .server_addr
            .as_ref()
            .ok_or_else(|| Error::Config("Server address not set".to_string()))?;

        let full_addr = format!("{}:{}", server_addr, self.config.port);

        info!(
            "Sending {} {} messages of {} bytes to {}",
            self.config.message_count, self.config.protocol, self.config.message_size, full_addr
        );

        match self.config.protocol {
            Protocol::Tcp => self.run_tcp(&full_addr).await,
            Protocol::Udp => self.run_udp(&full_addr).await,
        }
    }

    async fn run_tcp(&self, server_addr: &str) -> Result<Metrics> {
        let stream = time::timeout(self.config.connect_timeout, TcpStream::connect(server_addr))
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "timed out connecting to {} after {:?}",
                    server_addr, self.config.connect_timeout
                ))
            })??;
        stream.set_nodelay(true)?;
        info!("Connected to {}", stream.peer_addr()?);

        self.send_over_stream(stream).await
    }

    /// Runs the acknowledged TCP session over an already established stream.
    ///
    /// Per message the client moves through `SEND → AWAIT_ACK` and then
    /// advances on [`ACK`](crate::protocol::ACK), resends on timeout or any
    /// other reply, and aborts when the peer closes or the message has been
    /// resent `max_retries` times. Bytes of every transmission count toward
    /// `total_bytes`; `messages` counts unique acknowledgments.
    pub async fn send_over_stream<S>(&self, mut stream: S) -> Result<Metrics>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let header = self.header();
        let mut counters = SessionCounters::new(Protocol::Tcp, Role::Sender, header);

        stream.write_all(&header.encode_tcp()).await?;
        stream.flush().await?;
        self.notify(ProgressEvent::SessionStarted {
            protocol: Protocol::Tcp,
            message_size: header.message_size,
            message_count: header.message_count,
        });

        let mut message = vec![0u8; header.message_size];
        let mut reply = [0u8; ACK_LEN];
        let mut termination = Termination::Completed;

        'messages: for sequence in 1..=header.message_count {
            fill_message(&mut message, sequence)?;
            let mut attempt = 0u32;

            loop {
                attempt += 1;
                if counters.first.is_none() {
                    counters.touch(Instant::now());
                }

                match stream.write_all(&message).await {
                    Ok(()) => {}
                    Err(e) if is_disconnect(&e) => {
                        warn!("Server went away while sending message {}: {}", sequence, e);
                        termination = Termination::PeerClosed;
                        break 'messages;
                    }
                    Err(e) => return Err(e.into()),
                }
                counters.total_bytes += message.len() as u64;
                self.notify(ProgressEvent::MessageSent { sequence, attempt });

                let reason =
                    match time::timeout(self.config.ack_timeout, stream.read_exact(&mut reply))
                        .await
                    {
                        Ok(Ok(_)) if is_ack(&reply) => {
                            counters.messages += 1;
                            counters.touch(Instant::now());
                            self.notify(ProgressEvent::AckReceived { sequence });
                            break;
                        }
                        Ok(Ok(_)) => {
                            counters.discarded += 1;
                            warn!(
                                "Unexpected reply {:?} to message {}",
                                String::from_utf8_lossy(&reply),
                                sequence
                            );
                            RetryReason::InvalidAck
                        }
                        Ok(Err(e)) if is_disconnect(&e) => {
                            warn!("Server closed the connection awaiting ack {}", sequence);
                            termination = Termination::PeerClosed;
                            break 'messages;
                        }
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_) => {
                            warn!(
                                "No acknowledgment for message {} within {:?}",
                                sequence, self.config.ack_timeout
                            );
                            RetryReason::AckTimeout
                        }
                    };

                if attempt > self.config.max_retries {
                    error!(
                        "Giving up on message {} after {} transmissions",
                        sequence, attempt
                    );
                    termination = Termination::RetriesExhausted { sequence };
                    break 'messages;
                }

                counters.retries += 1;
                debug!("Resending message {} (attempt {})", sequence, attempt + 1);
                self.notify(ProgressEvent::RetryScheduled {
                    sequence,
                    attempt,
                    reason,
                });
            }
        }

        if termination != Termination::Completed {
            counters.touch(Instant::now());
        }
        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown after session: {}", e);
        }

        Ok(self.finish(counters, termination))
    }

    async fn run_udp(&self, server_addr: &str) -> Result<Metrics> {
        let target = lookup_host(server_addr)
            .await?
            .next()
            .ok_or_else(|| Error::Connection(format!("could not resolve {}", server_addr)))?;

        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        debug!("UDP client bound to {}", socket.local_addr()?);

        self.send_datagrams(&socket, target).await
    }

    /// Sends the header datagram followed by every message, without waiting
    /// for anything from the server.
    async fn send_datagrams(&self, socket: &UdpSocket, target: SocketAddr) -> Result<Metrics> {
        let header = self.header();
        let mut counters = SessionCounters::new(Protocol::Udp, Role::Sender, header);

        socket.send_to(&header.encode_udp(), target).await?;
        self.notify(ProgressEvent::SessionStarted {
            protocol: Protocol::Udp,
            message_size: header.message_size,
            message_count: header.message_count,
        });

        let pacing = header.message_count > self.config.pacing_threshold
            && self.config.pacing_burst > 0
            && !self.config.pacing_delay.is_zero();
        if pacing {
            debug!(
                "Pacing: {:?} pause every {} datagrams",
                self.config.pacing_delay, self.config.pacing_burst
            );
        }

        let mut message = vec![0u8; header.message_size];
        counters.touch(Instant::now());

        for sequence in 1..=header.message_count {
            fill_message(&mut message, sequence)?;
            counters.total_bytes += message.len() as u64;
            socket.send_to(&message, target).await?;
            counters.messages += 1;
            self.notify(ProgressEvent::MessageSent {
                sequence,
                attempt: 1,
            });

            if pacing && sequence % self.config.pacing_burst == 0 {
                time::sleep(self.config.pacing_delay).await;
            }
        }

        counters.touch(Instant::now());
        Ok(self.finish(counters, Termination::Completed))
    }

    fn finish(&self, counters: SessionCounters, termination: Termination) -> Metrics {
        let metrics = counters.snapshot(termination);
        info!(
            "{} send finished: {}/{} messages, {} bytes in {:.4}s ({})",
            metrics.protocol,
            metrics.messages,
            metrics.expected_messages,
            metrics.total_bytes,
            metrics.elapsed.as_secs_f64(),
            metrics.termination
        );
        self.notify(ProgressEvent::SessionFinished {
            messages: metrics.messages,
            total_bytes: metrics.total_bytes,
            termination: metrics.termination,
        });
        metrics
    }
}

/// Errors that mean the other side is gone rather than a local failure.
pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
