//! msgperf - message throughput and loss measurement over TCP and UDP
//!
//! A sender declares a message size and count in a handshake header, then
//! transmits that many sequence-numbered messages. The receiver counts what
//! arrives and reports elapsed time, throughput and loss.
//!
//! # Features
//!
//! - Acknowledged TCP transfer with bounded per-message retries
//! - Best-effort UDP transfer with sequence-gap loss detection
//! - Deadline-bounded UDP sessions
//! - JSON output of session metrics
//! - In-process benchmark suite over loopback
//! - Asynchronous I/O using tokio

pub mod protocol;
pub mod server;
pub mod client;
pub mod config;
pub mod measurements;
pub mod error;
pub mod udp_packet;
pub mod scenario;

pub use error::{Error, Result};
pub use config::{Config, Mode, Protocol};
pub use measurements::{Metrics, Termination};
pub use client::{Client, ProgressCallback, ProgressEvent};
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
