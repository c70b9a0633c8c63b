use crate::config::Protocol;
use crate::protocol::HandshakeHeader;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Which end of the session a snapshot describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// Every declared message was sent (and acknowledged) or received
    Completed,
    /// The TCP peer closed the connection before the declared count
    PeerClosed,
    /// The TCP server saw no data for the inactivity window
    Timeout,
    /// The TCP client gave up on one message
    RetriesExhausted { sequence: u64 },
    /// The UDP server reached its absolute deadline
    DeadlineExpired,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Completed => write!(f, "completed"),
            Termination::PeerClosed => write!(f, "peer closed the connection"),
            Termination::Timeout => write!(f, "inactivity timeout"),
            Termination::RetriesExhausted { sequence } => {
                write!(f, "retries exhausted at message {}", sequence)
            }
            Termination::DeadlineExpired => write!(f, "deadline expired"),
        }
    }
}

/// Sequence-gap loss detector for datagram sessions.
///
/// Keeps a cursor on the next sequence number it expects. A skip adds the
/// size of the gap to the loss counter and moves the cursor past the new
/// sequence. Anything below the cursor is a late or duplicate arrival. It is
/// tallied separately and never offsets earlier loss.
///
/// # Examples
///
/// ```
/// use msgperf::measurements::{GapTracker, Arrival};
///
/// let mut gaps = GapTracker::new();
/// assert_eq!(gaps.observe(1), Arrival::InOrder);
/// assert_eq!(gaps.observe(4), Arrival::AfterGap { missing: 2 });
/// assert_eq!(gaps.observe(3), Arrival::Late);
///
/// // Messages 5 and 6 never showed up either
/// assert_eq!(gaps.lost_at_end(6), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapTracker {
    expected_sequence: u64,
    lost: u64,
    late: u64,
}

/// How one sequence number relates to the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    InOrder,
    AfterGap { missing: u64 },
    Late,
}

impl GapTracker {
    pub fn new() -> Self {
        Self {
            expected_sequence: 1,
            lost: 0,
            late: 0,
        }
    }

    pub fn observe(&mut self, sequence: u64) -> Arrival {
        if sequence == self.expected_sequence {
            self.expected_sequence += 1;
            Arrival::InOrder
        } else if sequence > self.expected_sequence {
            let missing = sequence - self.expected_sequence;
            self.lost += missing;
            self.expected_sequence = sequence + 1;
            Arrival::AfterGap { missing }
        } else {
            self.late += 1;
            Arrival::Late
        }
    }

    /// Gaps seen between received sequence numbers so far.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn late(&self) -> u64 {
        self.late
    }

    /// Highest sequence number observed, 0 before the first one.
    pub fn highest(&self) -> u64 {
        self.expected_sequence - 1
    }

    /// Total loss once no more datagrams will arrive, counting the tail of
    /// messages after the highest sequence seen.
    pub fn lost_at_end(&self, declared: u64) -> u64 {
        self.lost + declared.saturating_sub(self.highest())
    }
}

impl Default for GapTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw per-session counters.
///
/// Owned by the single loop driving a session and turned into a [`Metrics`]
/// snapshot once that loop ends.
#[derive(Debug, Clone)]
pub struct SessionCounters {
    pub protocol: Protocol,
    pub role: Role,
    pub header: HandshakeHeader,
    /// Start of the measured interval
    pub first: Option<Instant>,
    /// End of the measured interval
    pub last: Option<Instant>,
    /// Messages sent (UDP), acknowledged (TCP client) or received (servers)
    pub messages: u64,
    pub total_bytes: u64,
    pub retries: u64,
    pub discarded: u64,
    pub out_of_order: u64,
    /// Present when loss comes from sequence gaps instead of a plain count
    pub gaps: Option<GapTracker>,
}

impl SessionCounters {
    pub fn new(protocol: Protocol, role: Role, header: HandshakeHeader) -> Self {
        Self {
            protocol,
            role,
            header,
            first: None,
            last: None,
            messages: 0,
            total_bytes: 0,
            retries: 0,
            discarded: 0,
            out_of_order: 0,
            gaps: None,
        }
    }

    pub fn with_gap_tracking(mut self) -> Self {
        self.gaps = Some(GapTracker::new());
        self
    }

    /// Marks `at` as part of the measured interval.
    pub fn touch(&mut self, at: Instant) {
        if self.first.is_none() {
            self.first = Some(at);
        }
        self.last = Some(at);
    }

    pub fn elapsed(&self) -> Duration {
        match (self.first, self.last) {
            (Some(first), Some(last)) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        }
    }

    pub fn lost(&self) -> u64 {
        match &self.gaps {
            Some(gaps) => gaps.lost_at_end(self.header.message_count),
            None => self.header.message_count.saturating_sub(self.messages),
        }
    }

    /// Derives the final snapshot. Depends only on the counters, so calling it
    /// twice yields identical metrics.
    pub fn snapshot(&self, termination: Termination) -> Metrics {
        Metrics {
            protocol: self.protocol,
            role: self.role,
            message_size: self.header.message_size,
            expected_messages: self.header.message_count,
            messages: self.messages,
            total_bytes: self.total_bytes,
            elapsed: self.elapsed(),
            lost_messages: self.lost(),
            retries: self.retries,
            discarded: self.discarded,
            out_of_order: self.out_of_order,
            termination,
        }
    }
}

/// Final, immutable result of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub protocol: Protocol,
    pub role: Role,
    pub message_size: usize,
    pub expected_messages: u64,
    pub messages: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub lost_messages: u64,
    pub retries: u64,
    pub discarded: u64,
    pub out_of_order: u64,
    pub termination: Termination,
}

impl Metrics {
    /// Throughput over `total_bytes`; 0 when the interval is empty.
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_bytes as f64 / secs
        } else {
            0.0
        }
    }

    pub fn bits_per_second(&self) -> f64 {
        self.bytes_per_second() * 8.0
    }

    pub fn loss_percent(&self) -> f64 {
        if self.expected_messages > 0 {
            (self.lost_messages as f64 / self.expected_messages as f64) * 100.0
        } else {
            0.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.termination == Termination::Completed
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        };
        writeln!(f, "--- {} {} ---", self.protocol, role)?;
        writeln!(f, "Elapsed: {:.4}s", self.elapsed.as_secs_f64())?;
        writeln!(f, "Throughput: {:.2} bytes/s", self.bytes_per_second())?;
        match self.role {
            Role::Sender => {
                writeln!(f, "Messages sent: {}/{}", self.messages, self.expected_messages)?;
                if self.protocol == Protocol::Tcp {
                    writeln!(f, "Retries: {}", self.retries)?;
                }
            }
            Role::Receiver => {
                writeln!(
                    f,
                    "Messages received: {}/{}",
                    self.messages, self.expected_messages
                )?;
                writeln!(f, "Loss: {} ({:.2}%)", self.lost_messages, self.loss_percent())?;
            }
        }
        if self.discarded > 0 {
            writeln!(f, "Discarded: {}", self.discarded)?;
        }
        if self.out_of_order > 0 {
            writeln!(f, "Out of order: {}", self.out_of_order)?;
        }
        write!(f, "Termination: {}", self.termination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(role: Role, size: usize, count: u64) -> SessionCounters {
        SessionCounters::new(Protocol::Tcp, role, HandshakeHeader::new(size, count))
    }

    #[test]
    fn test_gap_tracker_in_order() {
        let mut gaps = GapTracker::new();
        for seq in 1..=10 {
            assert_eq!(gaps.observe(seq), Arrival::InOrder);
        }
        assert_eq!(gaps.lost(), 0);
        assert_eq!(gaps.highest(), 10);
        assert_eq!(gaps.lost_at_end(10), 0);
    }

    #[test]
    fn test_gap_tracker_resyncs_after_gap() {
        let mut gaps = GapTracker::new();
        gaps.observe(1);
        assert_eq!(gaps.observe(5), Arrival::AfterGap { missing: 3 });
        assert_eq!(gaps.observe(6), Arrival::InOrder);
        assert_eq!(gaps.lost(), 3);
    }

    #[test]
    fn test_gap_tracker_leading_loss() {
        let mut gaps = GapTracker::new();
        assert_eq!(gaps.observe(3), Arrival::AfterGap { missing: 2 });
        assert_eq!(gaps.lost_at_end(3), 2);
    }

    #[test]
    fn test_gap_tracker_duplicates_are_late() {
        let mut gaps = GapTracker::new();
        gaps.observe(1);
        gaps.observe(2);
        assert_eq!(gaps.observe(2), Arrival::Late);
        assert_eq!(gaps.late(), 1);
        assert_eq!(gaps.lost(), 0);
    }

    #[test]
    fn test_gap_tracker_nothing_received() {
        let gaps = GapTracker::new();
        assert_eq!(gaps.lost_at_end(50), 50);
        assert_eq!(gaps.lost_at_end(0), 0);
    }

    #[test]
    fn test_counters_elapsed_spans_first_to_last() {
        let mut c = counters(Role::Receiver, 10, 3);
        let t0 = Instant::now();
        c.touch(t0);
        c.touch(t0 + Duration::from_millis(40));
        c.touch(t0 + Duration::from_millis(100));
        assert_eq!(c.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn test_snapshot_is_pure() {
        let mut c = counters(Role::Receiver, 100, 10);
        let t0 = Instant::now();
        c.touch(t0);
        c.touch(t0 + Duration::from_millis(250));
        c.messages = 8;
        c.total_bytes = 800;

        let a = c.snapshot(Termination::PeerClosed);
        let b = c.snapshot(Termination::PeerClosed);
        assert_eq!(a, b);
        assert_eq!(a.bytes_per_second(), b.bytes_per_second());
        assert_eq!(a.bytes_per_second(), 3200.0);
        assert_eq!(a.lost_messages, 2);
    }

    #[test]
    fn test_zero_messages_no_division_by_zero() {
        let c = counters(Role::Receiver, 100, 0);
        let m = c.snapshot(Termination::Completed);
        assert_eq!(m.messages, 0);
        assert_eq!(m.total_bytes, 0);
        assert_eq!(m.lost_messages, 0);
        assert_eq!(m.elapsed, Duration::ZERO);
        assert_eq!(m.bytes_per_second(), 0.0);
        assert_eq!(m.loss_percent(), 0.0);
    }

    #[test]
    fn test_single_instant_has_zero_throughput() {
        let mut c = counters(Role::Receiver, 100, 1);
        c.touch(Instant::now());
        c.messages = 1;
        c.total_bytes = 100;
        let m = c.snapshot(Termination::Completed);
        assert_eq!(m.bytes_per_second(), 0.0);
        assert_eq!(m.lost_messages, 0);
    }

    #[test]
    fn test_gap_based_loss_in_snapshot() {
        let mut c = SessionCounters::new(
            Protocol::Udp,
            Role::Receiver,
            HandshakeHeader::new(1000, 10),
        )
        .with_gap_tracking();
        for seq in [1, 2, 5, 6, 7] {
            c.gaps.as_mut().unwrap().observe(seq);
            c.messages += 1;
        }
        let m = c.snapshot(Termination::DeadlineExpired);
        // 3 and 4 skipped, 8..=10 never arrived
        assert_eq!(m.lost_messages, 5);
        assert_eq!(m.lost_messages, m.expected_messages - m.messages);
    }

    #[test]
    fn test_display_receiver() {
        let mut c = counters(Role::Receiver, 100, 100);
        c.messages = 100;
        c.total_bytes = 10_000;
        let text = c.snapshot(Termination::Completed).to_string();
        assert!(text.contains("--- TCP receiver ---"));
        assert!(text.contains("Messages received: 100/100"));
        assert!(text.contains("Loss: 0"));
        assert!(text.contains("Throughput: 0.00 bytes/s"));
        assert!(text.ends_with("Termination: completed"));
    }

    #[test]
    fn test_display_sender_shows_retries() {
        let mut c = counters(Role::Sender, 100, 5);
        c.messages = 2;
        c.retries = 6;
        let text = c
            .snapshot(Termination::RetriesExhausted { sequence: 3 })
            .to_string();
        assert!(text.contains("Messages sent: 2/5"));
        assert!(text.contains("Retries: 6"));
        assert!(text.contains("retries exhausted at message 3"));
    }

    #[test]
    fn test_metrics_json() {
        let c = counters(Role::Sender, 100, 1);
        let m = c.snapshot(Termination::RetriesExhausted { sequence: 1 });
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["role"], "Sender");
        assert_eq!(json["termination"]["reason"], "retries_exhausted");
        assert_eq!(json["termination"]["sequence"], 1);

        let back: Metrics = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            /// Property: dropping a known set of sequence numbers from an
            /// ordered stream makes the gap counter equal the set size
            #[test]
            fn prop_gap_loss_equals_dropped_set(
                count in 1u64..2000,
                dropped in proptest::collection::btree_set(1u64..2000, 0..200),
            ) {
                let dropped: BTreeSet<u64> = dropped.into_iter().filter(|s| *s <= count).collect();
                let mut gaps = GapTracker::new();
                let mut received = 0u64;
                for seq in (1..=count).filter(|s| !dropped.contains(s)) {
                    gaps.observe(seq);
                    received += 1;
                }
                prop_assert_eq!(gaps.lost_at_end(count), dropped.len() as u64);
                prop_assert_eq!(count - received, dropped.len() as u64);
            }
        }
    }
}
