use msgperf::client::RetryReason;
use msgperf::{Client, Config, ProgressCallback, ProgressEvent, Protocol, Server, Termination};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

/// Custom callback implementation using a struct
struct TestCallback {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl TestCallback {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ProgressCallback for TestCallback {
    fn on_progress(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

async fn spawn_server(protocol: Protocol) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let config = Config::server(0)
        .with_protocol(protocol)
        .with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_udp_deadline(Duration::from_secs(2));
    let bound = Server::new(config).bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = bound.run().await;
    });
    (addr, handle)
}

fn client_config(addr: SocketAddr, protocol: Protocol, count: u64) -> Config {
    Config::client(addr.ip().to_string(), addr.port())
        .with_protocol(protocol)
        .with_message_size(100)
        .with_message_count(count)
}

#[tokio::test]
async fn test_custom_callback_struct() {
    let (addr, server) = spawn_server(Protocol::Tcp).await;

    let callback = TestCallback::new();
    let events_ref = callback.events.clone();

    let client = Client::new(client_config(addr, Protocol::Tcp, 20))
        .unwrap()
        .with_callback(callback);
    let metrics = client.run().await.unwrap();
    server.await.unwrap();

    let events = events_ref.lock().unwrap();
    assert_eq!(
        events.first(),
        Some(&ProgressEvent::SessionStarted {
            protocol: Protocol::Tcp,
            message_size: 100,
            message_count: 20,
        })
    );
    assert_eq!(
        events.last(),
        Some(&ProgressEvent::SessionFinished {
            messages: 20,
            total_bytes: metrics.total_bytes,
            termination: Termination::Completed,
        })
    );

    let sent = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::MessageSent { .. }))
        .count();
    let acked = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::AckReceived { .. }))
        .count();
    assert_eq!(sent, 20);
    assert_eq!(acked, 20);
}

#[tokio::test]
async fn test_closure_callback_sees_sequences_in_order() {
    let (addr, server) = spawn_server(Protocol::Udp).await;

    let sequences = Arc::new(Mutex::new(Vec::new()));
    let seen = sequences.clone();

    let client = Client::new(client_config(addr, Protocol::Udp, 50))
        .unwrap()
        .with_callback(move |event: ProgressEvent| {
            if let ProgressEvent::MessageSent { sequence, attempt } = event {
                assert_eq!(attempt, 1);
                seen.lock().unwrap().push(sequence);
            }
        });
    client.run().await.unwrap();
    server.await.unwrap();

    let sequences = sequences.lock().unwrap();
    assert_eq!(*sequences, (1..=50).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_retry_events_name_the_reason() {
    let (stream, mut peer) = duplex(4096);
    let callback = TestCallback::new();
    let events_ref = callback.events.clone();

    let config = Config::client("127.0.0.1".to_string(), 5001)
        .with_message_size(10)
        .with_message_count(1)
        .with_ack_timeout(Duration::from_millis(50));
    let client = Client::new(config).unwrap().with_callback(callback);
    let sender = tokio::spawn(async move { client.send_over_stream(stream).await });

    let mut header = [0u8; 5];
    peer.read_exact(&mut header).await.unwrap();
    assert_eq!(&header, b"10,1\n");

    let mut message = [0u8; 10];
    peer.read_exact(&mut message).await.unwrap();
    peer.write_all(b"ACX").await.unwrap();
    peer.read_exact(&mut message).await.unwrap();
    // Let the second attempt time out
    peer.read_exact(&mut message).await.unwrap();
    peer.write_all(b"ACK").await.unwrap();

    let metrics = sender.await.unwrap().unwrap();
    assert!(metrics.is_complete());

    let retries: Vec<_> = events_ref
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::RetryScheduled {
                sequence,
                attempt,
                reason,
            } => Some((*sequence, *attempt, *reason)),
            _ => None,
        })
        .collect();
    assert_eq!(
        retries,
        vec![
            (1, 1, RetryReason::InvalidAck),
            (1, 2, RetryReason::AckTimeout)
        ]
    );
}
