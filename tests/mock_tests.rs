//! Sender and receiver run against scripted peers over in-memory streams.

use msgperf::protocol::{encode_message, parse_sequence, ACK};
use msgperf::server::receive_over_stream;
use msgperf::{Client, Config, Termination};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

fn client(size: usize, count: u64) -> Client {
    let config = Config::client("127.0.0.1".to_string(), 5001)
        .with_message_size(size)
        .with_message_count(count)
        .with_ack_timeout(Duration::from_millis(500));
    Client::new(config).unwrap()
}

async fn read_header(peer: &mut DuplexStream) -> Vec<u8> {
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        peer.read_exact(&mut byte).await.unwrap();
        header.push(byte[0]);
        if byte[0] == b'\n' {
            return header;
        }
    }
}

async fn read_message(peer: &mut DuplexStream, size: usize) -> Vec<u8> {
    let mut message = vec![0u8; size];
    peer.read_exact(&mut message).await.unwrap();
    message
}

#[tokio::test]
async fn test_next_message_waits_for_ack() {
    let (stream, mut peer) = duplex(4096);
    let client = client(20, 3);
    let sender = tokio::spawn(async move { client.send_over_stream(stream).await });

    assert_eq!(read_header(&mut peer).await, b"20,3\n");
    for seq in 1..=3u64 {
        let message = read_message(&mut peer, 20).await;
        assert_eq!(parse_sequence(&message), Some(seq));

        // Nothing more may be written until this message is acknowledged
        let mut probe = [0u8; 1];
        let early = timeout(Duration::from_millis(50), peer.read(&mut probe)).await;
        assert!(early.is_err(), "message {} was followed before its ack", seq);

        peer.write_all(ACK).await.unwrap();
    }

    let metrics = sender.await.unwrap().unwrap();
    assert_eq!(metrics.messages, 3);
    assert_eq!(metrics.retries, 0);
    assert!(metrics.is_complete());
}

#[tokio::test]
async fn test_garbage_ack_resends_same_sequence() {
    let (stream, mut peer) = duplex(4096);
    let client = client(10, 2);
    let sender = tokio::spawn(async move { client.send_over_stream(stream).await });

    read_header(&mut peer).await;
    let first = read_message(&mut peer, 10).await;
    peer.write_all(b"NAK").await.unwrap();

    let resent = read_message(&mut peer, 10).await;
    assert_eq!(resent, first);
    peer.write_all(ACK).await.unwrap();

    let second = read_message(&mut peer, 10).await;
    assert_eq!(parse_sequence(&second), Some(2));
    peer.write_all(ACK).await.unwrap();

    let metrics = sender.await.unwrap().unwrap();
    assert_eq!(metrics.messages, 2);
    assert_eq!(metrics.retries, 1);
    assert_eq!(metrics.discarded, 1);
    assert_eq!(metrics.total_bytes, 30);
    assert!(metrics.is_complete());
}

#[tokio::test]
async fn test_retries_exhausted_after_bounded_attempts() {
    let (stream, mut peer) = duplex(4096);
    let config = Config::client("127.0.0.1".to_string(), 5001)
        .with_message_size(10)
        .with_message_count(4)
        .with_ack_timeout(Duration::from_millis(30))
        .with_max_retries(2);
    let client = Client::new(config).unwrap();
    let sender = tokio::spawn(async move { client.send_over_stream(stream).await });

    read_header(&mut peer).await;
    let mut copies = 0;
    let mut buf = Vec::new();
    // The client shuts its side down once it gives up
    peer.read_to_end(&mut buf).await.unwrap();
    for message in buf.chunks(10) {
        assert_eq!(parse_sequence(message), Some(1));
        copies += 1;
    }

    let metrics = sender.await.unwrap().unwrap();
    assert_eq!(copies, 3);
    assert_eq!(metrics.messages, 0);
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.termination, Termination::RetriesExhausted { sequence: 1 });
}

#[tokio::test]
async fn test_server_closing_aborts_sender() {
    let (stream, mut peer) = duplex(4096);
    let client = client(10, 5);
    let sender = tokio::spawn(async move { client.send_over_stream(stream).await });

    read_header(&mut peer).await;
    read_message(&mut peer, 10).await;
    peer.write_all(ACK).await.unwrap();
    read_message(&mut peer, 10).await;
    drop(peer);

    let metrics = sender.await.unwrap().unwrap();
    assert_eq!(metrics.termination, Termination::PeerClosed);
    assert_eq!(metrics.messages, 1);
}

#[tokio::test]
async fn test_sender_and_receiver_over_memory_stream() {
    let (a, b) = duplex(1 << 16);
    let receiver_config = Config::server(0).with_read_timeout(Duration::from_secs(2));
    let receiver = tokio::spawn(async move { receive_over_stream(b, &receiver_config).await });

    let sent = client(64, 500).send_over_stream(a).await.unwrap();
    let received = receiver.await.unwrap().unwrap();

    assert_eq!(sent.messages, 500);
    assert_eq!(received.messages, 500);
    assert_eq!(received.total_bytes, 500 * 64);
    assert_eq!(received.lost_messages, 0);
    assert!(received.is_complete());
}

#[tokio::test]
async fn test_receiver_reassembles_byte_at_a_time() {
    let (mut peer, stream) = duplex(8);
    let config = Config::server(0).with_read_timeout(Duration::from_secs(1));
    let receiver = tokio::spawn(async move { receive_over_stream(stream, &config).await });

    peer.write_all(b"12,2\n").await.unwrap();
    for seq in 1..=2u64 {
        for byte in encode_message(seq, 12).unwrap() {
            peer.write_all(&[byte]).await.unwrap();
        }
        let mut ack = [0u8; 3];
        peer.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, ACK);
    }

    let metrics = receiver.await.unwrap().unwrap();
    assert_eq!(metrics.messages, 2);
    assert_eq!(metrics.total_bytes, 24);
    assert!(metrics.is_complete());
}
