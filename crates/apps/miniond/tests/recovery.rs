//! Crash recovery: entries queued for transport survive a process restart
//! with their addresses and payloads intact.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use miniond::outgoing::OutgoingQueue;
use miniond::transport::{MmtpClient, TransportError};
use minion_queue::RetryPolicy;
use minion_types::{Packet, RelayEndpoint, PACKET_LEN};

#[derive(Clone, Default)]
struct CollectingMmtp {
    sent: Arc<Mutex<Vec<(RelayEndpoint, Vec<Packet>)>>>,
}

#[async_trait]
impl MmtpClient for CollectingMmtp {
    async fn send_batch(
        &mut self,
        peer: &RelayEndpoint,
        packets: &[Packet],
    ) -> Result<(), TransportError> {
        self.sent.lock().expect("lock").push((peer.clone(), packets.to_vec()));
        Ok(())
    }

    fn rotate(&mut self, _cert: Vec<u8>) {}
}

#[derive(Clone, Default)]
struct RefusingMmtp;

#[async_trait]
impl MmtpClient for RefusingMmtp {
    async fn send_batch(
        &mut self,
        _peer: &RelayEndpoint,
        _packets: &[Packet],
    ) -> Result<(), TransportError> {
        Err(TransportError::Refused)
    }

    fn rotate(&mut self, _cert: Vec<u8>) {}
}

fn peer() -> RelayEndpoint {
    RelayEndpoint {
        ip: "192.0.2.9".parse().expect("ip"),
        port: 48_099,
        key_fingerprint: [0x11; 32],
    }
}

fn numbered_packet(i: usize) -> Packet {
    let mut bytes = vec![0u8; PACKET_LEN];
    bytes[0] = (i / 256) as u8;
    bytes[1] = (i % 256) as u8;
    Packet::from_bytes(bytes).expect("packet")
}

#[tokio::test]
async fn hundred_entries_survive_restart_with_payloads_intact() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path().join("outgoing");
    let t0 = 5_000;

    {
        let queue = OutgoingQueue::open(&dir, RetryPolicy::default()).expect("open");
        for i in 0..100 {
            queue.enqueue(&peer(), &numbered_packet(i), t0 + i as u64).expect("enqueue");
        }
        // Dropped without any delivery attempt: the "crash".
    }

    let queue = OutgoingQueue::open(&dir, RetryPolicy::default()).expect("reopen");
    assert_eq!(queue.count(), 100, "all entries recovered");

    let mut client = CollectingMmtp::default();
    let stats = queue.flush(&mut client, t0 + 1_000).await;
    assert_eq!(stats.sent, 100);

    let sent = client.sent.lock().expect("lock");
    assert_eq!(sent.len(), 1, "one destination bucket, one transport call");
    let (endpoint, packets) = &sent[0];
    assert_eq!(endpoint, &peer());
    assert_eq!(packets.len(), 100);
    for (i, packet) in packets.iter().enumerate() {
        assert_eq!(packet, &numbered_packet(i), "FIFO order within the peer bucket");
    }
    assert_eq!(queue.count(), 0);
}

#[tokio::test]
async fn refused_send_keeps_entries_for_a_later_attempt() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path().join("outgoing");

    let queue = OutgoingQueue::open(&dir, RetryPolicy::default()).expect("open");
    for i in 0..5 {
        queue.enqueue(&peer(), &numbered_packet(i), 100).expect("enqueue");
    }

    let mut refusing = RefusingMmtp;
    let stats = queue.flush(&mut refusing, 100).await;
    assert_eq!(stats.retried, 5);
    assert_eq!(queue.count(), 5, "refused entries stay queued");

    // Well past the first-retry backoff ceiling.
    let mut client = CollectingMmtp::default();
    let later = 100 + 2 * RetryPolicy::default().base_secs + 1;
    let stats = queue.flush(&mut client, later).await;
    assert_eq!(stats.sent, 5);
    assert_eq!(queue.count(), 0);
}
