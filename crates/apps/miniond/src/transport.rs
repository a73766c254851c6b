use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use minion_types::{Packet, RelayEndpoint, PACKET_LEN};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Largest frame a peer may send: the credential blob is smaller than a
/// packet, so the packet size bounds everything.
const MAX_FRAME_LEN: usize = PACKET_LEN;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("peer rejected authentication: {0}")]
    Permanent(String),
    #[error("transport io: {0}")]
    Io(String),
}

impl TransportError {
    /// Timeouts, refusals, and transient I/O retry; an authentication
    /// rejection does not.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Client half of the relay-to-relay transport. The wire codec and mutual
/// authentication live outside the core; this trait is what the outgoing
/// queue drives.
#[async_trait]
pub trait MmtpClient: Send {
    async fn send_batch(
        &mut self,
        peer: &RelayEndpoint,
        packets: &[Packet],
    ) -> Result<(), TransportError>;

    /// Install fresh credentials after a key rotation.
    fn rotate(&mut self, cert: Vec<u8>);
}

/// Framing glue over TCP: a hello frame carrying our current credential
/// blob, then one length-prefixed frame per packet.
pub struct TcpMmtpClient {
    timeout: Duration,
    cert: Vec<u8>,
}

impl TcpMmtpClient {
    pub fn new(timeout: Duration, cert: Vec<u8>) -> Self {
        Self { timeout, cert }
    }

    async fn send_inner(
        &self,
        addr: SocketAddr,
        packets: &[Packet],
    ) -> Result<(), TransportError> {
        let mut stream = TcpStream::connect(addr).await.map_err(map_connect_error)?;
        write_frame(&mut stream, &self.cert).await?;
        for packet in packets {
            write_frame(&mut stream, packet.as_bytes()).await?;
        }
        stream.flush().await.map_err(map_io_error)?;
        stream.shutdown().await.map_err(map_io_error)?;
        Ok(())
    }
}

#[async_trait]
impl MmtpClient for TcpMmtpClient {
    async fn send_batch(
        &mut self,
        peer: &RelayEndpoint,
        packets: &[Packet],
    ) -> Result<(), TransportError> {
        let addr = SocketAddr::new(peer.ip, peer.port);
        match tokio::time::timeout(self.timeout, self.send_inner(addr, packets)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn rotate(&mut self, cert: Vec<u8>) {
        log::info!("transport: installed rotated credentials ({} bytes)", cert.len());
        self.cert = cert;
    }
}

fn map_connect_error(err: std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::ConnectionRefused => TransportError::Refused,
        std::io::ErrorKind::TimedOut => TransportError::Timeout,
        _ => TransportError::Io(err.to_string()),
    }
}

fn map_io_error(err: std::io::Error) -> TransportError {
    TransportError::Io(err.to_string())
}

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), TransportError> {
    stream
        .write_all(&(bytes.len() as u32).to_be_bytes())
        .await
        .map_err(map_io_error)?;
    stream.write_all(bytes).await.map_err(map_io_error)
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("oversized frame: {len} bytes"),
        ));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Accept peer connections and feed received packets to the server loop.
/// Each connection starts with the peer's hello frame, then packet frames.
pub fn spawn_listener(
    listener: TcpListener,
    packets: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            log::warn!("transport: accept failed: {err}");
                            continue;
                        }
                    };
                    log::trace!("transport: connection from {peer_addr}");
                    let packets = packets.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, packets, cancel).await {
                            log::warn!("transport: connection from {peer_addr} failed: {err}");
                        }
                    });
                }
            }
        }
    })
}

async fn serve_connection(
    mut stream: TcpStream,
    packets: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    // Hello frame: the peer's credential blob. Verification belongs to the
    // authentication layer; here it only has to be well-framed.
    let Some(_hello) = read_frame(&mut stream).await? else {
        return Ok(());
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => {
                let Some(frame) = frame? else { return Ok(()) };
                if frame.len() != PACKET_LEN {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("packet frame of {} bytes", frame.len()),
                    ));
                }
                if packets.send(frame).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_roundtrips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let _server = spawn_listener(listener, tx, cancel.clone());

        let peer = RelayEndpoint { ip: addr.ip(), port: addr.port(), key_fingerprint: [3; 32] };
        let packets = vec![
            Packet::from_bytes(vec![1; PACKET_LEN]).expect("packet"),
            Packet::from_bytes(vec![2; PACKET_LEN]).expect("packet"),
        ];
        let mut client = TcpMmtpClient::new(Duration::from_secs(5), b"cert".to_vec());
        client.send_batch(&peer, &packets).await.expect("send");

        let first = rx.recv().await.expect("first packet");
        let second = rx.recv().await.expect("second packet");
        assert_eq!(first, vec![1; PACKET_LEN]);
        assert_eq!(second, vec![2; PACKET_LEN]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn refused_connection_is_retriable() {
        // Bind then drop to find a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let peer = RelayEndpoint { ip: addr.ip(), port: addr.port(), key_fingerprint: [3; 32] };
        let mut client = TcpMmtpClient::new(Duration::from_secs(5), Vec::new());
        let err = client
            .send_batch(&peer, &[Packet::from_bytes(vec![0; PACKET_LEN]).expect("packet")])
            .await
            .expect_err("send should fail");
        assert!(err.is_retriable());
    }

    #[test]
    fn only_authentication_rejection_is_permanent() {
        assert!(TransportError::Timeout.is_retriable());
        assert!(TransportError::Refused.is_retriable());
        assert!(TransportError::Io("reset".into()).is_retriable());
        assert!(!TransportError::Permanent("bad cert".into()).is_retriable());
    }
}
