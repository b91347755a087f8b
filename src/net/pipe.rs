//! Framed, bidirectional message channel over TCP.
//!
//! A [`PeerPipe`] owns one TCP connection and runs two background tasks: a
//! reader that decodes length-prefixed packets into an inbound channel, and
//! a writer that drains an outbound channel onto the socket. The protocol
//! actors above never touch the socket; they exchange [`Packet`]s with the
//! pipe and observe connection loss as a closed channel.
//!
//! Framing: a 4-byte big-endian length prefix followed by the packet's
//! encoded `(name, body)` record.

use super::MAX_FRAME_SIZE;
use crate::error::{CairnError, Result};
use crate::message::Packet;
use crate::protocol::TCP_KEEP_ALIVE_PERIOD;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the inbound and outbound packet channels.
const PIPE_CHANNEL_SIZE: usize = 256;

/// A framed, bidirectional message channel to one peer.
pub struct PeerPipe {
    addr: String,
    out_tx: mpsc::Sender<Packet>,
    in_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    writer: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PeerPipe {
    /// Wrap an established connection. Applies the TCP keep-alive period
    /// and spawns the reader and writer tasks.
    pub fn new(stream: TcpStream) -> Result<Self> {
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());

        apply_keepalive(&stream)?;

        let (read_half, write_half) = stream.into_split();
        let (in_tx, in_rx) = mpsc::channel(PIPE_CHANNEL_SIZE);
        let (out_tx, out_rx) = mpsc::channel(PIPE_CHANNEL_SIZE);

        let reader = tokio::spawn(read_loop(read_half, in_tx, addr.clone()));
        let writer = tokio::spawn(write_loop(write_half, out_rx, addr.clone()));

        Ok(Self {
            addr,
            out_tx,
            in_rx: tokio::sync::Mutex::new(in_rx),
            reader: parking_lot::Mutex::new(Some(reader)),
            writer: parking_lot::Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        })
    }

    /// Dial a peer and wrap the connection.
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CairnError::Timeout("connect"))?
            .map_err(|e| CairnError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        Self::new(stream)
    }

    /// The remote address of this pipe.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Queue a packet for sending. Returns `false` if the pipe is closed.
    pub async fn send(&self, packet: Packet) -> bool {
        self.out_tx.send(packet).await.is_ok()
    }

    /// Receive the next inbound packet, or `None` once the pipe is closed.
    pub async fn receive(&self) -> Option<Packet> {
        self.in_rx.lock().await.recv().await
    }

    /// Close the pipe. Both background tasks are torn down, which closes
    /// the socket and errs out the remote peer's reads. Idempotent; safe
    /// to call again after the tasks already terminated on their own.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.writer.lock().take() {
            handle.abort();
        }
        debug!(peer = %self.addr, "pipe closed");
    }
}

impl Drop for PeerPipe {
    fn drop(&mut self) {
        self.close();
    }
}

fn apply_keepalive(stream: &TcpStream) -> Result<()> {
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(TCP_KEEP_ALIVE_PERIOD);
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

async fn read_loop(mut half: OwnedReadHalf, in_tx: mpsc::Sender<Packet>, addr: String) {
    loop {
        match read_frame(&mut half).await {
            Ok(packet) => {
                if in_tx.send(packet).await.is_err() {
                    // Consumer gone; nothing left to deliver to.
                    return;
                }
            }
            Err(CairnError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(peer = %addr, "peer closed connection");
                return;
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "pipe read failed");
                return;
            }
        }
    }
}

async fn read_frame(half: &mut OwnedReadHalf) -> Result<Packet> {
    let mut len_buf = [0u8; 4];
    half.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CairnError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    half.read_exact(&mut buf).await?;
    Packet::decode(&buf)
}

async fn write_loop(mut half: OwnedWriteHalf, mut out_rx: mpsc::Receiver<Packet>, addr: String) {
    while let Some(packet) = out_rx.recv().await {
        match write_frame(&mut half, &packet).await {
            Ok(()) => {}
            Err(e) => {
                warn!(peer = %addr, error = %e, "pipe write failed");
                return;
            }
        }
    }
}

async fn write_frame(half: &mut OwnedWriteHalf, packet: &Packet) -> Result<()> {
    let bytes = packet.encode()?;
    let len = bytes.len() as u32;
    half.write_all(&len.to_be_bytes()).await?;
    half.write_all(&bytes).await?;
    half.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::factory;
    use crate::types::{OpCode, Txnid};
    use tokio::net::TcpListener;

    async fn pipe_pair() -> (PeerPipe, PeerPipe) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpStream::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        (PeerPipe::new(client).unwrap(), PeerPipe::new(server).unwrap())
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (a, b) = pipe_pair().await;

        let packet = factory::proposal(
            Txnid::new(1, 1),
            "a",
            1,
            OpCode::Set,
            "k",
            b"v".to_vec(),
        );
        assert!(a.send(packet.clone()).await);

        let got = b.receive().await.unwrap();
        assert_eq!(got, packet);
    }

    #[tokio::test]
    async fn test_messages_delivered_in_order() {
        let (a, b) = pipe_pair().await;

        for i in 1..=10u32 {
            assert!(a.send(factory::commit(Txnid::new(1, i))).await);
        }
        for i in 1..=10u32 {
            match b.receive().await.unwrap() {
                Packet::Commit(c) => assert_eq!(c.txnid, Txnid::new(1, i)),
                other => panic!("unexpected packet {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_close_unblocks_peer() {
        let (a, b) = pipe_pair().await;

        a.close();

        // The remote read errs out and the pipe reports closed.
        let got = tokio::time::timeout(Duration::from_secs(1), b.receive())
            .await
            .expect("receive unblocked");
        assert!(got.is_none());
    }
}
