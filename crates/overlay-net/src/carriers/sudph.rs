//! SUDPH: resolver-coordinated UDP hole punching.
//!
//! Dialing and listening both go through the same resolver used by STCPR to
//! exchange candidate addresses, but the raw stream that results is a
//! datagram pairing rather than a TCP socket. A small `Syn`/`SynAck`/`Ack`
//! control exchange establishes that pairing, after which
//! [`ReliableUdpStream`] adapts the punched socket into an ordered,
//! reassembled byte stream so the rest of the pipeline (handshake, AEAD
//! framing) never special-cases UDP.

use super::{DialFn, ListenFn, RawListener};
use crate::addrresolver::AddressResolver;
use overlay_core::{NetworkError, PublicKey};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

const CARRIER_TAG: &str = "sudph";
const TAG_SYN: u8 = 0;
const TAG_SYN_ACK: u8 = 1;
const TAG_ACK: u8 = 2;
const TAG_DATA: u8 = 3;
const PUNCH_TIMEOUT: Duration = Duration::from_secs(5);
const PUNCH_RETRIES: u32 = 5;

pub fn dial_fn(resolver: Arc<dyn AddressResolver>) -> DialFn {
    Arc::new(move |pk: PublicKey, _port: u16| {
        let resolver = resolver.clone();
        Box::pin(async move {
            let record = resolver
                .resolve(CARRIER_TAG, pk)
                .await
                .map_err(NetworkError::ResolveFailed)?;

            let candidates: Vec<String> = if record.is_local {
                record
                    .addresses
                    .iter()
                    .map(|host| format!("{host}:{}", record.port))
                    .collect()
            } else {
                let remote = record
                    .remote_addr
                    .ok_or_else(|| NetworkError::ResolveFailed("remote record missing remote_addr".into()))?;
                vec![if remote.contains(':') { remote } else { format!("{remote}:{}", record.port) }]
            };

            let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(NetworkError::Io)?;

            let mut last_err = None;
            for candidate in &candidates {
                let peer: SocketAddr = match candidate.parse() {
                    Ok(a) => a,
                    Err(e) => {
                        last_err = Some(format!("bad candidate {candidate}: {e}"));
                        continue;
                    }
                };
                match punch_as_initiator(&socket, peer).await {
                    Ok(()) => return Ok(Box::new(ReliableUdpStream::standalone(socket, peer)) as crate::conn::BoxedConn),
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "sudph hole punch failed, trying next candidate");
                        last_err = Some(e.to_string());
                    }
                }
            }
            Err(NetworkError::DialFailed(format!(
                "sudph hole punch failed for {pk}: {:?}",
                last_err
            )))
        })
    })
}

async fn punch_as_initiator(socket: &UdpSocket, peer: SocketAddr) -> Result<(), NetworkError> {
    let mut buf = [0u8; 1];
    for attempt in 0..PUNCH_RETRIES {
        socket
            .send_to(&[TAG_SYN], peer)
            .await
            .map_err(NetworkError::Io)?;
        match timeout(PUNCH_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((1, from))) if from == peer && buf[0] == TAG_SYN_ACK => {
                socket.send_to(&[TAG_ACK], peer).await.map_err(NetworkError::Io)?;
                return Ok(());
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => return Err(NetworkError::Io(e)),
            Err(_) => {
                debug!(peer = %peer, attempt, "sudph punch attempt timed out, retrying");
            }
        }
    }
    Err(NetworkError::DialFailed(format!("hole punch to {peer} timed out")))
}

pub fn listen_fn(bind_addr: String, local_pk: PublicKey, resolver: Arc<dyn AddressResolver>) -> ListenFn {
    Arc::new(move || {
        let bind_addr = bind_addr.clone();
        let resolver = resolver.clone();
        Box::pin(async move {
            let socket = Arc::new(UdpSocket::bind(&bind_addr).await.map_err(NetworkError::Io)?);
            let actual = socket.local_addr().map_err(NetworkError::Io)?;
            resolver
                .register(CARRIER_TAG, local_pk, &actual.to_string())
                .await
                .map_err(NetworkError::ResolveFailed)?;
            Ok(RawListener::Sudph(SudphListener::new(socket)))
        })
    })
}

/// The listener side of the hole-punch rendezvous: one shared socket
/// demultiplexes inbound datagrams by source address into either an
/// in-progress punch handshake or an established connection's frame queue.
pub struct SudphListener {
    socket: Arc<UdpSocket>,
    accept_rx: Mutex<mpsc::Receiver<(ReliableUdpStream, SocketAddr)>>,
}

impl SudphListener {
    fn new(socket: Arc<UdpSocket>) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(16);
        let demux: Arc<Mutex<std::collections::HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>> =
            Arc::new(Mutex::new(std::collections::HashMap::new()));

        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 65536];
            loop {
                let (n, from) = match recv_socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "sudph listener socket recv failed, accept loop exiting");
                        break;
                    }
                };
                if n == 0 {
                    continue;
                }

                if let Some(tx) = demux.lock().await.get(&from) {
                    if buf[0] == TAG_DATA {
                        let _ = tx.send(buf[1..n].to_vec()).await;
                    }
                    continue;
                }

                if buf[0] != TAG_SYN {
                    continue;
                }

                let sock = recv_socket.clone();
                let demux = demux.clone();
                let accept_tx = accept_tx.clone();
                tokio::spawn(async move {
                    if sock.send_to(&[TAG_SYN_ACK], from).await.is_err() {
                        return;
                    }
                    let mut ack_buf = [0u8; 1];
                    match timeout(PUNCH_TIMEOUT, sock.recv_from(&mut ack_buf)).await {
                        Ok(Ok((1, addr))) if addr == from && ack_buf[0] == TAG_ACK => {}
                        _ => return,
                    }
                    let (frame_tx, frame_rx) = mpsc::channel(64);
                    demux.lock().await.insert(from, frame_tx);
                    let stream = ReliableUdpStream::shared(sock, from, frame_rx);
                    let _ = accept_tx.send((stream, from)).await;
                });
            }
        });

        Self {
            socket,
            accept_rx: Mutex::new(accept_rx),
        }
    }

    pub async fn accept(&self) -> Result<(crate::conn::BoxedConn, SocketAddr), NetworkError> {
        let mut rx = self.accept_rx.lock().await;
        let (stream, addr) = rx.recv().await.ok_or(NetworkError::Closed)?;
        Ok((Box::new(stream), addr))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket.local_addr().map_err(NetworkError::Io)
    }
}

/// Adapts a punched UDP pairing into an ordered, reassembled byte stream.
///
/// Each write is sent as one `TAG_DATA` datagram carrying a monotonic
/// sequence number; the reader buffers out-of-order arrivals and only
/// releases a contiguous prefix. There is no retransmission -- a dropped
/// datagram stalls that connection rather than being resent, which is
/// sufficient for the demo/CLI use of this carrier but would need a
/// resend timer for production traffic.
pub struct ReliableUdpStream {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    send_seq: u32,
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
    reorder: BTreeMap<u32, Vec<u8>>,
    next_recv_seq: u32,
    ready: Vec<u8>,
    ready_pos: usize,
}

impl ReliableUdpStream {
    /// The initiator owns its own private socket (one per dial), so no
    /// demuxing is needed: every datagram on it is from `peer`.
    fn standalone(socket: UdpSocket, peer: SocketAddr) -> Self {
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(64);
        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 65536];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((n, from)) if from == peer && n > 0 && buf[0] == TAG_DATA => {
                        if tx.send(buf[1..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        });
        Self::new(socket, peer, rx)
    }

    /// The responder side shares one listening socket across many
    /// connections; the listener's demux loop hands this stream its own
    /// private inbound channel.
    fn shared(socket: Arc<UdpSocket>, peer: SocketAddr, inbound: mpsc::Receiver<Vec<u8>>) -> Self {
        Self::new(socket, peer, inbound)
    }

    fn new(socket: Arc<UdpSocket>, peer: SocketAddr, inbound: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            socket,
            peer,
            send_seq: 0,
            inbound: Some(inbound),
            reorder: BTreeMap::new(),
            next_recv_seq: 0,
            ready: Vec::new(),
            ready_pos: 0,
        }
    }

    fn drain_ready_from_reorder(&mut self) {
        while let Some(chunk) = self.reorder.remove(&self.next_recv_seq) {
            self.ready.extend_from_slice(&chunk);
            self.next_recv_seq = self.next_recv_seq.wrapping_add(1);
        }
    }
}

impl AsyncRead for ReliableUdpStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.ready_pos < this.ready.len() {
            let remaining = &this.ready[this.ready_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.ready_pos += n;
            return Poll::Ready(Ok(()));
        }
        this.ready.clear();
        this.ready_pos = 0;

        let inbound = match this.inbound.as_mut() {
            Some(rx) => rx,
            None => return Poll::Ready(Ok(())),
        };

        loop {
            match inbound.poll_recv(cx) {
                Poll::Ready(Some(frame)) => {
                    if frame.len() < 4 {
                        continue;
                    }
                    let seq = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
                    this.reorder.insert(seq, frame[4..].to_vec());
                    this.drain_ready_from_reorder();
                    if !this.ready.is_empty() {
                        let n = this.ready.len().min(buf.remaining());
                        buf.put_slice(&this.ready[..n]);
                        this.ready_pos = n;
                        return Poll::Ready(Ok(()));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for ReliableUdpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let seq = this.send_seq;
        let mut datagram = Vec::with_capacity(5 + buf.len());
        datagram.push(TAG_DATA);
        datagram.extend_from_slice(&seq.to_be_bytes());
        datagram.extend_from_slice(buf);

        let fut = this.socket.send_to(&datagram, this.peer);
        tokio::pin!(fut);
        match fut.poll(cx) {
            Poll::Ready(Ok(_)) => {
                this.send_seq = this.send_seq.wrapping_add(1);
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inbound = None;
        Poll::Ready(Ok(()))
    }
}
