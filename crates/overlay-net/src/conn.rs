//! [`WrappedConn`]: a handshake-authenticated, AEAD-framed duplex stream
//! bound to a pair of overlay addresses.

use crate::event::{ConnEvent, EventSink};
use hkdf::Hkdf;
use overlay_core::codec::{read_record, write_record, RecordCipher, MAX_RECORD_LEN};
use overlay_core::{NetworkError, OverlayAddress, PublicKey, SecretKey};
use sha2::Sha256;
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Object-safe duplex stream bound, matching what any carrier's raw
/// connection type (`TcpStream`, an in-memory UDP adapter, ...) already
/// implements. Boxed because the generic client core is shared across
/// carriers and can't be generic over the concrete stream type at its own
/// boundary without infecting every caller with it.
pub trait RawDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawDuplex for T {}

pub type BoxedConn = Box<dyn RawDuplex>;

/// Derive this side's send/recv AEAD keys for a connection between
/// `local_sk` and `remote_pk`. The two HKDF outputs are keyed by the
/// lexicographic order of the two public keys -- not by which side
/// dialed -- so both peers agree on which output is "lo-to-hi" and which
/// is "hi-to-lo" regardless of who initiated. Each side then picks which
/// of those two keys is its outbound key and which is its inbound key
/// based only on whether its own key is the lexicographically lesser one,
/// guaranteeing the initiator's send key equals the responder's recv key
/// and vice versa.
pub(crate) fn derive_session_keys(
    local_sk: &SecretKey,
    local_pk: PublicKey,
    remote_pk: PublicKey,
) -> Result<([u8; 32], [u8; 32]), NetworkError> {
    let shared = local_sk
        .diffie_hellman(&remote_pk)
        .ok_or_else(|| NetworkError::Other("peer key is not a valid curve point".into()))?;

    let local_is_lo = local_pk.as_bytes() < remote_pk.as_bytes();
    let (lo, hi) = if local_is_lo { (local_pk, remote_pk) } else { (remote_pk, local_pk) };
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(lo.as_bytes());
    salt.extend_from_slice(hi.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), &shared);
    let mut lo_to_hi = [0u8; 32];
    hk.expand(b"lo-to-hi", &mut lo_to_hi)
        .map_err(|_| NetworkError::Other("HKDF expand failed".into()))?;
    let mut hi_to_lo = [0u8; 32];
    hk.expand(b"hi-to-lo", &mut hi_to_lo)
        .map_err(|_| NetworkError::Other("HKDF expand failed".into()))?;

    // The lo peer sends on lo-to-hi and receives on hi-to-lo; the hi peer
    // is the mirror image, so each side's send key is the other's recv key.
    if local_is_lo {
        Ok((lo_to_hi, hi_to_lo))
    } else {
        Ok((hi_to_lo, lo_to_hi))
    }
}

/// A fully authenticated, AEAD-sealed connection to a remote overlay
/// address. Implements `AsyncRead`/`AsyncWrite` over internally framed
/// records, so callers never see the length prefix or the cipher state.
pub struct WrappedConn {
    inner: BoxedConn,
    cipher: RecordCipher,
    local_addr: OverlayAddress,
    remote_addr: OverlayAddress,
    release: Option<Arc<dyn Fn() + Send + Sync>>,
    events: Arc<dyn EventSink>,
    closed: AtomicBool,

    // Decrypted plaintext ready for the caller.
    read_buf: Vec<u8>,
    read_pos: usize,
    // In-progress record header (length prefix), persisted across polls so
    // a `Pending` partway through reading it doesn't lose the bytes already
    // consumed from the stream.
    read_header: [u8; 2],
    read_header_filled: usize,
    // In-progress record body (sealed ciphertext), same reasoning.
    read_body: Option<Vec<u8>>,
    read_body_filled: usize,

    // In-progress framed (length-prefix + ciphertext) outbound record,
    // sealed once up front so a `Pending` mid-write never re-seals (which
    // would advance the send nonce counter a second time for bytes already
    // partially on the wire).
    write_buf: Option<Vec<u8>>,
    write_filled: usize,
}

impl WrappedConn {
    /// `release` is `Some` only on the initiator side -- it frees the local
    /// ephemeral port reserved for this dial. Responder-side connections
    /// pass `None`.
    pub fn new(
        inner: BoxedConn,
        local_sk: &SecretKey,
        local_addr: OverlayAddress,
        remote_addr: OverlayAddress,
        release: Option<Arc<dyn Fn() + Send + Sync>>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, NetworkError> {
        let (send_key, recv_key) = derive_session_keys(local_sk, local_addr.pk, remote_addr.pk)?;
        Ok(Self {
            inner,
            cipher: RecordCipher::new(send_key, recv_key),
            local_addr,
            remote_addr,
            release,
            events,
            closed: AtomicBool::new(false),
            read_buf: Vec::new(),
            read_pos: 0,
            read_header: [0u8; 2],
            read_header_filled: 0,
            read_body: None,
            read_body_filled: 0,
            write_buf: None,
            write_filled: 0,
        })
    }

    pub fn local_addr(&self) -> OverlayAddress {
        self.local_addr
    }

    pub fn remote_addr(&self) -> OverlayAddress {
        self.remote_addr
    }

    /// Send one AEAD-framed record.
    pub async fn send_record(&mut self, plaintext: &[u8]) -> Result<(), NetworkError> {
        write_record(&mut self.inner, &mut self.cipher, plaintext)
            .await
            .map_err(NetworkError::from)
    }

    /// Receive one AEAD-framed record.
    pub async fn recv_record(&mut self) -> Result<Vec<u8>, NetworkError> {
        read_record(&mut self.inner, &mut self.cipher)
            .await
            .map_err(NetworkError::from)
    }

    /// Close the underlying stream and release the local port exactly
    /// once. Safe to call more than once.
    pub async fn close(&mut self) -> Result<(), NetworkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await;
        self.events.emit(ConnEvent::Closed {
            local: self.local_addr,
            remote: self.remote_addr,
        });
        if let Some(release) = self.release.take() {
            release();
        }
        Ok(())
    }
}

impl Drop for WrappedConn {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.events.emit(ConnEvent::Closed {
                local: self.local_addr,
                remote: self.remote_addr,
            });
            if let Some(release) = self.release.take() {
                release();
            }
        }
    }
}

// AsyncRead/AsyncWrite are implemented over the record framing rather than
// the raw stream: every poll_read drains one decrypted record at a time,
// and poll_write seals and forwards the caller's buffer as a single record.
// This keeps WrappedConn drop-in compatible with code written against a
// plain duplex stream.
//
// Both impls drive the underlying stream's poll_read/poll_write directly
// rather than awaiting `read_record`/`write_record` as one-shot futures:
// those helpers do a multi-step `read_exact`/`write_all` internally, and a
// freshly-constructed future has no memory of how many bytes of a prior
// attempt already crossed the wire. Polling a brand new future after every
// `Pending` would silently resend/re-derive from byte zero -- for writes
// that means re-sealing with a new nonce after some of the old ciphertext
// already reached the peer; for reads it means misreading the next frame's
// bytes as a fresh length prefix. The `read_header`/`read_body`/`write_buf`
// fields above persist exactly the progress needed to resume correctly.

impl AsyncRead for WrappedConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.read_pos < this.read_buf.len() {
                let remaining = &this.read_buf[this.read_pos..];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                this.read_pos += n;
                return Poll::Ready(Ok(()));
            }

            if this.read_body.is_none() {
                while this.read_header_filled < 2 {
                    let mut header_buf = ReadBuf::new(&mut this.read_header[this.read_header_filled..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut header_buf) {
                        Poll::Ready(Ok(())) => {
                            let n = header_buf.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(std::io::Error::new(
                                    ErrorKind::UnexpectedEof,
                                    "peer closed mid-record-header",
                                )));
                            }
                            this.read_header_filled += n;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }

                let len = u16::from_be_bytes(this.read_header) as usize;
                this.read_header_filled = 0;
                if len > MAX_RECORD_LEN {
                    return Poll::Ready(Err(std::io::Error::new(ErrorKind::InvalidData, "record too large")));
                }
                this.read_body = Some(vec![0u8; len]);
                this.read_body_filled = 0;
            }

            let body_len = this.read_body.as_ref().unwrap().len();
            while this.read_body_filled < body_len {
                let body = this.read_body.as_mut().unwrap();
                let mut body_buf = ReadBuf::new(&mut body[this.read_body_filled..]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut body_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = body_buf.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(std::io::Error::new(
                                ErrorKind::UnexpectedEof,
                                "peer closed mid-record-body",
                            )));
                        }
                        this.read_body_filled += n;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            let sealed = this.read_body.take().unwrap();
            let plaintext = this
                .cipher
                .open(&sealed)
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
            this.read_buf = plaintext;
            this.read_pos = 0;
            // Loop back around: the top of the loop now delivers from read_buf.
        }
    }
}

impl AsyncWrite for WrappedConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.write_buf.is_none() {
            let sealed = this
                .cipher
                .seal(buf)
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
            if sealed.len() > MAX_RECORD_LEN {
                return Poll::Ready(Err(std::io::Error::new(ErrorKind::InvalidData, "record too large")));
            }
            let mut framed = Vec::with_capacity(2 + sealed.len());
            framed.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
            framed.extend_from_slice(&sealed);
            this.write_buf = Some(framed);
            this.write_filled = 0;
        }

        loop {
            let framed_len = this.write_buf.as_ref().unwrap().len();
            if this.write_filled >= framed_len {
                break;
            }
            let framed = this.write_buf.as_ref().unwrap();
            match Pin::new(&mut this.inner).poll_write(cx, &framed[this.write_filled..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::Error::new(ErrorKind::WriteZero, "wrote zero bytes to inner stream")))
                }
                Poll::Ready(Ok(n)) => this.write_filled += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        this.write_buf = None;
        this.write_filled = 0;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
