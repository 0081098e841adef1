//! Wire encoding for the handshake frames and for the AEAD-sealed records
//! exchanged once the handshake completes.
//!
//! The handshake frames use a fixed binary layout (not CBOR, unlike the
//! higher-level control-channel framing this crate's sibling modules are
//! modeled on): the layout is small and fixed-shape enough that a schema
//! format would only add overhead, and the frames must parse identically
//! byte-for-byte on both sides to be meaningfully signed over.
//!
//! Post-handshake records use `[2-byte big-endian length][ciphertext]`,
//! where the length covers the ChaCha20-Poly1305 ciphertext including its
//! 16-byte tag.

use crate::error::HandshakeError;
use crate::identity::OverlayAddress;
use crate::keys::PublicKey;
use crate::messages::{HandshakeFrame1, HandshakeFrame2, HandshakeFrame3};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const FRAME1_LEN: usize = 1 + 32 + 2 + 32 + 2 + 24;
const FRAME23_LEN: usize = 64;

/// Maximum ciphertext length for a single AEAD record. Guards against a
/// malicious peer claiming an unreasonable length prefix and forcing an
/// unbounded allocation.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

pub async fn write_frame1<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &HandshakeFrame1,
) -> Result<(), HandshakeError> {
    let mut buf = Vec::with_capacity(FRAME1_LEN);
    buf.push(frame.version);
    buf.extend_from_slice(frame.initiator.pk.as_bytes());
    buf.extend_from_slice(&frame.initiator.port.to_be_bytes());
    buf.extend_from_slice(frame.responder_pk.as_bytes());
    buf.extend_from_slice(&frame.responder_port.to_be_bytes());
    buf.extend_from_slice(&frame.nonce);
    w.write_all(&buf).await?;
    Ok(())
}

pub async fn read_frame1<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<HandshakeFrame1, HandshakeError> {
    let mut buf = [0u8; FRAME1_LEN];
    r.read_exact(&mut buf).await?;

    let version = buf[0];
    let mut off = 1;

    let mut initiator_pk = [0u8; 32];
    initiator_pk.copy_from_slice(&buf[off..off + 32]);
    off += 32;
    let initiator_port = u16::from_be_bytes([buf[off], buf[off + 1]]);
    off += 2;

    let mut responder_pk = [0u8; 32];
    responder_pk.copy_from_slice(&buf[off..off + 32]);
    off += 32;
    let responder_port = u16::from_be_bytes([buf[off], buf[off + 1]]);
    off += 2;

    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(&buf[off..off + 24]);

    Ok(HandshakeFrame1 {
        version,
        initiator: OverlayAddress::new(PublicKey::from_bytes(initiator_pk), initiator_port),
        responder_pk: PublicKey::from_bytes(responder_pk),
        responder_port,
        nonce,
    })
}

pub async fn write_frame2<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &HandshakeFrame2,
) -> Result<(), HandshakeError> {
    w.write_all(&frame.signature).await?;
    Ok(())
}

pub async fn read_frame2<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<HandshakeFrame2, HandshakeError> {
    let mut signature = [0u8; FRAME23_LEN];
    r.read_exact(&mut signature).await?;
    Ok(HandshakeFrame2 { signature })
}

pub async fn write_frame3<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &HandshakeFrame3,
) -> Result<(), HandshakeError> {
    w.write_all(&frame.signature).await?;
    Ok(())
}

pub async fn read_frame3<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<HandshakeFrame3, HandshakeError> {
    let mut signature = [0u8; FRAME23_LEN];
    r.read_exact(&mut signature).await?;
    Ok(HandshakeFrame3 { signature })
}

/// A derived AEAD sealing context for one connection. Holds a distinct
/// cipher per direction -- `send_key` and `recv_key` must each be the
/// *other* side's matching key, i.e. this side's `send_key` is the peer's
/// `recv_key` -- so that the two independent nonce counters below never
/// reuse a (key, nonce) pair across directions. Built once after the
/// handshake completes and reused for every record.
pub struct RecordCipher {
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
    send_counter: u64,
    recv_counter: u64,
}

impl RecordCipher {
    pub fn new(send_key: [u8; 32], recv_key: [u8; 32]) -> Self {
        Self {
            send_cipher: ChaCha20Poly1305::new(Key::from_slice(&send_key)),
            recv_cipher: ChaCha20Poly1305::new(Key::from_slice(&recv_key)),
            send_counter: 0,
            recv_counter: 0,
        }
    }

    fn nonce_for(counter: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&counter.to_be_bytes());
        *Nonce::from_slice(&bytes)
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let nonce = Self::nonce_for(self.send_counter);
        self.send_counter = self.send_counter.wrapping_add(1);
        self.send_cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| HandshakeError::Malformed("AEAD seal failure".into()))
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let nonce = Self::nonce_for(self.recv_counter);
        self.recv_counter = self.recv_counter.wrapping_add(1);
        self.recv_cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| HandshakeError::Malformed("AEAD open failure (bad tag or replay)".into()))
    }
}

/// Write one length-prefixed, sealed record to the underlying stream.
pub async fn write_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    cipher: &mut RecordCipher,
    plaintext: &[u8],
) -> Result<(), HandshakeError> {
    let sealed = cipher.seal(plaintext)?;
    if sealed.len() > MAX_RECORD_LEN {
        return Err(HandshakeError::Malformed("record too large".into()));
    }
    w.write_all(&(sealed.len() as u16).to_be_bytes()).await?;
    w.write_all(&sealed).await?;
    Ok(())
}

/// Read and open one length-prefixed, sealed record from the underlying
/// stream.
pub async fn read_record<R: AsyncRead + Unpin>(
    r: &mut R,
    cipher: &mut RecordCipher,
) -> Result<Vec<u8>, HandshakeError> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Err(HandshakeError::Malformed("record too large".into()));
    }
    let mut sealed = vec![0u8; len];
    r.read_exact(&mut sealed).await?;
    cipher.open(&sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SecretKey;

    #[tokio::test]
    async fn frame1_roundtrip() {
        let (pk_a, _) = SecretKey::generate();
        let (pk_b, _) = SecretKey::generate();
        let frame = HandshakeFrame1 {
            version: crate::messages::PROTOCOL_VERSION,
            initiator: OverlayAddress::new(pk_a, 1000),
            responder_pk: pk_b,
            responder_port: 2000,
            nonce: [7u8; 24],
        };
        let mut buf = Vec::new();
        write_frame1(&mut buf, &frame).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame1(&mut cursor).await.unwrap();
        assert_eq!(frame, decoded);
    }

    #[tokio::test]
    async fn record_roundtrip() {
        let key = [9u8; 32];
        let mut sender = RecordCipher::new(key, key);
        let mut receiver = RecordCipher::new(key, key);

        let mut buf = Vec::new();
        write_record(&mut buf, &mut sender, b"hello overlay").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let plaintext = read_record(&mut cursor, &mut receiver).await.unwrap();
        assert_eq!(plaintext, b"hello overlay");
    }

    #[tokio::test]
    async fn record_counters_desync_on_reorder() {
        let key = [3u8; 32];
        let mut sender = RecordCipher::new(key, key);
        let mut receiver = RecordCipher::new(key, key);

        let mut first = Vec::new();
        write_record(&mut first, &mut sender, b"one").await.unwrap();
        let mut second = Vec::new();
        write_record(&mut second, &mut sender, b"two").await.unwrap();

        // Deliver out of order: the nonce counter on the receive side no
        // longer matches, so the second frame fails to authenticate.
        let mut cursor = std::io::Cursor::new(second);
        assert!(read_record(&mut cursor, &mut receiver).await.is_err());
    }
}
