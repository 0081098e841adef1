//! The three-frame mutual-authentication handshake run on every raw
//! connection before it is handed to the application as a [`crate::conn::WrappedConn`].

use overlay_core::codec::{read_frame1, read_frame2, read_frame3, write_frame1, write_frame2, write_frame3};
use overlay_core::messages::{HandshakeFrame1, HandshakeFrame2, HandshakeFrame3, PROTOCOL_VERSION};
use overlay_core::{HandshakeError, OverlayAddress, PublicKey, SecretKey};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};

/// Default deadline for a full handshake round trip. Carriers may override
/// this (e.g. SUDPH's hole-punch phase already burns some of the budget
/// before the handshake proper starts).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn fresh_nonce() -> [u8; 24] {
    let mut nonce = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Run the initiator side of the handshake over an already-connected raw
/// stream. Returns `(local_addr, remote_addr)` on success.
pub async fn initiator_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local_sk: &SecretKey,
    local_pk: PublicKey,
    local_port: u16,
    remote_pk: PublicKey,
    remote_port: u16,
) -> Result<(OverlayAddress, OverlayAddress), HandshakeError> {
    timeout(
        HANDSHAKE_TIMEOUT,
        initiator_handshake_inner(stream, local_sk, local_pk, local_port, remote_pk, remote_port),
    )
    .await
    .map_err(|_| HandshakeError::Timeout)?
}

async fn initiator_handshake_inner<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local_sk: &SecretKey,
    local_pk: PublicKey,
    local_port: u16,
    remote_pk: PublicKey,
    remote_port: u16,
) -> Result<(OverlayAddress, OverlayAddress), HandshakeError> {
    let initiator_nonce = fresh_nonce();
    let frame1 = HandshakeFrame1 {
        version: PROTOCOL_VERSION,
        initiator: OverlayAddress::new(local_pk, local_port),
        responder_pk: remote_pk,
        responder_port: remote_port,
        nonce: initiator_nonce,
    };
    write_frame1(stream, &frame1).await?;

    let frame2: HandshakeFrame2 = read_frame2(stream).await?;
    if !remote_pk.verify(&initiator_nonce, &frame2.signature) {
        return Err(HandshakeError::AuthFailed(
            "responder proof of possession failed".into(),
        ));
    }

    // Frame 3's transcript extends frame 1's with the same nonce frame 1
    // already carried, rather than minting a fresh one: both sides can
    // compute it without a fourth wire frame, and it still binds frame 3
    // to this exact handshake instance.
    let transcript = [frame1.transcript(), frame1.nonce.to_vec()].concat();
    let signature = local_sk.sign(&transcript);
    write_frame3(stream, &HandshakeFrame3 { signature }).await?;

    let local_addr = OverlayAddress::new(local_pk, local_port);
    let remote_addr = OverlayAddress::new(remote_pk, remote_port);
    Ok((local_addr, remote_addr))
}

/// Run the responder side of the handshake. `port_checker` returns `Ok(())`
/// if a listener exists on the requested overlay port, or an error
/// otherwise; it is consulted only after the destination public key in
/// frame 1 has been confirmed to match `local_pk`.
pub async fn responder_handshake<S, F>(
    stream: &mut S,
    local_sk: &SecretKey,
    local_pk: PublicKey,
    port_checker: F,
) -> Result<(OverlayAddress, OverlayAddress), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(u16) -> Result<(), HandshakeError>,
{
    timeout(
        HANDSHAKE_TIMEOUT,
        responder_handshake_inner(stream, local_sk, local_pk, port_checker),
    )
    .await
    .map_err(|_| HandshakeError::Timeout)?
}

async fn responder_handshake_inner<S, F>(
    stream: &mut S,
    local_sk: &SecretKey,
    local_pk: PublicKey,
    port_checker: F,
) -> Result<(OverlayAddress, OverlayAddress), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(u16) -> Result<(), HandshakeError>,
{
    let frame1 = read_frame1(stream).await?;

    // Identity check first: a forged destination key must never reach the
    // listener table.
    if frame1.responder_pk != local_pk {
        return Err(HandshakeError::WrongPeer);
    }

    port_checker(frame1.responder_port)?;

    let signature = local_sk.sign(&frame1.nonce);
    write_frame2(stream, &HandshakeFrame2 { signature }).await?;

    let frame3: HandshakeFrame3 = read_frame3(stream).await?;
    let transcript = [frame1.transcript(), frame1.nonce.to_vec()].concat();
    if !frame1.initiator.pk.verify(&transcript, &frame3.signature) {
        return Err(HandshakeError::AuthFailed(
            "initiator proof of possession failed".into(),
        ));
    }

    let local_addr = OverlayAddress::new(local_pk, frame1.responder_port);
    let remote_addr = frame1.initiator;
    Ok((local_addr, remote_addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn symmetric_handshake_converges() {
        let (pk_a, sk_a) = SecretKey::generate();
        let (pk_b, sk_b) = SecretKey::generate();

        let (mut client_stream, mut server_stream) = duplex(4096);

        let client_pk = pk_a;
        let server_pk = pk_b;

        let client_task = tokio::spawn(async move {
            initiator_handshake(&mut client_stream, &sk_a, client_pk, 55000, server_pk, 42).await
        });

        let server_task = tokio::spawn(async move {
            responder_handshake(&mut server_stream, &sk_b, server_pk, |port| {
                if port == 42 {
                    Ok(())
                } else {
                    Err(HandshakeError::NoListener)
                }
            })
            .await
        });

        let (client_local, client_remote) = client_task.await.unwrap().unwrap();
        let (server_local, server_remote) = server_task.await.unwrap().unwrap();

        assert_eq!(client_local, server_remote);
        assert_eq!(server_local, client_remote);
    }

    #[tokio::test]
    async fn wrong_destination_key_is_rejected_before_port_check() {
        let (_pk_a, sk_a) = SecretKey::generate();
        let (pk_b, sk_b) = SecretKey::generate();
        let (pk_wrong, _sk_wrong) = SecretKey::generate();

        let (mut client_stream, mut server_stream) = duplex(4096);

        let client_task = tokio::spawn(async move {
            // Initiator believes it is dialing `pk_wrong`, not `pk_b`.
            initiator_handshake(&mut client_stream, &sk_a, _pk_a, 55000, pk_wrong, 42).await
        });

        let server_task = tokio::spawn(async move {
            responder_handshake(&mut server_stream, &sk_b, pk_b, |_port| {
                panic!("port checker must not run when the destination key is wrong")
            })
            .await
        });

        let _ = client_task.await;
        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::WrongPeer));
    }

    #[tokio::test]
    async fn missing_listener_yields_no_listener() {
        let (pk_a, sk_a) = SecretKey::generate();
        let (pk_b, sk_b) = SecretKey::generate();

        let (mut client_stream, mut server_stream) = duplex(4096);

        let client_task = tokio::spawn(async move {
            initiator_handshake(&mut client_stream, &sk_a, pk_a, 55000, pk_b, 99).await
        });
        let server_task = tokio::spawn(async move {
            responder_handshake(&mut server_stream, &sk_b, pk_b, |_port| Err(HandshakeError::NoListener)).await
        });

        let _ = client_task.await;
        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::NoListener));
    }
}
