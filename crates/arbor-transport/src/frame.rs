/// Wire framing and the mutual authentication handshake.
///
/// A frame is `len: u32 BE | type id: 16 bytes | payload`, where `len`
/// covers the type id and the payload.
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Keypair, Message, MessageTypeId, ServerId, ServerIdentity, TransportError};

const TYPE_ID_LEN: usize = 16;

/// Domain separation for handshake signatures.
const HANDSHAKE_DOMAIN: &[u8] = b"arbor-transport-handshake-v1";

/// Write one frame. Returns the number of bytes put on the wire.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg_type: &MessageTypeId,
    payload: &[u8],
    max_size: usize,
) -> Result<usize, TransportError> {
    let too_large = TransportError::MessageTooLarge {
        size: payload.len(),
        max: max_size,
    };
    if payload.len() > max_size {
        return Err(too_large);
    }
    let len = u32::try_from(TYPE_ID_LEN + payload.len()).map_err(|_| too_large)?;
    let mut buf = Vec::with_capacity(4 + len as usize);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(msg_type.as_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(buf.len())
}

/// Read one frame. A clean EOF before the length prefix is `Closed`.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<(MessageTypeId, Vec<u8>, usize), TransportError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len < TYPE_ID_LEN {
        return Err(TransportError::Deserialization(format!(
            "frame of {len} bytes is shorter than a type id"
        )));
    }
    if len - TYPE_ID_LEN > max_size {
        return Err(TransportError::MessageTooLarge {
            size: len - TYPE_ID_LEN,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let payload = buf.split_off(TYPE_ID_LEN);
    let mut id = [0u8; TYPE_ID_LEN];
    id.copy_from_slice(&buf);
    Ok((MessageTypeId::from_bytes(id), payload, 4 + len))
}

async fn write_typed<W: AsyncWrite + Unpin, M: Message>(
    writer: &mut W,
    msg: &M,
    max_size: usize,
) -> Result<usize, TransportError> {
    let payload = rmp_serde::to_vec(msg)?;
    write_frame(writer, &MessageTypeId::of::<M>(), &payload, max_size).await
}

async fn read_typed<R: AsyncRead + Unpin, M: Message>(
    reader: &mut R,
    max_size: usize,
) -> Result<(M, usize), TransportError> {
    let (id, payload, n) = read_frame(reader, max_size).await?;
    if id != MessageTypeId::of::<M>() {
        return Err(TransportError::Handshake {
            peer: "unknown".into(),
            reason: format!("expected {}, got type {id}", M::NAME),
        });
    }
    Ok((rmp_serde::from_slice(&payload)?, n))
}

#[derive(Serialize, Deserialize)]
struct Hello {
    identity: ServerIdentity,
    nonce: [u8; 32],
}

impl Message for Hello {
    const NAME: &'static str = "arbor.transport.Hello";
}

#[derive(Serialize, Deserialize)]
struct Proof {
    signature: Vec<u8>,
}

impl Message for Proof {
    const NAME: &'static str = "arbor.transport.Proof";
}

fn transcript(nonce: &[u8; 32], signer: &ServerId) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HANDSHAKE_DOMAIN.len() + 64);
    bytes.extend_from_slice(HANDSHAKE_DOMAIN);
    bytes.extend_from_slice(nonce);
    bytes.extend_from_slice(signer.as_bytes());
    bytes
}

/// Outcome of a successful handshake.
pub(crate) struct Handshaked {
    pub remote: ServerIdentity,
    pub tx: usize,
    pub rx: usize,
}

/// Mutually authenticate both ends of `stream`.
///
/// Each side announces its identity with a fresh nonce and proves
/// possession of its secret key by signing the peer's nonce. When
/// `expected` is set (dialing side) the peer must present that public key.
pub(crate) async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    keypair: &Keypair,
    local: &ServerIdentity,
    expected: Option<&ServerIdentity>,
    max_size: usize,
) -> Result<Handshaked, TransportError> {
    let nonce: [u8; 32] = rand::random();
    let mut tx = write_typed(
        stream,
        &Hello {
            identity: local.clone(),
            nonce,
        },
        max_size,
    )
    .await?;
    let (hello, mut rx) = read_typed::<_, Hello>(stream, max_size).await?;
    let remote = hello.identity;

    if let Some(expected) = expected {
        if remote.public() != expected.public() {
            return Err(TransportError::Handshake {
                peer: expected.to_string(),
                reason: format!("peer presented key {}", remote.public()),
            });
        }
    }

    let signature = keypair.sign(&transcript(&hello.nonce, &local.id()));
    tx += write_typed(stream, &Proof { signature }, max_size).await?;
    let (proof, n) = read_typed::<_, Proof>(stream, max_size).await?;
    rx += n;

    remote
        .public()
        .verify(&transcript(&nonce, &remote.id()), &proof.signature)
        .map_err(|_| TransportError::Handshake {
            peer: remote.to_string(),
            reason: "invalid proof of key possession".into(),
        })?;

    Ok(Handshaked { remote, tx, rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let id = MessageTypeId::from_name("test.Frame");
        let written = write_frame(&mut a, &id, b"payload", 64).await.unwrap();
        let (got_id, payload, read) = read_frame(&mut b, 64).await.unwrap();
        assert_eq!(got_id, id);
        assert_eq!(payload, b"payload");
        assert_eq!(written, read);
        assert_eq!(written, 4 + 16 + 7);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_on_both_sides() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let id = MessageTypeId::from_name("test.Frame");
        assert!(matches!(
            write_frame(&mut a, &id, &[0u8; 32], 16).await,
            Err(TransportError::MessageTooLarge { size: 32, max: 16 })
        ));

        write_frame(&mut a, &id, &[0u8; 32], 64).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, 16).await,
            Err(TransportError::MessageTooLarge { size: 32, max: 16 })
        ));
    }

    #[tokio::test]
    async fn eof_is_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_frame(&mut b, 64).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn handshake_authenticates_both_sides() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let ka = Keypair::generate();
        let kb = Keypair::generate();
        let sa = ServerIdentity::new(ka.public(), vec!["a".into()]);
        let sb = ServerIdentity::new(kb.public(), vec!["b".into()]);

        let sb_expected = sb.clone();
        let (ra, rb) = tokio::join!(
            handshake(&mut a, &ka, &sa, Some(&sb_expected), 1024),
            handshake(&mut b, &kb, &sb, None, 1024),
        );
        let ra = ra.unwrap();
        let rb = rb.unwrap();
        assert_eq!(ra.remote.id(), sb.id());
        assert_eq!(rb.remote.id(), sa.id());
        assert_eq!(ra.tx, rb.rx);
        assert_eq!(ra.rx, rb.tx);
    }

    #[tokio::test]
    async fn handshake_rejects_unexpected_key() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let ka = Keypair::generate();
        let kb = Keypair::generate();
        let sa = ServerIdentity::new(ka.public(), vec![]);
        let sb = ServerIdentity::new(kb.public(), vec![]);
        let impostor = ServerIdentity::new(Keypair::generate().public(), vec![]);

        // Each side owns its stream so the failing side hangs up on return.
        let (ra, rb) = tokio::join!(
            async move { handshake(&mut a, &ka, &sa, Some(&impostor), 1024).await },
            async move { handshake(&mut b, &kb, &sb, None, 1024).await },
        );
        assert!(matches!(ra, Err(TransportError::Handshake { .. })));
        assert!(rb.is_err());
    }
}
