//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Moreover, handshakes may only
//! be sent once at the beginning of a connection, preceding all other
//! messages. Thus, after receiving and sending a handshake the codec
//! is switched to [`CoreCodec`], taking care not to discard the underlying
//! receive and send buffers.

use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use speedy::{BigEndian, Readable, Writable};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, FramedParts};
use tracing::{debug, warn};

use super::{CoreCodec, PSTR};
use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

/// Size of a handshake on the wire.
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        // we should only be sending the bittorrent protocol string
        debug_assert_eq!(handshake.pstr, PSTR);

        buf.extend_from_slice(&handshake.serialize()?);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        // the reply always has the size of ours, even when the peer speaks
        // something else, validation happens after the whole frame is read.
        if buf.len() < HANDSHAKE_LEN {
            buf.reserve(HANDSHAKE_LEN - buf.len());
            return Ok(None);
        }

        let handshake = Handshake::deserialize(&buf[..HANDSHAKE_LEN])?;
        buf.advance(HANDSHAKE_LEN);

        Ok(Some(handshake))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        match self.decode(buf)? {
            Some(handshake) => Ok(Some(handshake)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::PeerClosedSocket),
        }
    }
}

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// (`BitTorrent protocol`) or the info hash differs from ours, the connection
/// is severed. The reserved field is 8 zero bytes, we don't support any
/// extension. The peer id is usually the client name and version.
#[derive(Clone, Debug, PartialEq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: impl Into<[u8; 20]>, peer_id: impl Into<[u8; 20]>) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: [0u8; 8],
            info_hash: InfoHash(info_hash.into()),
            peer_id: PeerId::from(peer_id.into()),
        }
    }

    pub fn serialize(&self) -> Result<[u8; HANDSHAKE_LEN], Error> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;

        buf.copy_from_slice(&temp[..]);

        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }

    /// Validate `self`, the handshake of the remote peer, against ours.
    pub fn validate(&self, ours: &Self) -> Result<(), Error> {
        if self.pstr_len as usize != PSTR.len() {
            warn!("! handshake with wrong pstr_len, dropping connection");
            return Err(Error::HandshakeMismatch);
        }
        if self.pstr != PSTR {
            warn!("! handshake with wrong pstr, dropping connection");
            return Err(Error::HandshakeMismatch);
        }
        if self.info_hash != ours.info_hash {
            warn!("! info_hash from receiving handshake does not match ours");
            return Err(Error::ContentMismatch);
        }
        Ok(())
    }
}

/// Send our handshake, read and validate the reply, and switch the socket to
/// the [`CoreCodec`]. Bytes that arrived right after the handshake (usually
/// the bitfield) are kept in the read buffer of the returned socket.
///
/// The caller is responsible for bounding this with a timeout.
pub async fn perform_handshake<S>(
    socket: S,
    local_peer_id: PeerId,
    info_hash: InfoHash,
) -> Result<(Framed<S, CoreCodec>, Handshake), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut socket = Framed::new(socket, HandshakeCodec);
    let ours = Handshake::new(info_hash, local_peer_id);

    socket.send(ours.clone()).await?;

    let Some(theirs) = socket.next().await else {
        debug!("peer closed the socket before the handshake");
        return Err(Error::PeerClosedSocket);
    };
    let theirs = theirs?;
    theirs.validate(&ours)?;

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, CoreCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;

    Ok((Framed::from_parts(new_parts), theirs))
}
