use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Block, BlockInfo};
use crate::{bitfield::Bitfield, error::Error};

/// Frames larger than this are refused, a piece message never carries
/// more than one block.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Core messages exchanged after a successful handshake.
/// These are from the vanilla protocol, with no extensions.
#[derive(Debug, Clone, PartialEq)]
pub enum Core {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
}

/// The IDs of the [`Core`] messages.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CoreId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for CoreId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use CoreId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            v => return Err(v),
        })
    }
}

impl Core {
    /// The message id on the wire, keep alives have none.
    pub fn id(&self) -> Option<CoreId> {
        Some(match self {
            Core::KeepAlive => return None,
            Core::Choke => CoreId::Choke,
            Core::Unchoke => CoreId::Unchoke,
            Core::Interested => CoreId::Interested,
            Core::NotInterested => CoreId::NotInterested,
            Core::Have(_) => CoreId::Have,
            Core::Bitfield(_) => CoreId::Bitfield,
            Core::Request(_) => CoreId::Request,
            Core::Piece(_) => CoreId::Piece,
            Core::Cancel(_) => CoreId::Cancel,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CoreCodec;

impl Encoder<Core> for CoreCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Core,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Core::KeepAlive => {
                buf.put_u32(0);
            }
            // <len=0001><id>
            Core::Choke | Core::Unchoke | Core::Interested | Core::NotInterested => {
                buf.put_u32(1);
                // infallible, only keep alives have no id
                buf.put_u8(item.id().map(|id| id as u8).unwrap_or_default());
            }
            // <len=0005><id=4><piece index>
            Core::Have(piece) => {
                buf.put_u32(1 + 4);
                buf.put_u8(CoreId::Have as u8);
                buf.put_u32(piece);
            }
            // <len=0001+X><id=5><bitfield>
            Core::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(CoreId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Core::Request(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(CoreId::Request as u8);
                block_info.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Core::Piece(block) => {
                buf.put_u32(1 + 4 + 4 + block.block.len() as u32);
                buf.put_u8(CoreId::Piece as u8);
                block.encode(buf);
            }
            // <len=0013><id=8><index><begin><length>
            Core::Cancel(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(CoreId::Cancel as u8);
                block_info.encode(buf);
            }
        }
        Ok(())
    }
}

fn expect_len(id: CoreId, payload: &BytesMut, len: usize) -> Result<(), Error> {
    if payload.len() != len {
        return Err(Error::ProtocolFraming(format!(
            "{id:?} payload must have {len} bytes, got {}",
            payload.len()
        )));
    }
    Ok(())
}

fn block_info(payload: &mut BytesMut) -> BlockInfo {
    let index = payload.get_u32();
    let begin = payload.get_u32();
    let len = payload.get_u32();
    BlockInfo { index, begin, len }
}

impl Decoder for CoreCodec {
    type Item = Core;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // the message length header must be present at the minimum,
            // otherwise we can't determine the message type
            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at length prefix without consuming
            let size =
                u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

            if size == 0 {
                buf.advance(4);
                return Ok(Some(Core::KeepAlive));
            }

            if size > MAX_MESSAGE_SIZE {
                return Err(Error::ProtocolFraming(format!(
                    "frame of {size} bytes is too large"
                )));
            }

            // incomplete message, wait until the whole frame arrives without
            // advancing the cursor.
            if buf.len() < 4 + size {
                buf.reserve(4 + size - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let mut payload = buf.split_to(size);
            let msg_id = payload.get_u8();

            let Ok(msg_id) = CoreId::try_from(msg_id) else {
                // unknown message id, the frame is already consumed
                warn!("unknown message_id {msg_id:?}, skipping {size} bytes");
                continue;
            };

            let msg = match msg_id {
                CoreId::Choke => {
                    expect_len(msg_id, &payload, 0)?;
                    Core::Choke
                }
                CoreId::Unchoke => {
                    expect_len(msg_id, &payload, 0)?;
                    Core::Unchoke
                }
                CoreId::Interested => {
                    expect_len(msg_id, &payload, 0)?;
                    Core::Interested
                }
                CoreId::NotInterested => {
                    expect_len(msg_id, &payload, 0)?;
                    Core::NotInterested
                }
                CoreId::Have => {
                    expect_len(msg_id, &payload, 4)?;
                    Core::Have(payload.get_u32())
                }
                CoreId::Bitfield => Core::Bitfield(Bitfield::from_vec(payload.to_vec())),
                CoreId::Request => {
                    expect_len(msg_id, &payload, 12)?;
                    Core::Request(block_info(&mut payload))
                }
                CoreId::Cancel => {
                    expect_len(msg_id, &payload, 12)?;
                    Core::Cancel(block_info(&mut payload))
                }
                CoreId::Piece => {
                    if payload.len() < 8 {
                        return Err(Error::ProtocolFraming(format!(
                            "Piece payload must have at least 8 bytes, got {}",
                            payload.len()
                        )));
                    }
                    let index = payload.get_u32();
                    let begin = payload.get_u32();
                    Core::Piece(Block { index, begin, block: payload.to_vec() })
                }
            };

            return Ok(Some(msg));
        }
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::ProtocolFraming(format!(
                "stream ended in the middle of a frame, {} bytes left",
                buf.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_wire::BLOCK_LEN;
    use bitvec::{bitvec, prelude::Msb0};

    fn encode(msg: Core) -> BytesMut {
        let mut buf = BytesMut::new();
        CoreCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn every_kind_survives_the_wire() {
        let messages = vec![
            Core::Choke,
            Core::Unchoke,
            Core::Interested,
            Core::NotInterested,
            Core::Have(u32::MAX),
            Core::Bitfield(Bitfield::from_vec(vec![0b1010_0000, 1])),
            Core::Bitfield(Bitfield::new()),
            Core::Request(BlockInfo { index: 3, begin: BLOCK_LEN, len: 100 }),
            Core::Piece(Block { index: 1, begin: 2, block: vec![9; 33] }),
            Core::Piece(Block { index: 1, begin: 2, block: vec![] }),
            Core::Cancel(BlockInfo::default()),
        ];

        let mut buf = BytesMut::new();
        for msg in messages.clone() {
            CoreCodec.encode(msg, &mut buf).unwrap();
        }

        for msg in messages {
            assert_eq!(CoreCodec.decode(&mut buf).unwrap(), Some(msg));
        }
        assert!(buf.is_empty());
        assert!(CoreCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn keep_alive() {
        let mut buf = encode(Core::KeepAlive);
        assert_eq!(buf.to_vec(), vec![0, 0, 0, 0]);
        assert_eq!(CoreCodec.decode(&mut buf).unwrap(), Some(Core::KeepAlive));
        assert!(buf.is_empty());
    }

    #[test]
    fn simple_messages_layout() {
        assert_eq!(encode(Core::Interested).to_vec(), vec![0, 0, 0, 1, 2]);
        assert_eq!(encode(Core::Unchoke).to_vec(), vec![0, 0, 0, 1, 1]);
        assert_eq!(
            encode(Core::Have(258)).to_vec(),
            vec![0, 0, 0, 5, 4, 0, 0, 1, 2]
        );
    }

    #[test]
    fn request() {
        let mut buf = encode(Core::Request(BlockInfo::default()));

        // size of buf
        assert_eq!(buf.len(), 17);
        // len
        assert_eq!(buf.get_u32(), 13);
        // id
        assert_eq!(buf.get_u8(), CoreId::Request as u8);
        // index
        assert_eq!(buf.get_u32(), 0);
        // begin
        assert_eq!(buf.get_u32(), 0);
        // len of block
        assert_eq!(buf.get_u32(), BLOCK_LEN);
    }

    #[test]
    fn piece() {
        let mut buf =
            encode(Core::Piece(Block { index: 7, begin: 16, block: vec![1, 2, 3] }));

        assert_eq!(buf.get_u32(), 9 + 3);
        assert_eq!(buf.get_u8(), CoreId::Piece as u8);
        assert_eq!(buf.get_u32(), 7);
        assert_eq!(buf.get_u32(), 16);
        assert_eq!(buf.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn bitfield() {
        let mut original = bitvec![u8, Msb0; 0; 10];
        original.set(8, true);
        original.set(9, true);

        let mut buf = encode(Core::Bitfield(original));

        // len
        assert_eq!(buf.get_u32(), 1 + 2);
        // msg_id
        assert_eq!(buf.get_u8(), CoreId::Bitfield as u8);
        // bitfield, padded to whole bytes
        assert_eq!(buf.to_vec(), vec![0, 0b1100_0000]);
    }

    #[test]
    fn fragmented_piece() {
        let mut codec = CoreCodec;
        let full = encode(Core::Piece(Block {
            index: 0,
            begin: 0,
            block: vec![0xAA; 50_000],
        }));

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&full[..3]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&full[3..15_002]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&full[15_002..]);
        buffer.extend_from_slice(&[0, 0, 0, 0]);
        buffer.extend_from_slice(&[0, 0, 0, 1, 2]);

        match codec.decode(&mut buffer).unwrap().unwrap() {
            Core::Piece(block) => {
                assert_eq!(block.block.len(), 50_000);
                assert!(block.block.iter().all(|&b| b == 0xAA));
            }
            other => panic!("wrong message type {other:?}"),
        }
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(Core::KeepAlive));
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(Core::Interested));
        assert!(buffer.is_empty());
    }

    #[test]
    fn unknown_id_is_skipped() {
        let mut buf = BytesMut::new();
        // port message of the DHT extension: <len=0003><id=9><listen-port>
        buf.extend_from_slice(&[0, 0, 0, 3, 9, 0x1a, 0xe1]);
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);

        assert_eq!(CoreCodec.decode(&mut buf).unwrap(), Some(Core::Unchoke));
        assert!(buf.is_empty());
    }

    #[test]
    fn wrong_payload_len_is_framing_error() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 3, 4, 0, 1]);
        assert!(matches!(
            CoreCodec.decode(&mut buf),
            Err(Error::ProtocolFraming(_))
        ));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 2, 0, 0]);
        assert!(matches!(
            CoreCodec.decode(&mut buf),
            Err(Error::ProtocolFraming(_))
        ));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 5, 7, 0, 0, 0, 0]);
        assert!(matches!(
            CoreCodec.decode(&mut buf),
            Err(Error::ProtocolFraming(_))
        ));
    }

    #[test]
    fn oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_SIZE as u32 + 1);
        buf.put_u8(CoreId::Piece as u8);
        assert!(matches!(
            CoreCodec.decode(&mut buf),
            Err(Error::ProtocolFraming(_))
        ));
    }

    #[test]
    fn eof_in_the_middle_of_a_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 13, 6, 0, 0]);
        assert!(matches!(
            CoreCodec.decode_eof(&mut buf),
            Err(Error::ProtocolFraming(_))
        ));

        let mut buf = BytesMut::new();
        assert!(CoreCodec.decode_eof(&mut buf).unwrap().is_none());
    }
}

// Client connections start out as "choked" and "not interested".
//
// A block is downloaded by the client,
// when the client is interested in a peer,
// and that peer is not choking the client.
//
// c <-handshake-> p
// c <-bitfield- p
// c -interested-> p
// c -unchoke-> p
// c <-unchoke- p
// c <-have- p
// c -request-> p
// ~ download starts here ~
// ~ piece contains a block of data ~
// c <-piece- p

// Have
// <len=0005><id=4><piece index>
// This messages is sent when the peer wishes to announce that they downloaded a
// new piece. This is only sent if the piece's hash verification checked out.

// Bitfield
// <len=0001+X><id=5><bitfield>
// Only ever sent as the first message after the handshake. Byte 0 corresponds
// to indices 0-7, from most significant bit to least significant bit,
// respectively, byte 1 corresponds to indices 8-15, and so on.

// Piece
// <len=0009+X><id=7><index><begin><block>
// `piece` messages are the responses to `request` messages, containing the
// request block's payload. It is possible for an unexpected piece to arrive if
// choke and unchoke messages are sent in quick succession, if transfer is going
// slowly, or both.
