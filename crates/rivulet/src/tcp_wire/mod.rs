//! Documentation of the "TCP Wire" protocol between Peers in the network.
//! Peers will follow this protocol to exchange pieces of a torrent.
//!
//! A connection starts with a [`handshake`] of fixed size, after that every
//! message is framed by the [`codec`]: a 4 byte big-endian length, one byte
//! for the message id and the payload.
pub mod codec;
pub mod handshake;

use bytes::{BufMut, BytesMut};

pub use codec::{Core, CoreCodec, CoreId};
pub use handshake::{perform_handshake, Handshake, HandshakeCodec};

/// The default block_len that most clients support, some clients drop
/// the connection on blocks larger than this value.
///
/// Tha last block of a piece might be smaller.
pub const BLOCK_LEN: u32 = 16384;

/// Protocol String
/// String identifier of the string "BitTorrent protocol", in bytes.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// A Block is a subset of a Piece,
/// pieces are subsets of the entire Torrent data.
///
/// When peers send data (seed) to us, they send us Blocks.
/// This happens on the "Piece" message of the peer wire protocol.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's data. 16 KiB most of the times,
    /// but the last block of a piece *might* be smaller.
    pub block: Vec<u8>,
}

impl Block {
    /// Encodes the block in the network binary protocol's format into the
    /// given buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.extend_from_slice(&self.block);
    }

    /// Offset one past the last byte of this block inside its piece.
    pub fn end(&self) -> u64 {
        self.begin as u64 + self.block.len() as u64
    }
}

/// The representation of a [`Block`].
///
/// When we ask a peer to give us a [`Block`], we send this struct,
/// using the "Request" message of the tcp wire protocol.
///
/// This is almost identical to the [`Block`] struct,
/// the only difference is that instead of having a `block`,
/// we have a `len` representing the len of the block.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes. <= 16 KiB
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl From<&Block> for BlockInfo {
    fn from(val: &Block) -> Self {
        BlockInfo {
            index: val.index,
            begin: val.begin,
            len: val.block.len() as u32,
        }
    }
}

impl BlockInfo {
    /// Encodes the block info in the network binary protocol's format into the
    /// given buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }

    /// Like most clients, we never ask for more than 16 KiB in one request.
    pub fn is_valid(&self) -> bool {
        self.len <= BLOCK_LEN && self.len > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pstr() {
        assert_eq!(
            PSTR,
            [
                66, 105, 116, 84, 111, 114, 114, 101, 110, 116, 32, 112, 114,
                111, 116, 111, 99, 111, 108
            ]
        );
    }

    #[test]
    fn block_info_validity() {
        assert!(BlockInfo::default().is_valid());
        assert!(BlockInfo { index: 3, begin: 0, len: 1 }.is_valid());
        assert!(!BlockInfo { index: 0, begin: 0, len: 0 }.is_valid());
        assert!(!BlockInfo { index: 0, begin: 0, len: BLOCK_LEN + 1 }.is_valid());
    }

    #[test]
    fn block_end() {
        let block = Block { index: 0, begin: BLOCK_LEN, block: vec![0; 10] };
        assert_eq!(block.end(), BLOCK_LEN as u64 + 10);
        assert_eq!(BlockInfo::from(&block).len, 10);
    }
}
