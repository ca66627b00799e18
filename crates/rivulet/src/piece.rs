//! Pieces of a torrent: what the scheduler hands out, what workers hand back,
//! and how a piece is proven to be the one described by the metainfo.

use crate::error::Error;

/// A piece to be downloaded, straight from the metainfo. Also the unit of
/// work handed out by the scheduler: whoever holds the descriptor is the only
/// one allowed to download that piece.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PieceDescriptor {
    /// 0-based index of the piece, dense and contiguous.
    pub index: usize,
    /// SHA-1 of the piece bytes.
    pub hash: [u8; 20],
    /// Length of this piece. Every piece has the nominal piece length, except
    /// for the last one which might be shorter.
    pub length: u32,
}

/// A downloaded piece that passed [`verify`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPiece {
    pub index: usize,
    pub data: Vec<u8>,
}

impl CompletedPiece {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// SHA-1 of `buf`.
pub fn hash(buf: &[u8]) -> [u8; 20] {
    let mut hash = sha1_smol::Sha1::new();
    hash.update(buf);
    hash.digest().bytes()
}

/// If the assembled bytes of a piece hash to the expected value.
pub fn verify(assembled: &[u8], expected: &[u8; 20]) -> bool {
    hash(assembled) == *expected
}

/// Length of the piece `index` of a torrent with `count` pieces.
///
/// The last piece takes the remainder: `total - piece_length * (count - 1)`.
pub fn piece_len(index: usize, count: usize, piece_length: u32, total: u64) -> u32 {
    if index + 1 == count {
        (total - piece_length as u64 * (count as u64 - 1)) as u32
    } else {
        piece_length
    }
}

/// Build one [`PieceDescriptor`] per hash, with the length of the last piece
/// computed from the torrent length.
pub fn descriptors(
    hashes: &[[u8; 20]],
    piece_length: u32,
    total: u64,
) -> Result<Vec<PieceDescriptor>, Error> {
    if piece_length == 0 {
        return Err(Error::InvalidPieces("piece length is zero".into()));
    }

    let expected = total.div_ceil(piece_length as u64);
    if expected != hashes.len() as u64 {
        return Err(Error::InvalidPieces(format!(
            "{} bytes in pieces of {piece_length} need {expected} hashes, got {}",
            total,
            hashes.len()
        )));
    }

    let count = hashes.len();
    Ok(hashes
        .iter()
        .enumerate()
        .map(|(index, hash)| PieceDescriptor {
            index,
            hash: *hash,
            length: piece_len(index, count, piece_length, total),
        })
        .collect())
}

/// Check that a list of descriptors covers exactly `total` bytes in dense,
/// in-order pieces of `piece_length`, with only the last one allowed to be
/// shorter.
pub fn validate(
    pieces: &[PieceDescriptor],
    piece_length: u32,
    total: u64,
) -> Result<(), Error> {
    let count = pieces.len();
    let mut sum = 0u64;

    for (i, piece) in pieces.iter().enumerate() {
        if piece.index != i {
            return Err(Error::InvalidPieces(format!(
                "piece at position {i} has index {}",
                piece.index
            )));
        }
        let is_last = i + 1 == count;
        if piece.length == 0
            || piece.length > piece_length
            || (!is_last && piece.length != piece_length)
        {
            return Err(Error::InvalidPieces(format!(
                "piece {i} has length {} with a piece length of {piece_length}",
                piece.length
            )));
        }
        sum += piece.length as u64;
    }

    if sum != total {
        return Err(Error::InvalidPieces(format!(
            "pieces add up to {sum} bytes instead of {total}"
        )));
    }

    Ok(())
}
