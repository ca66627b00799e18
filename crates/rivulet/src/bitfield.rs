//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
///
/// Byte 0 holds pieces 0-7, from the most significant bit to the least
/// significant bit, byte 1 holds pieces 8-15, and so on.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait PieceBitfield {
    /// A bitfield with `pieces` cleared bits.
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Whether the piece is set. Indices past the backing bytes are simply
    /// not had by the peer.
    fn has_piece(&self, index: usize) -> bool;

    /// Mark the piece as had. Indices past the backing bytes are ignored,
    /// peers may announce pieces that fall in the padding of their bitfield.
    fn set_piece(&mut self, index: usize);
}

impl PieceBitfield for Bitfield {
    fn has_piece(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }

    fn set_piece(&mut self, index: usize) {
        if let Some(mut bit) = self.get_mut(index) {
            *bit = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
        assert_eq!(bitfield.count_ones(), 0);
    }

    #[test]
    fn msb_first() {
        // pieces 0, 1, 7 and 8
        let bitfield = Bitfield::from_vec(vec![0b1100_0001, 0b1000_0000]);

        let had: Vec<usize> = (0..16).filter(|i| bitfield.has_piece(*i)).collect();
        assert_eq!(had, vec![0, 1, 7, 8]);
    }

    #[test]
    fn has_piece_matches_every_bit() {
        let bytes = vec![0b1010_0110, 0xff, 0x00, 0b0000_0001];
        let bitfield = Bitfield::from_vec(bytes.clone());

        for i in 0..bytes.len() * 8 {
            let expected = bytes[i / 8] >> (7 - (i % 8)) & 1 == 1;
            assert_eq!(bitfield.has_piece(i), expected, "bit {i}");
        }
    }

    #[test]
    fn out_of_range_is_not_had() {
        let bitfield = Bitfield::from_vec(vec![0xff, 0xff]);
        assert!(bitfield.has_piece(15));
        assert!(!bitfield.has_piece(16));
        assert!(!bitfield.has_piece(usize::MAX));

        let empty = Bitfield::new();
        assert!(!empty.has_piece(0));
    }

    #[test]
    fn set_piece() {
        let mut bitfield = Bitfield::from_vec(vec![0, 0]);
        bitfield.set_piece(9);
        assert!(bitfield.has_piece(9));
        assert_eq!(bitfield.count_ones(), 1);
        assert_eq!(bitfield.into_vec(), vec![0, 0b0100_0000]);
    }

    #[test]
    fn set_piece_out_of_range_is_ignored() {
        let mut bitfield = Bitfield::from_vec(vec![0]);
        bitfield.set_piece(8);
        bitfield.set_piece(4_000_000_000);
        assert_eq!(bitfield.len(), 8);
        assert_eq!(bitfield.count_ones(), 0);
    }
}
