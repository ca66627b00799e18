use std::fmt::Display;

use speedy::{Readable, Writable};

#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId([u8; 20]);

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<Vec<u8>> for PeerId {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let buff: [u8; 20] = value
            .try_into()
            .map_err(|_| "The PeerId must have exactly 20 bytes")?;
        Ok(PeerId(buff))
    }
}

/// What a worker did with its connection before closing it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Pieces that passed verification and were handed to the scheduler.
    pub pieces: usize,
    /// Pieces that failed the hash check and were requeued.
    pub failed_pieces: usize,
    /// Bytes of verified pieces.
    pub downloaded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_hex() {
        let id = PeerId::from(*b"-RV0001-abcdefghijkl");
        assert_eq!(id.to_string(), hex::encode(b"-RV0001-abcdefghijkl"));
    }

    #[test]
    fn from_vec() {
        assert!(PeerId::try_from(vec![0u8; 19]).is_err());
        assert_eq!(PeerId::try_from(vec![1u8; 20]).unwrap(), PeerId::from([1u8; 20]));
    }
}
