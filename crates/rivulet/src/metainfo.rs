//! Metainfo is a .torrent file with information about the torrent: where to
//! announce, how the file is split into pieces, and the hash of each piece.

use std::{fmt::Display, ops::Deref, path::Path};

use bendy::decoding::{self, Decoder, FromBencode, Object, ResultExt};
use speedy::{Readable, Writable};

use crate::{
    error::Error,
    piece::{self, PieceDescriptor},
};

/// SHA-1 of the bencoded info dictionary, identifies the torrent on the
/// wire and on the tracker.
#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s)
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub created_by: Option<String>,
    pub creation_date: Option<u64>,
    pub comment: Option<String>,
    pub info: Info,
}

/// File related information, single-file format only.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// Name of the file.
    pub name: String,

    /// Length in bytes of each piece, the last piece may be shorter.
    pub piece_length: u32,

    /// Concatenation of all 20-byte SHA-1 hashes, one per piece.
    pub pieces: Vec<u8>,

    /// Size of the file in bytes.
    pub length: u64,

    // computed from the raw dictionary, not part of the torrent.
    pub info_hash: InfoHash,
}

impl MetaInfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        Self::from_bencode(buf).map_err(|e| Error::MetaInfoInvalid(e.to_string()))
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let buf = tokio::fs::read(path).await?;
        Self::from_bytes(&buf)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info.info_hash.clone()
    }

    /// Every tracker url, `announce-list` tiers in order, or `announce`
    /// alone when there is no list.
    pub fn trackers(&self) -> Vec<String> {
        match &self.announce_list {
            Some(list) if list.iter().any(|tier| !tier.is_empty()) => {
                list.iter().flatten().cloned().collect()
            }
            _ => vec![self.announce.clone()],
        }
    }

    /// Split `pieces` into the hash of each piece.
    pub fn piece_hashes(&self) -> Result<Vec<[u8; 20]>, Error> {
        let info = &self.info;

        if info.piece_length == 0 {
            return Err(Error::MetaInfoInvalid("piece length is zero".into()));
        }
        if info.pieces.len() % 20 != 0 {
            return Err(Error::MetaInfoInvalid(format!(
                "pieces has {} bytes, not a multiple of 20",
                info.pieces.len()
            )));
        }

        let hashes: Vec<[u8; 20]> = info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected = info.length.div_ceil(info.piece_length as u64);
        if hashes.len() as u64 != expected {
            return Err(Error::MetaInfoInvalid(format!(
                "{} hashes for {expected} pieces",
                hashes.len()
            )));
        }

        Ok(hashes)
    }

    /// The pieces of the torrent, ready to be handed to the scheduler.
    pub fn descriptors(&self) -> Result<Vec<PieceDescriptor>, Error> {
        piece::descriptors(
            &self.piece_hashes()?,
            self.info.piece_length,
            self.info.length,
        )
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut announce_list = None;
        let mut created_by = None;
        let mut creation_date = None;
        let mut comment = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                (b"announce-list", value) => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce_list")
                        .map(Some)?;
                }
                (b"created by", value) => {
                    created_by = String::decode_bencode_object(value)
                        .context("created_by")
                        .map(Some)?;
                }
                (b"creation date", value) => {
                    creation_date = u64::decode_bencode_object(value)
                        .context("creation_date")
                        .map(Some)?;
                }
                (b"comment", value) => {
                    comment = String::decode_bencode_object(value)
                        .context("comment")
                        .map(Some)?;
                }
                (b"info", value) => {
                    info = Info::decode_bencode_object(value)
                        .context("info")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let announce = announce
            .ok_or_else(|| decoding::Error::missing_field("announce"))?;
        let info =
            info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo {
            announce,
            announce_list,
            created_by,
            creation_date,
            comment,
            info,
        })
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut files = false;
        let mut length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;

        let bytes = object.try_into_dictionary()?.into_raw()?;
        let info_hash = InfoHash(piece::hash(bytes));

        let mut decoder = Decoder::new(bytes);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| decoding::Error::missing_field("info"))?
            .try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"files", _) => files = true,
                (b"length", value) => {
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = u32::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = value
                        .try_into_bytes()
                        .context("pieces")
                        .map(|bytes| Some(bytes.to_vec()))?;
                }
                _ => {}
            }
        }

        if files {
            return Err(decoding::Error::unexpected_field("files"));
        }

        let name =
            name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let length =
            length.ok_or_else(|| decoding::Error::missing_field("length"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece_length"))?;
        let pieces =
            pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        Ok(Info { name, piece_length, pieces, length, info_hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bencode a single-file torrent by hand.
    fn torrent(info: &[u8], extra: &[u8]) -> Vec<u8> {
        let mut buf = b"d8:announce28:http://tracker.test/announce".to_vec();
        buf.extend_from_slice(extra);
        buf.extend_from_slice(b"4:info");
        buf.extend_from_slice(info);
        buf.push(b'e');
        buf
    }

    fn info(length: u64, piece_length: u32, pieces: &[u8]) -> Vec<u8> {
        let mut buf = format!(
            "d6:lengthi{length}e4:name8:file.bin12:piece lengthi{piece_length}e6:pieces{}:",
            pieces.len()
        )
        .into_bytes();
        buf.extend_from_slice(pieces);
        buf.push(b'e');
        buf
    }

    #[test]
    fn decode_single_file() {
        let mut pieces = vec![1u8; 20];
        pieces.extend_from_slice(&[2u8; 20]);
        let info = info(6, 4, &pieces);
        let buf = torrent(
            &info,
            b"7:comment2:hi10:created by3:rvt13:creation datei1700000000e",
        );

        let meta = MetaInfo::from_bytes(&buf).unwrap();

        assert_eq!(meta.announce, "http://tracker.test/announce");
        assert_eq!(meta.comment.as_deref(), Some("hi"));
        assert_eq!(meta.created_by.as_deref(), Some("rvt"));
        assert_eq!(meta.creation_date, Some(1_700_000_000));
        assert_eq!(meta.info.name, "file.bin");
        assert_eq!(meta.info.length, 6);
        assert_eq!(meta.info.piece_length, 4);
        assert_eq!(meta.trackers(), vec!["http://tracker.test/announce".to_owned()]);

        // the hash is computed over the exact info bytes
        assert_eq!(meta.info_hash().0, piece::hash(&info));

        let pieces = meta.descriptors().unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0], PieceDescriptor { index: 0, hash: [1u8; 20], length: 4 });
        assert_eq!(pieces[1], PieceDescriptor { index: 1, hash: [2u8; 20], length: 2 });
    }

    #[test]
    fn announce_list_in_order() {
        let info = info(4, 4, &[0u8; 20]);
        let buf = torrent(
            &info,
            b"13:announce-listll11:http://a/aneel10:http://b/a10:http://c/aee",
        );

        let meta = MetaInfo::from_bytes(&buf).unwrap();
        assert_eq!(meta.trackers(), vec!["http://a/an", "http://b/a", "http://c/a"]);
    }

    #[test]
    fn multi_file_is_rejected() {
        let mut info = b"d5:filesld6:lengthi3e4:pathl1:aeee4:name3:dir".to_vec();
        info.extend_from_slice(b"12:piece lengthi4e6:pieces20:aaaaaaaaaaaaaaaaaaaae");
        let buf = torrent(&info, b"");

        assert!(matches!(MetaInfo::from_bytes(&buf), Err(Error::MetaInfoInvalid(_))));
    }

    #[test]
    fn piece_hashes_must_match_length() {
        let buf = torrent(&info(9, 4, &[0u8; 40]), b"");
        let meta = MetaInfo::from_bytes(&buf).unwrap();
        assert!(matches!(meta.piece_hashes(), Err(Error::MetaInfoInvalid(_))));

        let buf = torrent(&info(4, 4, &[0u8; 21]), b"");
        let meta = MetaInfo::from_bytes(&buf).unwrap();
        assert!(matches!(meta.piece_hashes(), Err(Error::MetaInfoInvalid(_))));

        let buf = torrent(&info(4, 0, &[0u8; 20]), b"");
        let meta = MetaInfo::from_bytes(&buf).unwrap();
        assert!(matches!(meta.descriptors(), Err(Error::MetaInfoInvalid(_))));
    }

    #[test]
    fn missing_announce() {
        let mut buf = b"d4:info".to_vec();
        buf.extend_from_slice(&info(4, 4, &[0u8; 20]));
        buf.push(b'e');
        assert!(matches!(MetaInfo::from_bytes(&buf), Err(Error::MetaInfoInvalid(_))));
    }
}
