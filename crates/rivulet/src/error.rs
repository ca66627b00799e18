use std::io;

use thiserror::Error;

impl From<bendy::decoding::Error> for Error {
    fn from(_value: bendy::decoding::Error) -> Self {
        Self::BencodeError
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(_value: bendy::encoding::Error) -> Self {
        Self::BencodeError
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("Could not connect to the peer in time")]
    ConnectTimeout,

    #[error("The peer took to long to send the handshake")]
    HandshakeTimeout,

    #[error("The message took to long to arrive")]
    MessageTimeout,

    #[error("The piece {0} took too long to arrive")]
    PieceTimeout(usize),

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("The handshake received does not speak the BitTorrent protocol")]
    HandshakeMismatch,

    #[error("The peer does not have the torrent we asked for")]
    ContentMismatch,

    #[error("Malformed message from peer: {0}")]
    ProtocolFraming(String),

    #[error("The download was stopped")]
    Cancelled,

    #[error("The piece {0} downloaded does not have a valid hash")]
    PieceInvalid(usize),

    #[error(
        "No peer is able to finish the download, {} pieces are missing: \
         {remaining:?}",
        remaining.len()
    )]
    IncompleteDownload { remaining: Vec<usize> },

    #[error("The piece descriptors do not describe the torrent: {0}")]
    InvalidPieces(String),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("Failed to decode or encode the bencode buffer")]
    BencodeError,

    #[error("The torrent file is not valid: {0}")]
    MetaInfoInvalid(String),

    #[error("The tracker answered with a failure: {0}")]
    Tracker(String),

    #[error("None of the trackers answered with peers")]
    TrackerNoPeers,

    #[error("The peer list returned by the announce request is not valid")]
    TrackerCompactPeerList,

    #[error("HTTP request to the tracker failed")]
    Http(#[from] reqwest::Error),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format"
    )]
    ConfigDeserializeError,

    #[error("Could not serialize the configuration")]
    ConfigSerializeError(#[from] toml::ser::Error),
}

impl Error {
    /// Dial, read, write and timeout failures. The affected peer is dropped
    /// but the download goes on with the others.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            Error::IO(_)
                | Error::ConnectTimeout
                | Error::HandshakeTimeout
                | Error::MessageTimeout
                | Error::PieceTimeout(_)
                | Error::PeerClosedSocket
        )
    }
}
