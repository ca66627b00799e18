use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tokio::fs::{create_dir_all, read_to_string, write};
use tracing::{debug, warn};

use crate::{error::Error, tcp_wire::BLOCK_LEN};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where downloaded files go when no output path is given.
    pub download_dir: PathBuf,

    /// Port announced to the tracker.
    pub port: u16,

    /// How long to wait for the TCP connection to a peer.
    pub connect_timeout_secs: u64,

    /// How long the peer has to answer our handshake.
    pub handshake_timeout_secs: u64,

    /// Deadline of every read after the handshake. A whole piece, and any
    /// wait for an unchoke or a useful `have`, must also fit in it.
    pub read_timeout_secs: u64,

    /// Maximum number of block requests in flight, per peer.
    pub max_pipeline: usize,

    /// Size of each block request, never larger than [`BLOCK_LEN`].
    pub block_len: u32,

    /// Maximum number of peers to connect to, 0 means all of them.
    pub max_peers: usize,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = UserDirs::new()
            .and_then(|d| d.download_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            download_dir,
            port: 6881,
            connect_timeout_secs: 3,
            handshake_timeout_secs: 3,
            read_timeout_secs: 30,
            max_pipeline: 5,
            block_len: BLOCK_LEN,
            max_peers: 0,
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Block size actually used on requests, clamped to what peers accept.
    pub fn block_len(&self) -> u32 {
        self.block_len.clamp(1, BLOCK_LEN)
    }

    /// Pipeline depth, at least one request must be in flight.
    pub fn max_pipeline(&self) -> usize {
        self.max_pipeline.max(1)
    }

    /// Path of the configuration file, at the user's config folder.
    ///
    /// # Errors
    ///
    /// Fails if the user does not have a home folder.
    pub fn config_path() -> Result<PathBuf, Error> {
        let dotfile = ProjectDirs::from("", "", "Rivulet").ok_or(Error::HomeInvalid)?;
        Ok(dotfile.config_dir().join("config.toml"))
    }

    /// Load the configuration file at the default location.
    ///
    /// If the file does not exist or is not valid toml, it is (re)written
    /// with the default configuration, which is returned.
    pub async fn load() -> Result<Self, Error> {
        let config_path = Self::config_path()?;

        if let Ok(config) = Self::load_from(&config_path).await {
            return Ok(config);
        }

        debug!("writing default configuration to {config_path:?}");

        if let Some(dir) = config_path.parent() {
            create_dir_all(dir).await?;
        }

        let config = Config::default();
        write(&config_path, toml::to_string(&config)?).await?;

        Ok(config)
    }

    /// Load the configuration from an explicit file.
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, Error> {
        let config_str = read_to_string(path.as_ref()).await?;

        toml::from_str::<Config>(&config_str).map_err(|e| {
            warn!("invalid configuration at {:?}: {e}", path.as_ref());
            Error::ConfigDeserializeError
        })
    }
}
