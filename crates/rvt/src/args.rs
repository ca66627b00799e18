use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[clap(
    name = "rvt",
    author,
    version,
    about = "Download a torrent from its peers",
    long_about = None
)]
pub struct Args {
    /// Path of the .torrent file.
    pub torrent: PathBuf,

    /// Where to write the downloaded file, defaults to the download
    /// directory of the configuration.
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// Configuration file to use instead of the one in the config folder.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Download from this peer instead of asking the trackers, may be
    /// repeated.
    #[clap(short, long = "peer")]
    pub peers: Vec<SocketAddr>,

    /// Port announced to the trackers.
    #[clap(long)]
    pub port: Option<u16>,

    /// Connect to at most this many peers.
    #[clap(long)]
    pub max_peers: Option<usize>,

    /// More logs, -v for debug and -vv for trace.
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write the logs to this file instead of stdout.
    #[clap(long)]
    pub log_file: Option<PathBuf>,
}
