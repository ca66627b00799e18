//! A library for downloading torrents with the BitTorrent protocol V1.
//!
//! This is the library behind `rvt`, a small leecher. It connects to many
//! peers at once, downloads pieces from whoever has them and verifies each
//! piece against the hash in the metainfo before accepting it.
//!
//! The building blocks can be used on their own:
//!
//! * [`tcp_wire`] frames the peer wire protocol, handshake included.
//! * [`peer`] drives one connection, piece after piece.
//! * [`scheduler`] shares the pieces among the peers and assembles the
//!   content.
//! * [`metainfo`] and [`tracker`] find out what to download and from whom.
//!
//! # Example
//!
//! ```no_run
//! use rivulet::{
//!     config::Config, metainfo::MetaInfo, scheduler::Scheduler,
//!     tracker::Tracker,
//! };
//!
//! # async fn run() -> Result<(), rivulet::error::Error> {
//! let meta_info = MetaInfo::from_file("debian.iso.torrent").await?;
//! let config = Config::default();
//! let peer_id = Tracker::gen_peer_id();
//!
//! let tracker = Tracker::new(peer_id.clone(), config.port)?;
//! let peers = tracker
//!     .announce_any(
//!         &meta_info.trackers(),
//!         &meta_info.info_hash(),
//!         meta_info.info.length,
//!     )
//!     .await?
//!     .peers;
//!
//! let content = Scheduler::from_meta_info(&meta_info, peer_id, config)?
//!     .download(peers)
//!     .await?;
//!
//! tokio::fs::write(&meta_info.info.name, content).await?;
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod config;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod scheduler;
pub mod tcp_wire;
pub mod tracker;
