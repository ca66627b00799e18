use clap::Parser;
use rivulet::{
    config::Config, error::Error, metainfo::MetaInfo, scheduler::Scheduler,
    tracker::Tracker,
};
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::FmtSubscriber;

use args::Args;
mod args;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    let _guard = init_logging(&args);

    let mut config = match &args.config {
        Some(path) => Config::load_from(path).await?,
        None => Config::load().await?,
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(max_peers) = args.max_peers {
        config.max_peers = max_peers;
    }

    let meta_info = MetaInfo::from_file(&args.torrent).await?;
    info!(
        "{} with {} bytes, info hash {}",
        meta_info.info.name,
        meta_info.info.length,
        meta_info.info_hash()
    );

    let peer_id = Tracker::gen_peer_id();

    let peers = if args.peers.is_empty() {
        Tracker::new(peer_id.clone(), config.port)?
            .announce_any(
                &meta_info.trackers(),
                &meta_info.info_hash(),
                meta_info.info.length,
            )
            .await?
            .peers
    } else {
        args.peers.clone()
    };

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| config.download_dir.join(&meta_info.info.name));

    let content = Scheduler::from_meta_info(&meta_info, peer_id, config)?
        .download(peers)
        .await?;

    tokio::fs::write(&output, content).await?;
    info!("saved to {output:?}");

    Ok(())
}

/// Logs go to stdout, or to the log file when one is given. The returned
/// guard flushes the file when dropped.
fn init_logging(args: &Args) -> Option<WorkerGuard> {
    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let (r, guard) = match &args.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path.file_name().unwrap_or(path.as_os_str());
            let appender = tracing_appender::rolling::never(
                dir.unwrap_or(std::path::Path::new(".")),
                file_name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(writer)
                .finish();

            (tracing::subscriber::set_global_default(subscriber), Some(guard))
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .without_time()
                .finish();

            (tracing::subscriber::set_global_default(subscriber), None)
        }
    };

    if let Err(e) = r {
        eprintln!("setting default subscriber failed: {e}");
    }

    guard
}
