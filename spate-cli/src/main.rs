use std::{fs, path::PathBuf};

use anyhow::Context;
use clap::Parser;

use spate::{conf::Conf, engine, metainfo::Metainfo};

/// A small BitTorrent client: downloads the given torrent into the current
/// directory, seeding while it goes, and exits once the download is
/// complete and verified.
#[derive(Parser)]
#[command(name = "spate", version, about)]
struct Args {
    /// Path to the .torrent file.
    torrent: PathBuf,

    /// Write trace level logging to the given file.
    #[arg(short = 't', long = "trace", value_name = "PATH")]
    trace: Option<PathBuf>,
}

/// Logging goes to stderr, controlled by `RUST_LOG` as usual; `-t` instead
/// sends everything, at trace level, to a file.
fn init_logging(trace: Option<&PathBuf>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = trace {
        let file = fs::File::create(path).with_context(|| {
            format!("can't create trace log file {}", path.display())
        })?;
        builder
            .filter_level(log::LevelFilter::Trace)
            .target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.trace.as_ref())?;

    let buf = fs::read(&args.torrent).with_context(|| {
        format!("can't read torrent file {}", args.torrent.display())
    })?;
    let metainfo =
        Metainfo::from_bytes(&buf).context("invalid torrent file")?;

    let download_dir =
        std::env::current_dir().context("can't read current directory")?;
    engine::download(Conf::new(download_dir), metainfo)
        .await
        .context("download failed")?;

    log::info!("Download complete, exiting");
    Ok(())
}
