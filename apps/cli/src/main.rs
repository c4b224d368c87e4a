//! SliceUp command line uploader.
//!
//! ```text
//! sliceup <FILE> [--config <PATH>] [--upload-url <URL>] [--merge-url <URL>]
//! ```

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Upload a file in resumable chunks
#[derive(Debug, Parser, PartialEq)]
#[command(name = "sliceup")]
#[command(version, about, long_about = None)]
struct Args {
    /// File to upload
    file: PathBuf,

    /// Configuration file (defaults to the platform config path)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Chunk upload endpoint, overrides `upload.upload_url`
    #[arg(long)]
    upload_url: Option<String>,

    /// Merge endpoint, overrides `upload.merge_url`
    #[arg(long)]
    merge_url: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), ?args, "starting sliceup");

    let mut config = config::Config::load(args.config.as_deref())?;
    if let Some(url) = args.upload_url {
        config.upload.upload_url = Some(url);
    }
    if let Some(url) = args.merge_url {
        config.upload.merge_url = Some(url);
    }
    config.upload.validate()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, &args.file))
}
