#[cfg(not(unix))]
compile_error!("Only unix platforms are currently supported");

use std::path::PathBuf;

use clap::Parser;
use postern::{Config, Postern, config};
use postern_common::logging;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file; defaults to `$POSTERN_CONFIG`, then
    /// `./postern.config.ron`, then `/etc/postern/postern.config.ron`
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Load and check the configuration, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let path = config::locate(args.config)?;
    let config = Config::load(&path)?;

    if args.check {
        postern::controller::registry(&config.plugins)?;
        println!("{}: OK", path.display());
        return Ok(());
    }

    logging::init();
    Postern::new(config).run().await
}
