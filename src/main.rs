//! Cairn node binary.

use anyhow::Context;
use cairn::config::CairnConfig;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cairnd", about = "Replicated metadata store node")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = CairnConfig::from_file(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    cairn::run(config).await.context("cairn node failed")?;
    Ok(())
}
