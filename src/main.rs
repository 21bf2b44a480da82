use crate::cli::Cli;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

pub mod cli;
pub mod onnx;
pub mod server;
pub mod train;
pub mod utils;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("digitnet=info"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    Cli::parse().run()
}
