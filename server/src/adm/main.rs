mod command;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use command::generate_key::{self, GenerateKey};
use command::test_chunking::{self, TestChunking};

/// granary server administration utilities.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
pub struct Opts {
    /// Path to the config file.
    ///
    /// Only needed by sub-commands that read the server configuration.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// The sub-command.
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    GenerateKey(GenerateKey),
    TestChunking(TestChunking),
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    match &opts.command {
        Command::GenerateKey(sub) => generate_key::run(sub).await,
        Command::TestChunking(sub) => test_chunking::run(sub, opts.config.as_deref()).await,
    }
}
