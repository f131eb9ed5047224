use clap::{Args, Parser, Subcommand};
use fetchtree_core::ChecksumType;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fetchtree")]
#[command(about = "Walk a remote FTP tree and download every file in parallel chunks")]
#[command(after_help = "Run '<command> --help' for detailed options on each command.")]
pub struct Cli {
    /// Override the configuration directory for this invocation
    #[arg(long, global = true, value_name = "PATH")]
    pub config_dir: Option<PathBuf>,
    /// Read settings from this file instead of the default config
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download a remote tree (or a single file) into a local directory
    Fetch(FetchArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
pub struct FetchArgs {
    /// ftp://[user[:password]@]host[:port]/path, file:///path or a local path
    pub source: String,
    /// Local directory the tree is written into
    pub destination: PathBuf,
    /// Total walker + coordinator threads (split evenly between the two)
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,
    /// Chunk span in bytes
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<u64>,
    /// Chunk threads per coordinator
    #[arg(long, value_name = "N")]
    pub chunk_workers: Option<usize>,
    /// In-place retries for transient chunk errors (0-255)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u8))]
    pub retries: Option<u8>,
    /// Seconds between completion polls
    #[arg(long, value_name = "SECS")]
    pub wait_interval: Option<u64>,
    /// Connect/read deadline for FTP connections (none by default)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
    /// Part entity tag algorithm: blake3, xxh3 or md5
    #[arg(long, value_name = "ALG")]
    pub entity_tag: Option<ChecksumType>,
    /// Show an interactive progress indicator
    #[arg(long, short = 'p')]
    pub progress: bool,
    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Clone, Debug, Default)]
pub struct ConfigArgs {
    /// Print the path of the default config file instead
    #[arg(long)]
    pub path: bool,
}
