mod cli;
mod fetch;

use clap::Parser;
use cli::{Cli, Commands, ConfigArgs};
use eyre::Result;
use fetchtree_core::config::{self, CONFIG_FILE_NAME};
use fetchtree_core::FetchConfig;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(dir) = &cli.config_dir {
        config::set_config_dir(dir);
    }

    let loaded = match &cli.config {
        Some(path) => FetchConfig::load(path)?,
        None => FetchConfig::load_default()?,
    };

    match &cli.command {
        Commands::Fetch(args) => fetch::run_fetch(loaded, args)?,
        Commands::Config(args) => run_config(&loaded, args)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_config(loaded: &FetchConfig, args: &ConfigArgs) -> Result<()> {
    if args.path {
        println!("{}", config::config_dir()?.join(CONFIG_FILE_NAME).display());
    } else {
        print!("{}", loaded.to_toml_string()?);
    }
    Ok(())
}
