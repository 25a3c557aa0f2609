use anyhow::Result;
use candle_vaegan::cli::{fit_toy, Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::FitToy(args) => {
            fit_toy::run(args)?;
        }
    }

    Ok(())
}
