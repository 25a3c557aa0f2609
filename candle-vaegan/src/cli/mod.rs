pub mod fit_toy;

use clap::{Parser, Subcommand};

pub use fit_toy::FitToyArgs;

#[derive(Parser)]
#[command(name = "candle-vaegan")]
#[command(about = "Convolutional VAE with chunked ELBO training and KL decomposition")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fit a VAE to simulated blob frames
    FitToy(FitToyArgs),
}
