mod common;
mod reconstruct;
mod simulate;
mod train_model;

use common::*;
use reconstruct::*;
use simulate::*;
use train_model::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "MUNG",
    long_about = "Model Uncertainty via Neural-network Gaussians\n\
		  Fit a Bayesian autoencoder where every weight carries its own\n\
		  Gaussian posterior, trained by stochastic variational inference.\n\
		  Data files are delimited text (.tsv/.csv), optionally gzipped,\n\
		  one sample per row with values in [0, 1]."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Train a Bayesian autoencoder on a data matrix",
        long_about = "Fit posterior and (optionally) prior weight distributions by\n\
		      minimizing the negative evidence lower bound:\n\
		      (1) Sample weights from the posterior per minibatch\n\
		      (2) Score reconstructions with a Bernoulli likelihood\n\
		      (3) Regularize by the KL divergence from the prior.\n"
    )]
    Train(TrainArgs),

    #[command(
        about = "Reconstruct data with a trained model",
        long_about = "Push data through the fitted network, averaging over\n\
		      posterior weight samples. Can stop early at a hidden layer\n\
		      to expose the latent representation.\n"
    )]
    Reconstruct(ReconstructArgs),

    #[command(
        about = "Simulate a clustered [0, 1] data matrix",
        long_about = "Draw cluster prototypes uniformly in [0, 1], assign rows to\n\
		      clusters, and jitter each row with Gaussian noise.\n\
		      Useful for smoke-testing the training pipeline.\n"
    )]
    Simulate(SimulateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Train(args) => {
            train_bayesian_autoencoder(args)?;
        }
        Commands::Reconstruct(args) => {
            reconstruct_data(args)?;
        }
        Commands::Simulate(args) => {
            simulate_clustered_data(args)?;
        }
    }

    info!("Done");
    Ok(())
}
