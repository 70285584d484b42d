//! This crate ties in all the parts of the project and provides a command line interface
//! to build the Tiramisu topology and run it on test data.

use env_logger::Builder;
use log::info;
use ml::{
    models::{Tiramisu, TiramisuConfig, TOPOLOGY_FILE_NAME},
    topology,
};
use ndarray_npy::write_npy;
use quicli::prelude::*;
use std::{fs, fs::File, path::PathBuf};
use structopt::StructOpt;
use tiramisu::{
    build_model, image_shape, init_weights, load_test_data, prediction_range, DEFAULT_DATA_PATH,
    DEFAULT_WEIGHTS_PATH,
};

/// Builds the network topology and writes it as JSON
#[derive(Debug, StructOpt)]
struct CreateOpts {
    /// JSON file with architecture parameters, FC-DenseNet67 with 12 classes if not given
    #[structopt(long = "config", parse(from_os_str))]
    config: Option<PathBuf>,
    /// Output path of the topology
    #[structopt(
        short = "o",
        long = "output",
        raw(default_value = "TOPOLOGY_FILE_NAME"),
        parse(from_os_str)
    )]
    output: PathBuf,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Writes freshly initialized weights for a topology
#[derive(Debug, StructOpt)]
struct InitWeightsOpts {
    /// Topology JSON
    #[structopt(
        long = "model",
        raw(default_value = "TOPOLOGY_FILE_NAME"),
        parse(from_os_str)
    )]
    model: PathBuf,
    /// Output path of the npz weight archive
    #[structopt(
        short = "o",
        long = "output",
        raw(default_value = "DEFAULT_WEIGHTS_PATH"),
        parse(from_os_str)
    )]
    output: PathBuf,
    #[structopt(long = "seed", default_value = "0")]
    seed: u64,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Prints the layer table of a topology
#[derive(Debug, StructOpt)]
struct SummaryOpts {
    /// Topology JSON
    #[structopt(
        long = "model",
        raw(default_value = "TOPOLOGY_FILE_NAME"),
        parse(from_os_str)
    )]
    model: PathBuf,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Runs the network on test data
#[derive(Debug, StructOpt)]
struct PredictOpts {
    /// Topology JSON
    #[structopt(
        long = "model",
        raw(default_value = "TOPOLOGY_FILE_NAME"),
        parse(from_os_str)
    )]
    model: PathBuf,
    /// Weights, npz archive or flattened JSON
    #[structopt(
        long = "weights",
        raw(default_value = "DEFAULT_WEIGHTS_PATH"),
        parse(from_os_str)
    )]
    weights: PathBuf,
    /// Test images as npy array (f32, f64 or u8)
    #[structopt(long = "data", raw(default_value = "DEFAULT_DATA_PATH"), parse(from_os_str))]
    data: PathBuf,
    /// Number of images to take from the test data, all complete images if not given
    #[structopt(long = "count")]
    count: Option<usize>,
    /// Writes the predictions to this npy file
    #[structopt(long = "output", parse(from_os_str))]
    output: Option<PathBuf>,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Semantic segmentation with the One Hundred Layers Tiramisu.
#[derive(Debug, StructOpt)]
#[structopt(name = "Tiramisu")]
enum TiramisuCli {
    #[structopt(name = "create", about = "Builds the topology and saves it as JSON.")]
    Create(CreateOpts),
    #[structopt(
        name = "init-weights",
        about = "Writes He-uniform initialized weights for a topology."
    )]
    InitWeights(InitWeightsOpts),
    #[structopt(name = "summary", about = "Prints a summary of the layers of a topology.")]
    Summary(SummaryOpts),
    #[structopt(
        name = "predict",
        about = "Predicts the test data and prints the maximum and minimum of the predictions. \
        Runs on the CPU, a full test set might take a while."
    )]
    Predict(PredictOpts),
}

/// Trait for the subcommands that tiramisu uses
trait TiramisuOpts {
    /// Performs the subcommand
    fn run(&self) -> CliResult;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

impl TiramisuOpts for CreateOpts {
    fn run(&self) -> CliResult {
        let config: TiramisuConfig = match &self.config {
            Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
            None => TiramisuConfig::default(),
        };
        let created = Tiramisu::create(&config)?;
        topology::save(&created.graph, &self.output)?;
        info!("saved topology to {}", self.output.display());
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl TiramisuOpts for InitWeightsOpts {
    fn run(&self) -> CliResult {
        let graph = topology::load(&self.model)?;
        let weights = init_weights(&graph, self.seed);
        if let Some(parent) = self.output.parent() {
            fs::create_dir_all(parent)?;
        }
        weights.write_npz(File::create(&self.output)?)?;
        info!("saved weights to {}", self.output.display());
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl TiramisuOpts for SummaryOpts {
    fn run(&self) -> CliResult {
        let graph = topology::load(&self.model)?;
        println!("{}", graph.summary());
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl TiramisuOpts for PredictOpts {
    fn run(&self) -> CliResult {
        let graph = topology::load(&self.model)?;
        let model = build_model(graph, &self.weights)?;
        info!("\n{}", model.summary());

        let shape = image_shape(model.input_shape())?;
        let data = load_test_data(&self.data, self.count, shape)?;
        let prediction = model.predict(data.view())?;

        if let Some(output) = &self.output {
            write_npy(output, &prediction)?;
            info!("saved predictions to {}", output.display());
        }
        if let Some((max, min)) = prediction_range(&prediction) {
            println!("{} {}", max, min);
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl TiramisuOpts for TiramisuCli {
    fn run(&self) -> CliResult {
        match self {
            TiramisuCli::Create(c) => c.run(),
            TiramisuCli::InitWeights(c) => c.run(),
            TiramisuCli::Summary(c) => c.run(),
            TiramisuCli::Predict(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            TiramisuCli::Create(c) => c.get_verbosity(),
            TiramisuCli::InitWeights(c) => c.get_verbosity(),
            TiramisuCli::Summary(c) => c.get_verbosity(),
            TiramisuCli::Predict(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = TiramisuCli::from_args();
    args.setup_env_logger()?;
    args.run()
}
