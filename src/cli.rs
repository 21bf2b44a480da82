use crate::onnx::export::{export, ExportOptions};
use crate::onnx::import::load_network;
use crate::server;
use crate::train::{train, TrainConfig};
use crate::utils::mat::Matrix;
use crate::utils::mnist::{load_digit_image, MnistData};
use crate::utils::network::Network;
use crate::utils::optimizer::Adam;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "digitnet",
    version,
    about = "Train an MNIST digit classifier, export it to ONNX and serve the drawing page.",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// Defaults to `train` when omitted.
    #[command(subcommand)]
    pub command: Option<Command>,
    #[command(flatten)]
    pub train: TrainArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Train on MNIST, then export and validate the ONNX model.
    Train(TrainArgs),
    /// Classify an image with an exported model.
    Predict(PredictArgs),
    /// Serve the drawing page on `GET /`.
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Where MNIST is cached (downloaded into `<dir>/MNIST/raw`).
    #[arg(long, env = "DIGITNET_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,
    #[arg(long, short, env = "DIGITNET_OUTPUT", default_value = "mnist_model.onnx")]
    pub output: PathBuf,
    #[arg(long, default_value_t = 5)]
    pub epochs: usize,
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 100)]
    pub log_interval: usize,
    /// Seeds weight initialization, shuffling and dropout.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl From<&TrainArgs> for TrainConfig {
    fn from(args: &TrainArgs) -> Self {
        Self {
            epochs: args.epochs,
            batch_size: args.batch_size,
            log_interval: args.log_interval,
            seed: args.seed,
        }
    }
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    #[arg(long, short, default_value = "mnist_model.onnx")]
    pub model: PathBuf,
    /// Picture of a single white digit on a dark background.
    pub image: PathBuf,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, env = "DIGITNET_TEMPLATE", default_value = "templates/index.html")]
    pub template: PathBuf,
    #[arg(long, env = "DIGITNET_ADDR", default_value = "127.0.0.1:5000")]
    pub addr: String,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            None => run_train(&self.train),
            Some(Command::Train(args)) => run_train(&args),
            Some(Command::Predict(args)) => run_predict(&args),
            Some(Command::Serve(args)) => run_serve(&args),
        }
    }
}

fn run_train(args: &TrainArgs) -> Result<()> {
    info!("starting training");
    let dataset = MnistData::train(&args.data_dir)?;
    let mut network = Network::digit_classifier(args.seed);
    let config = TrainConfig::from(args);
    let report = train(&mut network, &dataset, &mut Adam::default(), &config)?;
    info!(
        epochs = report.epochs,
        steps = report.steps,
        "training finished"
    );

    info!(output = %args.output.display(), "exporting the model to ONNX");
    let options = ExportOptions {
        seed: args.seed,
        ..Default::default()
    };
    export(&mut network, &args.output, &options)?;
    info!("done");
    Ok(())
}

fn run_predict(args: &PredictArgs) -> Result<()> {
    let mut network = load_network(&args.model)?;
    let pixels = load_digit_image(&args.image)?;
    let log_probs = network.forward(Matrix::from_vec(1, pixels.len(), pixels));
    let digit = network
        .get_result(&log_probs)
        .first()
        .copied()
        .context("the model produced no prediction")?;
    let confidence = log_probs.at(0, digit).exp();
    info!(digit, confidence, "prediction");
    println!("{digit} ({:.1}%)", confidence * 100.0);
    Ok(())
}

fn run_serve(args: &ServeArgs) -> Result<()> {
    let page = server::load_template(&args.template)?;
    let runtime = tokio::runtime::Runtime::new().context("failed to start the tokio runtime")?;
    runtime.block_on(server::serve(page, &args.addr))
}
