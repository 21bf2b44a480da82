use crate::utils::dataloader::DataLoader;
use crate::utils::network::Network;
use crate::utils::nn_trait::{DataSet, Optimizer};
use anyhow::{ensure, Result};
use tracing::info;

pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Report the loss every this many batches.
    pub log_interval: usize,
    /// Seeds the shuffle of every pass.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            batch_size: 64,
            log_interval: 100,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub epochs: usize,
    pub steps: usize,
    /// Loss of the last batch, `None` when no step was taken.
    pub last_loss: Option<f32>,
}

/// Mini-batch training: zero the gradients, forward, loss, backward and one
/// optimizer step per batch, reshuffling the dataset on every pass.
pub fn train<T, O>(
    network: &mut Network,
    dataset: &T,
    optimizer: &mut O,
    config: &TrainConfig,
) -> Result<TrainReport>
where
    T: DataSet,
    O: Optimizer,
{
    ensure!(config.batch_size > 0, "batch size must be positive");
    ensure!(config.log_interval > 0, "log interval must be positive");
    ensure!(
        dataset.dim() == network.input_shape().len(),
        "samples have {} values, the network expects {}",
        dataset.dim(),
        network.input_shape().len()
    );

    network.set_training(true);
    let mut report = TrainReport {
        epochs: 0,
        steps: 0,
        last_loss: None,
    };
    for epoch in 0..config.epochs {
        let seed = config.seed.wrapping_add(epoch as u64);
        let loader = DataLoader::new(dataset, config.batch_size, seed);
        for (batch_idx, batch) in loader.enumerate() {
            network.zero_grad();
            let pred = network.forward(batch.images);
            let loss = network.calc_loss(&pred, &batch.labels);
            network.backward();
            optimizer.step(network.parameters());

            if batch_idx % config.log_interval == 0 {
                info!(
                    "Epoch: {} [{}/{}]\tLoss: {:.6}",
                    epoch,
                    batch_idx * batch.labels.len(),
                    dataset.len(),
                    loss
                );
            }
            report.steps += 1;
            report.last_loss = Some(loss);
        }
        report.epochs += 1;
    }
    Ok(report)
}
