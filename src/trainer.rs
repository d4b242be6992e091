//! Training loop.
//!
//! Drives [`SpatialGcn::training_step`] over ready-made batches with the
//! optimizer from [`SpatialGcn::configure_optimizers`], reporting the RMSE
//! under the `loss` metric key.

use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use serde::Serialize;
use spatial_gcn_model::{GridShape, Optimizer, SpatialGcn};
use tracing::info;

use crate::data::Batch;
use crate::Config;

/// Mean training RMSE of one epoch.
#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub mean_loss: f32,
    pub steps: usize,
}

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    pub epochs: Vec<EpochSummary>,
    pub total_steps: usize,
}

impl FitReport {
    /// Mean RMSE of the last epoch, if any epoch ran.
    pub fn final_loss(&self) -> Option<f32> {
        self.epochs.last().map(|e| e.mean_loss)
    }
}

/// Sequential epoch loop with a single optimizer.
#[derive(Debug, Clone)]
pub struct Trainer {
    epochs: usize,
    log_every: usize,
}

impl Trainer {
    pub fn new(epochs: usize, log_every: usize) -> Self {
        Self {
            epochs,
            log_every: log_every.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.epochs, config.log_every)
    }

    /// Train `model` on `batches` for the configured number of epochs.
    ///
    /// The model is switched to training mode for the duration and left in
    /// evaluation mode afterwards. A failing step aborts training; parameters
    /// updated by earlier steps are kept.
    pub fn fit(&self, model: &mut SpatialGcn, batches: &[Batch]) -> Result<FitReport> {
        if batches.is_empty() {
            bail!("No batches to train on");
        }

        model.train();
        let mut optimizer = model
            .configure_optimizers()
            .context("Failed to build optimizer")?;

        let mut epochs = Vec::with_capacity(self.epochs);
        let mut global_step = 0;

        for epoch in 0..self.epochs {
            let mut loss_sum = 0.0;
            for (index, batch) in batches.iter().enumerate() {
                let step = model
                    .training_step(&batch.x, &batch.y_mean)
                    .with_context(|| format!("Training step failed on batch {index}"))?;
                optimizer.backward_step(&step.loss)?;

                global_step += 1;
                loss_sum += step.rmse;
                if global_step % self.log_every == 0 {
                    info!(metric = "loss", value = step.rmse, epoch, step = global_step);
                }
            }

            let mean_loss = loss_sum / batches.len() as f32;
            info!(epoch, mean_loss, "Epoch complete");
            epochs.push(EpochSummary {
                epoch,
                mean_loss,
                steps: batches.len(),
            });
        }

        model.eval();
        Ok(FitReport {
            epochs,
            total_steps: global_step,
        })
    }
}

/// Per-node predictions in evaluation mode, optionally restricted to a
/// subset of output columns.
pub fn predict(
    model: &mut SpatialGcn,
    x: &Tensor,
    grid: Option<GridShape>,
    indices: Option<&[usize]>,
) -> Result<Tensor> {
    model.eval();
    model
        .forward(x, grid, indices)
        .context("Prediction forward pass failed")
}
