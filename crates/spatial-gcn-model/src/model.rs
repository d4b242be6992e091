//! Model assembly: two grid graph convolutions, dropout, output projection,
//! and the disk-mask pooled regression step.
//!
//! ```text
//! x ─► conv1 ─► conv2 ─► dropout ─► output(ShiftedElu) ─► ŷ (per node)
//!                                                          │
//!            mask-select ─► mean over nodes ─► MSE vs y_mean
//! ```

use std::path::Path;
use std::sync::{Arc, PoisonError};

use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Dropout, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activation::Activation;
use crate::adjacency::{CachedKnnGridGraph, KnnGridGraph, NeighborhoodGraph, DEFAULT_NEIGHBORS};
use crate::device::ComputeContext;
use crate::error::{GcnError, Result};
use crate::grid::GridShape;
use crate::layers::{GraphConvLayer, OutputLayer};
use crate::mask::{build_disk_mask, DiskMask, DEFAULT_MASK_RADIUS};

// ============================================================================
// Hyperparameters
// ============================================================================

/// Model hyperparameters.
///
/// Serialized alongside checkpoints so a saved model can be rebuilt with
/// the exact architecture it was trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Input feature dimension per grid node.
    pub in_features: usize,
    /// Number of regression outputs per node.
    pub out_features: usize,
    /// Width of both graph convolution layers.
    pub hidden_features: usize,
    /// Whether the output projection carries a bias.
    pub bias: bool,
    /// Dropout on the latent representation (training only).
    pub dropout: f32,
    /// Radius of the pooling disk; fixes the output grid side.
    pub mask_radius: f64,
    /// Neighbors selected per node before symmetrization.
    pub neighbors: usize,
    /// Memoize adjacency per grid shape instead of rebuilding it each call.
    pub cache_adjacency: bool,
    /// Activation of the output projection.
    pub output_activation: Activation,
    /// Adam learning rate.
    pub learning_rate: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_features: 1024,
            out_features: 1,
            hidden_features: 512,
            bias: false,
            dropout: 0.5,
            mask_radius: DEFAULT_MASK_RADIUS,
            neighbors: DEFAULT_NEIGHBORS,
            cache_adjacency: true,
            output_activation: Activation::shifted_elu(0.01, 0.01),
            learning_rate: 1e-4,
        }
    }
}

impl ModelConfig {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            in_features,
            out_features,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_features == 0 || self.out_features == 0 || self.hidden_features == 0 {
            return Err(GcnError::InvalidConfig(
                "in_features, out_features and hidden_features must be non-zero".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(GcnError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(GcnError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.neighbors == 0 {
            return Err(GcnError::InvalidConfig("neighbors must be non-zero".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Training step output
// ============================================================================

/// Result of one training step.
pub struct StepOutput {
    /// Mean squared error; the value to differentiate.
    pub loss: Tensor,
    /// `sqrt(loss)`, the reported `"loss"` metric.
    pub rmse: f32,
    /// Per-sample pooled prediction, shape `(batch, out_features)`.
    pub predicted_mean: Tensor,
}

// ============================================================================
// Model
// ============================================================================

/// Grid GCN regressor with disk-mask pooling.
///
/// Parameters live in a [`VarMap`] under `conv1.*`, `conv2.*` and
/// `output.*`, created in the context's dtype on its device.
pub struct SpatialGcn {
    config: ModelConfig,
    ctx: ComputeContext,
    varmap: VarMap,
    conv1: GraphConvLayer,
    conv2: GraphConvLayer,
    dropout: Dropout,
    output: OutputLayer,
    mask: DiskMask,
    mask_index: Tensor,
    training: bool,
}

impl SpatialGcn {
    /// Build a freshly initialized model in training mode.
    pub fn new(config: ModelConfig, ctx: ComputeContext) -> Result<Self> {
        let graph: Arc<dyn NeighborhoodGraph> = if config.cache_adjacency {
            Arc::new(CachedKnnGridGraph::new(config.neighbors))
        } else {
            Arc::new(KnnGridGraph::new(config.neighbors))
        };
        Self::with_graph(config, ctx, graph)
    }

    /// Build a model whose graph layers draw adjacency from `graph`.
    pub fn with_graph(
        config: ModelConfig,
        ctx: ComputeContext,
        graph: Arc<dyn NeighborhoodGraph>,
    ) -> Result<Self> {
        config.validate()?;
        let device = ctx.device();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, ctx.dtype(), device);

        let conv1 = GraphConvLayer::new(
            config.in_features,
            config.hidden_features,
            graph.clone(),
            vb.pp("conv1"),
        )?;
        let conv2 = GraphConvLayer::new(
            config.hidden_features,
            config.hidden_features,
            graph,
            vb.pp("conv2"),
        )?;
        let output = OutputLayer::new(
            config.hidden_features,
            config.out_features,
            config.output_activation,
            config.bias,
            vb.pp("output"),
        )?;
        let mask = build_disk_mask(config.mask_radius)?;
        let mask_index = mask.index_tensor(device)?;

        debug!(
            in_features = config.in_features,
            hidden = config.hidden_features,
            out_features = config.out_features,
            mask_side = mask.side(),
            mask_cells = mask.count(),
            dtype = ?ctx.dtype(),
            "spatial gcn initialized"
        );

        Ok(Self {
            dropout: Dropout::new(config.dropout),
            config,
            ctx,
            varmap,
            conv1,
            conv2,
            output,
            mask,
            mask_index,
            training: true,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn context(&self) -> &ComputeContext {
        &self.ctx
    }

    pub fn mask(&self) -> &DiskMask {
        &self.mask
    }

    /// Output grid expected by [`training_step`](Self::training_step).
    pub fn output_grid(&self) -> GridShape {
        self.mask.grid()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Enable dropout.
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Disable dropout; forward passes become deterministic.
    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// All learnable parameters, sorted by name (`"conv1.weight"`, ...).
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    pub fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Overwrite every parameter with the same-named tensor in a
    /// safetensors file. The stored dtype must match the context's.
    pub fn load_parameters(&mut self, path: &Path) -> Result<()> {
        self.varmap.load(path)?;
        Ok(())
    }

    pub fn reset_parameters(&self) -> Result<()> {
        self.conv1.reset_parameters()?;
        self.conv2.reset_parameters()?;
        self.output.reset_parameters()
    }

    /// Latent node features: `dropout(conv2(conv1(x)))`.
    pub fn encode(&self, x: &Tensor, grid: Option<GridShape>) -> Result<Tensor> {
        let x = x.to_dtype(self.ctx.dtype())?;
        let h = self.conv1.forward(&x, grid, None)?;
        let h = self.conv2.forward(&h, grid, None)?;
        Ok(self.dropout.forward(&h, self.training)?)
    }

    /// Per-node predictions from latent features.
    pub fn project(&self, latent: &Tensor, indices: Option<&[usize]>) -> Result<Tensor> {
        self.output.forward(latent, indices)
    }

    pub fn forward(
        &self,
        x: &Tensor,
        grid: Option<GridShape>,
        indices: Option<&[usize]>,
    ) -> Result<Tensor> {
        let latent = self.encode(x, grid)?;
        self.project(&latent, indices)
    }

    /// One regression step on a batch `(x, y_mean)`.
    ///
    /// `x` must cover the mask grid, either as `(batch, side, side, in)` or
    /// `(batch, side * side, in)`; `y_mean` is `(batch, out_features)`.
    /// Predictions on the disk cells are averaged per sample and compared
    /// to `y_mean` with a mean squared error.
    pub fn training_step(&self, x: &Tensor, y_mean: &Tensor) -> Result<StepOutput> {
        let grid = self.output_grid();
        let y_pred = self.forward(x, Some(grid), None)?;

        let batch = y_pred.dim(0)?;
        let outputs = y_pred.dim(y_pred.rank() - 1)?;
        let y_pred = y_pred.reshape((batch, grid.num_nodes(), outputs))?;

        let selected = y_pred.index_select(&self.mask_index, 1)?;
        let predicted_mean = selected.mean(1)?;

        let y_mean = y_mean.to_dtype(predicted_mean.dtype())?;
        let loss = candle_nn::loss::mse(&predicted_mean, &y_mean)?;
        let rmse = loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?.sqrt();
        debug!(batch, loss = rmse, "training step");

        Ok(StepOutput {
            loss,
            rmse,
            predicted_mean,
        })
    }

    /// Adam over every parameter at the configured learning rate; no weight
    /// decay.
    pub fn configure_optimizers(&self) -> Result<AdamW> {
        let params = ParamsAdamW {
            lr: self.config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        Ok(AdamW::new(self.varmap.all_vars(), params)?)
    }
}
