//! Learnable layers: grid graph convolution and output projection.
//!
//! Both layers hold a weight matrix `(in_features, out_features)` and an
//! optional bias `(out_features)`, drawn uniformly from
//! `[-1/sqrt(out_features), 1/sqrt(out_features)]`. Parameters are
//! registered through a [`VarBuilder`], so they live in the caller's
//! `VarMap` under `"{prefix}.weight"` / `"{prefix}.bias"` and take its
//! dtype and device. Both layers accept an optional ordered subset of
//! output columns; when given, only those weight columns and bias entries
//! take part in the forward pass.

use std::sync::Arc;

use candle_core::{Module, Tensor, Var};
use candle_nn::{Init, VarBuilder};
use tracing::trace;

use crate::activation::Activation;
use crate::adjacency::NeighborhoodGraph;
use crate::error::{GcnError, Result};
use crate::grid::GridShape;

// ============================================================================
// Shared projection parameters
// ============================================================================

/// Weight and optional bias of a dense projection.
pub struct Projection {
    in_features: usize,
    out_features: usize,
    weight: Var,
    bias: Option<Var>,
}

impl Projection {
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(GcnError::InvalidConfig(format!(
                "layer dimensions must be non-zero, got {in_features} -> {out_features}"
            )));
        }
        let init = uniform_init(out_features);
        let weight = vb.get_with_hints((in_features, out_features), "weight", init)?;
        let bias = if bias {
            Some(Var::from_tensor(&vb.get_with_hints(out_features, "bias", init)?)?)
        } else {
            None
        };
        Ok(Self {
            in_features,
            out_features,
            // The VarMap hands out variable tensors, so this shares its storage.
            weight: Var::from_tensor(&weight)?,
            bias,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    /// Re-draw weight and bias from the initial distribution, in place.
    pub fn reset_parameters(&self) -> Result<()> {
        redraw(&self.weight, self.out_features)?;
        if let Some(bias) = &self.bias {
            redraw(bias, self.out_features)?;
        }
        Ok(())
    }

    /// Number of output columns produced for `indices`.
    pub fn output_width(&self, indices: Option<&[usize]>) -> usize {
        indices.map_or(self.out_features, <[usize]>::len)
    }

    /// Weight `(in, k)` and bias `(k)` restricted to `indices`, or the full
    /// parameters when no subset is requested.
    pub fn select(&self, indices: Option<&[usize]>) -> Result<(Tensor, Option<Tensor>)> {
        let Some(indices) = indices else {
            return Ok((
                self.weight.as_tensor().clone(),
                self.bias.as_ref().map(|b| b.as_tensor().clone()),
            ));
        };
        let index = self.index_tensor(indices)?;
        let weight = self.weight.index_select(&index, 1)?;
        let bias = match &self.bias {
            Some(b) => Some(b.index_select(&index, 0)?),
            None => None,
        };
        Ok((weight, bias))
    }

    fn index_tensor(&self, indices: &[usize]) -> Result<Tensor> {
        if indices.is_empty() {
            return Err(GcnError::EmptyIndices);
        }
        if let Some(&index) = indices.iter().find(|&&i| i >= self.out_features) {
            return Err(GcnError::IndexOutOfRange {
                index,
                out_features: self.out_features,
            });
        }
        let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        Ok(Tensor::from_vec(ids, indices.len(), self.weight.device())?)
    }

    fn check_features(&self, actual: usize) -> Result<()> {
        if actual != self.in_features {
            return Err(GcnError::FeatureMismatch {
                expected: self.in_features,
                actual,
            });
        }
        Ok(())
    }
}

fn init_bound(out_features: usize) -> f64 {
    1.0 / (out_features as f64).sqrt()
}

fn uniform_init(out_features: usize) -> Init {
    let bound = init_bound(out_features);
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

fn redraw(var: &Var, out_features: usize) -> Result<()> {
    let fresh = uniform_init(out_features).var(var.shape(), var.dtype(), var.device())?;
    var.set(fresh.as_tensor())?;
    Ok(())
}

// ============================================================================
// Graph convolution
// ============================================================================

/// One round of kNN-grid message passing:
/// `act(A @ (x @ W) + b)`.
///
/// Accepts `(batch, h, w, in)` inputs, whose grid comes from the shape and
/// whose output keeps the same layout, or flattened `(batch, h*w, in)`
/// inputs, whose grid must be passed explicitly or be square.
pub struct GraphConvLayer {
    projection: Projection,
    activation: Activation,
    graph: Arc<dyn NeighborhoodGraph>,
}

impl GraphConvLayer {
    /// Bias-free layer with the default leaky ReLU.
    pub fn new(
        in_features: usize,
        out_features: usize,
        graph: Arc<dyn NeighborhoodGraph>,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::with_options(
            in_features,
            out_features,
            false,
            Activation::default(),
            graph,
            vb,
        )
    }

    pub fn with_options(
        in_features: usize,
        out_features: usize,
        bias: bool,
        activation: Activation,
        graph: Arc<dyn NeighborhoodGraph>,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            projection: Projection::new(in_features, out_features, bias, vb)?,
            activation,
            graph,
        })
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn reset_parameters(&self) -> Result<()> {
        self.projection.reset_parameters()
    }

    pub fn forward(
        &self,
        x: &Tensor,
        grid: Option<GridShape>,
        indices: Option<&[usize]>,
    ) -> Result<Tensor> {
        let (flat, grid, spatial) = flatten_grid(x, grid)?;
        let (batch, nodes, features) = flat.dims3()?;
        self.projection.check_features(features)?;

        let (weight, bias) = self.projection.select(indices)?;
        let width = self.projection.output_width(indices);

        let linear = flat
            .reshape((batch * nodes, features))?
            .matmul(&weight)?
            .reshape((batch, nodes, width))?;

        // Batch folded into the columns: (n, n) @ (n, batch * width).
        let adj = self
            .graph
            .adjacency(grid, flat.device())?
            .to_dtype(flat.dtype())?;
        let folded = linear
            .transpose(0, 1)?
            .contiguous()?
            .reshape((nodes, batch * width))?;
        let mut out = adj
            .matmul(&folded)?
            .reshape((nodes, batch, width))?
            .transpose(0, 1)?
            .contiguous()?;
        if let Some(bias) = bias {
            out = out.broadcast_add(&bias)?;
        }
        let out = self.activation.forward(&out)?;

        trace!(%grid, batch, width, "graph conv forward");
        if spatial {
            Ok(out.reshape((batch, grid.height, grid.width, width))?)
        } else {
            Ok(out)
        }
    }
}

/// Bring `x` to `(batch, nodes, features)` and resolve its grid.
///
/// The returned flag is true when the input was 4D and the output should be
/// restored to `(batch, h, w, features)`.
fn flatten_grid(x: &Tensor, grid: Option<GridShape>) -> Result<(Tensor, GridShape, bool)> {
    match *x.dims() {
        [batch, h, w, features] => {
            let from_shape = GridShape::new(h, w);
            if let Some(explicit) = grid {
                if explicit != from_shape {
                    return Err(GcnError::InvalidGridShape(format!(
                        "explicit grid {explicit} disagrees with input grid {from_shape}"
                    )));
                }
            }
            Ok((x.reshape((batch, h * w, features))?, from_shape, true))
        }
        [_, nodes, _] => {
            let grid = match grid {
                Some(grid) => {
                    grid.expect_nodes(nodes)?;
                    grid
                }
                None => GridShape::infer_square(nodes)?,
            };
            Ok((x.clone(), grid, false))
        }
        ref dims => Err(GcnError::InvalidGridShape(format!(
            "expected (batch, nodes, features) or (batch, h, w, features), got {dims:?}"
        ))),
    }
}

// ============================================================================
// Output projection
// ============================================================================

/// Dense projection without graph aggregation: `act(x @ W + b)`.
///
/// Works on any input of rank ≥ 2 whose last axis holds the features.
pub struct OutputLayer {
    projection: Projection,
    activation: Activation,
}

impl OutputLayer {
    pub fn new(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            projection: Projection::new(in_features, out_features, bias, vb)?,
            activation,
        })
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn reset_parameters(&self) -> Result<()> {
        self.projection.reset_parameters()
    }

    pub fn forward(&self, x: &Tensor, indices: Option<&[usize]>) -> Result<Tensor> {
        let dims = x.dims();
        let Some((&features, leading)) = dims.split_last().filter(|(_, lead)| !lead.is_empty())
        else {
            return Err(GcnError::InvalidGridShape(format!(
                "output layer expects rank >= 2 input, got {dims:?}"
            )));
        };
        self.projection.check_features(features)?;

        let (weight, bias) = self.projection.select(indices)?;
        let rows: usize = leading.iter().product();
        let mut out_dims = leading.to_vec();
        out_dims.push(self.projection.output_width(indices));

        let mut out = x.reshape((rows, features))?.matmul(&weight)?;
        if let Some(bias) = bias {
            out = out.broadcast_add(&bias)?;
        }
        let out = self.activation.forward(&out)?;
        Ok(out.reshape(out_dims)?)
    }
}
