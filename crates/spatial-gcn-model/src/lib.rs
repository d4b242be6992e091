//! Spatial GCN model
//!
//! Graph convolutional regression over 2D grids of image-patch features:
//! - [`adjacency`]: fixed symmetric 4-nearest-neighbor graph over grid cells,
//!   behind the [`NeighborhoodGraph`] provider trait (fresh or memoized)
//! - [`layers`]: graph convolution and output projection layers with
//!   optional output-column subsets
//! - [`mask`]: circular pooling mask over the output grid
//! - [`model`]: the assembled two-layer encoder, shifted-ELU head and the
//!   disk-mask pooled MSE training step
//! - [`checkpoint`]: safetensors persistence with hyperparameters as metadata
//!
//! All tensors are placed through a [`ComputeContext`]; nothing here picks a
//! device on its own.

pub mod activation;
pub mod adjacency;
pub mod checkpoint;
pub mod device;
pub mod error;
pub mod grid;
pub mod layers;
pub mod mask;
pub mod model;

pub use activation::Activation;
pub use adjacency::{
    build_adjacency, nearest_neighbors, AdjacencyMatrix, CachedKnnGridGraph, KnnGridGraph,
    NeighborhoodGraph,
};
pub use checkpoint::{load_checkpoint, read_hyperparameters, save_checkpoint};
pub use device::{ComputeContext, DeviceSpec};
pub use error::{GcnError, Result};
pub use grid::GridShape;
pub use layers::{GraphConvLayer, OutputLayer, Projection};
pub use mask::{build_disk_mask, DiskMask, DEFAULT_MASK_RADIUS};
pub use model::{ModelConfig, SpatialGcn, StepOutput};

/// Optimizer trait, re-exported so callers can drive `backward_step`.
pub use candle_nn::{AdamW, Optimizer};
