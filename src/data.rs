//! Batch files.
//!
//! Batches are built upstream and stored as-is in one safetensors file:
//! `"{i}.x"` holds the input features of batch `i` and `"{i}.y_mean"` its
//! pooled targets, for `i = 0, 1, ...` without gaps. Nothing here shuffles,
//! slices or resamples.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};

/// One ready-made training pair.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, h, w, in)` or `(batch, h*w, in)`
    pub x: Tensor,
    /// `(batch, out)`
    pub y_mean: Tensor,
}

/// Load every stored batch onto `device`, in index order.
pub fn load_batches(path: &Path, device: &Device) -> Result<Vec<Batch>> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to read batches from {}", path.display()))?;

    let mut batches = Vec::new();
    while let Some(x) = tensors.remove(&format!("{}.x", batches.len())) {
        let key = format!("{}.y_mean", batches.len());
        let y_mean = tensors
            .remove(&key)
            .with_context(|| format!("{} has no '{key}'", path.display()))?;
        if x.dim(0)? != y_mean.dim(0)? {
            bail!(
                "batch {} has {} inputs but {} targets",
                batches.len(),
                x.dim(0)?,
                y_mean.dim(0)?
            );
        }
        batches.push(Batch { x, y_mean });
    }

    if batches.is_empty() {
        bail!("{} contains no batches (expected '0.x' / '0.y_mean')", path.display());
    }
    if !tensors.is_empty() {
        tracing::warn!(
            "Ignoring {} unrecognized tensors in {}",
            tensors.len(),
            path.display()
        );
    }
    tracing::debug!("Loaded {} batches from {}", batches.len(), path.display());
    Ok(batches)
}

/// Store `batches` in the layout read by [`load_batches`].
pub fn save_batches(batches: &[Batch], path: &Path) -> Result<()> {
    let mut tensors = HashMap::new();
    for (i, batch) in batches.iter().enumerate() {
        tensors.insert(format!("{i}.x"), batch.x.clone());
        tensors.insert(format!("{i}.y_mean"), batch.y_mean.clone());
    }
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("Failed to write batches to {}", path.display()))
}

/// Load a single named tensor (e.g. prediction inputs).
pub fn load_tensor(path: &Path, name: &str, device: &Device) -> Result<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    tensors
        .remove(name)
        .with_context(|| format!("{} has no tensor '{name}'", path.display()))
}

/// Write a single named tensor.
pub fn save_tensor(tensor: &Tensor, name: &str, path: &Path) -> Result<()> {
    tensor
        .save_safetensors(name, path)
        .with_context(|| format!("Failed to write {}", path.display()))
}
