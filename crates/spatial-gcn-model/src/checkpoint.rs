//! Checkpoint persistence.
//!
//! A checkpoint is a single safetensors file: one tensor per entry of the
//! model's `VarMap` (named as in [`SpatialGcn::named_parameters`]) plus
//! the serialized [`ModelConfig`] under the `hyperparameters` metadata key.
//! Parameters are stored in the model's dtype.

use std::collections::HashMap;
use std::path::Path;

use candle_core::Device;
use safetensors::SafeTensors;
use tracing::info;

use crate::device::ComputeContext;
use crate::error::{GcnError, Result};
use crate::model::{ModelConfig, SpatialGcn};

const HYPERPARAMETERS_KEY: &str = "hyperparameters";

/// Write parameters and hyperparameters of `model` to `path`.
pub fn save_checkpoint(model: &SpatialGcn, path: &Path) -> Result<()> {
    let hyperparameters = serde_json::to_string(model.config())
        .map_err(|e| GcnError::Checkpoint(format!("serialize hyperparameters: {e}")))?;
    let metadata = HashMap::from([(HYPERPARAMETERS_KEY.to_string(), hyperparameters)]);

    let tensors = model
        .named_parameters()
        .into_iter()
        .map(|(name, var)| Ok((name, var.as_tensor().to_device(&Device::Cpu)?)))
        .collect::<Result<Vec<_>>>()?;

    safetensors::serialize_to_file(tensors, &Some(metadata), path)
        .map_err(|e| GcnError::Checkpoint(format!("write {}: {e}", path.display())))?;
    info!(path = %path.display(), "checkpoint saved");
    Ok(())
}

/// Read only the hyperparameters stored in a checkpoint.
pub fn read_hyperparameters(path: &Path) -> Result<ModelConfig> {
    let bytes = std::fs::read(path)?;
    hyperparameters_from_bytes(&bytes, path)
}

/// Rebuild a model from `path` on `ctx`, restoring every parameter.
///
/// `ctx` must use the dtype the checkpoint was saved with. The returned
/// model is in evaluation mode.
pub fn load_checkpoint(path: &Path, ctx: ComputeContext) -> Result<SpatialGcn> {
    let config = read_hyperparameters(path)?;
    let mut model = SpatialGcn::new(config, ctx)?;
    model.load_parameters(path)?;
    model.eval();
    info!(path = %path.display(), "checkpoint loaded");
    Ok(model)
}

fn hyperparameters_from_bytes(bytes: &[u8], path: &Path) -> Result<ModelConfig> {
    let (_, header) = SafeTensors::read_metadata(bytes)
        .map_err(|e| GcnError::Checkpoint(format!("read {}: {e}", path.display())))?;
    let raw = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(HYPERPARAMETERS_KEY))
        .ok_or_else(|| {
            GcnError::Checkpoint(format!("{} has no hyperparameters", path.display()))
        })?;
    serde_json::from_str(raw)
        .map_err(|e| GcnError::Checkpoint(format!("parse hyperparameters: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;

    fn config() -> ModelConfig {
        ModelConfig {
            hidden_features: 8,
            bias: true,
            ..ModelConfig::new(4, 2)
        }
    }

    #[test]
    fn test_checkpoint_restores_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");

        let mut model = SpatialGcn::new(config(), ComputeContext::cpu()).unwrap();
        model.eval();
        save_checkpoint(&model, &path).unwrap();

        let restored = load_checkpoint(&path, ComputeContext::cpu()).unwrap();
        assert_eq!(restored.config(), model.config());
        assert!(!restored.is_training());

        let x = Tensor::randn(0f32, 1.0, (1, 81, 4), &Device::Cpu).unwrap();
        let a = model.forward(&x, None, None).unwrap();
        let b = restored.forward(&x, None, None).unwrap();
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_read_hyperparameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let model = SpatialGcn::new(config(), ComputeContext::cpu()).unwrap();
        save_checkpoint(&model, &path).unwrap();

        assert_eq!(read_hyperparameters(&path).unwrap(), config());
    }

    #[test]
    fn test_missing_parameter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.safetensors");
        let model = SpatialGcn::new(config(), ComputeContext::cpu()).unwrap();
        let hyperparameters = serde_json::to_string(model.config()).unwrap();
        let metadata = HashMap::from([(HYPERPARAMETERS_KEY.to_string(), hyperparameters)]);
        let tensors: Vec<(String, Tensor)> = model
            .named_parameters()
            .into_iter()
            .filter(|(name, _)| name != "conv2.weight")
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        safetensors::serialize_to_file(tensors, &Some(metadata), &path).unwrap();

        assert!(load_checkpoint(&path, ComputeContext::cpu()).is_err());
    }

    #[test]
    fn test_missing_metadata_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.safetensors");
        let t = Tensor::zeros(3, candle_core::DType::F32, &Device::Cpu).unwrap();
        t.save_safetensors("t", &path).unwrap();

        assert!(matches!(
            load_checkpoint(&path, ComputeContext::cpu()),
            Err(GcnError::Checkpoint(_))
        ));
    }
}
