//! Spatial GCN
//!
//! Training and inference driver around [`spatial_gcn_model`]:
//! - YAML + environment configuration
//! - ready-made batch files (safetensors)
//! - a minimal training loop with RMSE logging and checkpointing

pub mod data;
pub mod trainer;

pub use spatial_gcn_model as model;

use anyhow::{Context, Result};
use serde::Deserialize;
use spatial_gcn_model::ModelConfig;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub model: ModelConfig,
    pub training: TrainingYamlConfig,
    pub runtime: RuntimeYamlConfig,
}

/// Training loop section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingYamlConfig {
    pub epochs: usize,
    /// Emit the `loss` metric every N optimizer steps
    pub log_every: usize,
    /// Where to write the checkpoint after training (optional)
    pub checkpoint_path: Option<String>,
}

impl Default for TrainingYamlConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            log_every: 1,
            checkpoint_path: None,
        }
    }
}

/// Runtime section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeYamlConfig {
    /// `cpu`, `cuda`, `cuda:N`, `metal` or `auto`
    pub device: String,
}

impl Default for RuntimeYamlConfig {
    fn default() -> Self {
        Self {
            device: "auto".into(),
        }
    }
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub model: ModelConfig,
    pub epochs: usize,
    pub log_every: usize,
    pub checkpoint_path: Option<PathBuf>,
    pub device: String,
}

impl Config {
    /// Load configuration from environment variables only.
    /// Equivalent to from_yaml_and_env(None).
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD. If that file doesn't
    /// exist, falls back to pure env var / defaults. An explicitly named file
    /// must exist and parse.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let yaml = Self::load_yaml(yaml_path)?;
        let mut model = yaml.model;

        if let Some(v) = env_parse("GCN_IN_FEATURES")? {
            model.in_features = v;
        }
        if let Some(v) = env_parse("GCN_OUT_FEATURES")? {
            model.out_features = v;
        }
        if let Some(v) = env_parse("GCN_HIDDEN_FEATURES")? {
            model.hidden_features = v;
        }
        if let Some(v) = env_parse("GCN_LEARNING_RATE")? {
            model.learning_rate = v;
        }

        Ok(Self {
            model,
            epochs: env_parse("GCN_EPOCHS")?.unwrap_or(yaml.training.epochs),
            log_every: yaml.training.log_every.max(1),
            checkpoint_path: std::env::var("GCN_CHECKPOINT")
                .ok()
                .or(yaml.training.checkpoint_path)
                .map(PathBuf::from),
            device: std::env::var("GCN_DEVICE").unwrap_or(yaml.runtime.device),
        })
    }

    /// Load the YAML config file.
    ///
    /// An explicit path is read and parsed strictly. Without one, a missing
    /// ./config.yaml means defaults, but a present one must still parse.
    fn load_yaml(yaml_path: Option<&Path>) -> Result<YamlConfig> {
        let path = match yaml_path {
            Some(path) => path,
            None => {
                let default_path = Path::new("config.yaml");
                if !default_path.exists() {
                    tracing::debug!(
                        "No config.yaml in working directory, using env vars / defaults"
                    );
                    return Ok(YamlConfig::default());
                }
                default_path
            }
        };

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}

/// Parse an optional env var; a set but malformed value is an error.
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw}: {e}")),
        Err(_) => Ok(None),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_yaml_config_loading() {
        let yaml = r#"
model:
  in_features: 256
  out_features: 10
  hidden_features: 64
  bias: true
  learning_rate: 0.001
  output_activation:
    type: shifted_elu
    alpha: 0.05
    beta: 0.02

training:
  epochs: 20
  log_every: 5
  checkpoint_path: /tmp/gcn.safetensors

runtime:
  device: cpu
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.model.in_features, 256);
        assert_eq!(config.model.out_features, 10);
        assert!(config.model.bias);
        assert_eq!(
            config.model.output_activation,
            spatial_gcn_model::Activation::shifted_elu(0.05, 0.02)
        );
        // Unspecified model fields keep their defaults
        assert!((config.model.dropout - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.training.epochs, 20);
        assert_eq!(config.training.log_every, 5);
        assert_eq!(config.runtime.device, "cpu");
    }

    #[test]
    fn test_yaml_defaults() {
        let config: YamlConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.model.hidden_features, 512);
        assert_eq!(config.training.epochs, 1);
        assert!(config.training.checkpoint_path.is_none());
        assert_eq!(config.runtime.device, "auto");
    }

    /// Combined test for YAML file loading and env var overrides.
    /// Runs as a single test to avoid parallel env var race conditions.
    #[test]
    fn test_yaml_and_env_lifecycle() {
        fn clear_env() {
            for var in &[
                "GCN_DEVICE",
                "GCN_LEARNING_RATE",
                "GCN_EPOCHS",
                "GCN_IN_FEATURES",
                "GCN_OUT_FEATURES",
                "GCN_HIDDEN_FEATURES",
                "GCN_CHECKPOINT",
            ] {
                std::env::remove_var(var);
            }
        }

        // --- Phase 1: YAML values loaded correctly ---
        let yaml = r#"
model:
  in_features: 32
  out_features: 4
training:
  epochs: 3
runtime:
  device: cpu
"#;
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        clear_env();

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.model.in_features, 32);
        assert_eq!(config.epochs, 3);
        assert_eq!(config.device, "cpu");
        assert!(config.checkpoint_path.is_none());

        // --- Phase 2: Env vars override YAML ---
        std::env::set_var("GCN_EPOCHS", "7");
        std::env::set_var("GCN_DEVICE", "cuda:1");
        std::env::set_var("GCN_LEARNING_RATE", "0.01");
        std::env::set_var("GCN_CHECKPOINT", "/tmp/out.safetensors");

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.epochs, 7);
        assert_eq!(config.device, "cuda:1");
        assert!((config.model.learning_rate - 0.01).abs() < f64::EPSILON);
        assert_eq!(
            config.checkpoint_path.as_deref(),
            Some(Path::new("/tmp/out.safetensors"))
        );
        // YAML value still used where no env override
        assert_eq!(config.model.out_features, 4);

        // --- Phase 3: malformed env value is rejected ---
        std::env::set_var("GCN_EPOCHS", "many");
        assert!(Config::from_yaml_and_env(Some(&file_path)).is_err());

        clear_env();

        // --- Phase 4: Explicit but missing YAML file is an error ---
        let nonexistent = dir.path().join("missing.yaml");
        let err = Config::from_yaml_and_env(Some(&nonexistent)).unwrap_err();
        assert!(err.to_string().contains("missing.yaml"), "{err:#}");

        // --- Phase 5: No YAML file named → defaults ---
        let cwd_config = Path::new("config.yaml");
        if !cwd_config.exists() {
            let config = Config::from_yaml_and_env(None).unwrap();
            assert_eq!(config.epochs, 1);
            assert_eq!(config.device, "auto");
            assert_eq!(config.model.hidden_features, 512);
        }
    }

    #[test]
    fn test_explicit_yaml_with_type_error_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("bad.yaml");
        std::fs::write(&file_path, "model:\n  out_features: three\n").unwrap();

        let err = Config::load_yaml(Some(&file_path)).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
        assert!(format!("{err:#}").contains("invalid type"));
    }

    #[test]
    fn test_explicit_missing_yaml_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("run.yaml");
        let err = Config::load_yaml(Some(&missing)).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config file"));
    }
}
