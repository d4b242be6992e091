//! Elementwise nonlinearities used by the graph layers.

use candle_core::{Module, Tensor};
use serde::{Deserialize, Serialize};

/// Negative slope of the default graph convolution activation.
pub const DEFAULT_LEAKY_SLOPE: f64 = 0.1;

/// Nonlinearity applied at the end of a layer's forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activation {
    /// `v` for `v > 0`, `negative_slope * v` otherwise.
    LeakyRelu { negative_slope: f64 },
    /// `ELU(v; alpha) + beta`.
    ///
    /// Keeps outputs above `beta - alpha`, which suits non-negative
    /// regression targets such as expression levels.
    ShiftedElu { alpha: f64, beta: f64 },
    Identity,
}

impl Activation {
    pub fn leaky_relu(negative_slope: f64) -> Self {
        Self::LeakyRelu { negative_slope }
    }

    pub fn shifted_elu(alpha: f64, beta: f64) -> Self {
        Self::ShiftedElu { alpha, beta }
    }
}

impl Default for Activation {
    fn default() -> Self {
        Self::leaky_relu(DEFAULT_LEAKY_SLOPE)
    }
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match *self {
            Self::LeakyRelu { negative_slope } => {
                let zeros = xs.zeros_like()?;
                let positive = xs.maximum(&zeros)?;
                let negative = xs.minimum(&zeros)?.affine(negative_slope, 0.0)?;
                positive + negative
            }
            Self::ShiftedElu { alpha, beta } => xs.elu(alpha)?.affine(1.0, beta),
            Self::Identity => Ok(xs.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn apply(act: Activation, values: &[f32]) -> Vec<f32> {
        let xs = Tensor::new(values, &Device::Cpu).unwrap();
        act.forward(&xs).unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_shifted_elu_at_zero_is_beta() {
        let out = apply(Activation::shifted_elu(0.01, 0.01), &[0.0]);
        assert_eq!(out[0], 0.01);
    }

    #[test]
    fn test_shifted_elu_limits() {
        let (alpha, beta) = (0.5_f32, 0.25_f32);
        let out = apply(
            Activation::shifted_elu(alpha as f64, beta as f64),
            &[50.0, -50.0, 1.0, -1.0],
        );
        assert!((out[0] - (50.0 + beta)).abs() < 1e-4);
        assert!((out[1] - (beta - alpha)).abs() < 1e-4);
        assert!((out[2] - (1.0 + beta)).abs() < 1e-6);
        let expected = alpha * ((-1.0_f32).exp() - 1.0) + beta;
        assert!((out[3] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_leaky_relu() {
        let out = apply(Activation::default(), &[2.0, -2.0, 0.0]);
        assert!((out[0] - 2.0).abs() < 1e-6);
        assert!((out[1] + 0.2).abs() < 1e-6);
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn test_serde_tagged() {
        let json = serde_json::to_string(&Activation::shifted_elu(0.01, 0.02)).unwrap();
        assert!(json.contains("\"type\":\"shifted_elu\""));
        let back: Activation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Activation::shifted_elu(0.01, 0.02));
    }
}
