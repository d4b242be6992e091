//! Compute placement.
//!
//! The model never names a device itself: parameters, adjacency and mask
//! tensors are all created on the device of the [`ComputeContext`] it was
//! built with.

use std::str::FromStr;

use candle_core::{DType, Device};
use tracing::info;

use crate::error::{GcnError, Result};

/// Requested device, as written in configuration (`cpu`, `cuda`, `cuda:1`,
/// `metal`, `auto`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
    /// First available accelerator, falling back to CPU.
    Auto,
}

impl FromStr for DeviceSpec {
    type Err = GcnError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| GcnError::Device(format!("invalid device ordinal in '{s}'")))?;
                (kind.to_string(), ordinal)
            }
            None => (s.clone(), 0),
        };
        match kind.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(ordinal)),
            "metal" => Ok(Self::Metal(ordinal)),
            "auto" | "" => Ok(Self::Auto),
            other => Err(GcnError::Device(format!("unknown device '{other}'"))),
        }
    }
}

/// Device and dtype every tensor of a model lives on.
#[derive(Debug, Clone)]
pub struct ComputeContext {
    device: Device,
    dtype: DType,
}

impl ComputeContext {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }

    /// Open the device described by `spec`.
    pub fn from_spec(spec: DeviceSpec) -> Result<Self> {
        let device = match spec {
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal)
                .map_err(|e| GcnError::Device(format!("cuda:{ordinal} unavailable: {e}")))?,
            DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal)
                .map_err(|e| GcnError::Device(format!("metal:{ordinal} unavailable: {e}")))?,
            DeviceSpec::Auto => best_device(),
        };
        info!(device = ?device, "compute context ready");
        Ok(Self {
            device,
            dtype: DType::F32,
        })
    }

    /// Parse and open a device string such as `"cuda:0"`.
    pub fn parse(spec: &str) -> Result<Self> {
        Self::from_spec(spec.parse()?)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Same device, parameters created in `dtype`.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::cpu()
    }
}

fn best_device() -> Device {
    if candle_core::utils::cuda_is_available() {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    if candle_core::utils::metal_is_available() {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    Device::Cpu
}
