//! Owned weight buffers.
//!
//! A [`Tensor`] keeps the raw little-endian bytes exactly as read from the
//! source file, so a weight that is copied through unchanged stays
//! byte-identical. Merge arithmetic goes through [`Tensor::to_f32_vec`] and
//! [`Tensor::from_f32`].

use safetensors::Dtype;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{MergeError, Result};

/// A compute or storage resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// Host memory and the CPU worker pool.
    #[default]
    Cpu,
    /// An accelerator. Runs one merge at a time.
    Accelerator,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Accelerator => f.write_str("accelerator"),
        }
    }
}

impl std::str::FromStr for Device {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "accelerator" | "gpu" | "cuda" | "metal" => Ok(Self::Accelerator),
            other => Err(MergeError::InvalidConfig(format!("unknown device '{}'", other))),
        }
    }
}

/// A weight buffer with dtype, shape and placement.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
    device: Device,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("bytes", &self.data.len())
            .field("device", &self.device)
            .finish()
    }
}

impl Tensor {
    /// Wrap raw bytes.
    pub fn from_bytes(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(MergeError::InvalidConfig(format!(
                "buffer of {} bytes does not match {:?} {:?}",
                data.len(),
                dtype,
                shape
            )));
        }
        Ok(Self {
            dtype,
            shape,
            data,
            device: Device::Cpu,
        })
    }

    /// Encode f32 values as `dtype`.
    pub fn from_f32(values: &[f32], shape: Vec<usize>, dtype: Dtype) -> Result<Self> {
        let data: Vec<u8> = match dtype {
            Dtype::F32 => bytemuck::cast_slice(values).to_vec(),
            Dtype::F16 => {
                let halfs: Vec<half::f16> = values.iter().map(|&v| half::f16::from_f32(v)).collect();
                bytemuck::cast_slice(&halfs).to_vec()
            }
            Dtype::BF16 => {
                let halfs: Vec<half::bf16> =
                    values.iter().map(|&v| half::bf16::from_f32(v)).collect();
                bytemuck::cast_slice(&halfs).to_vec()
            }
            other => {
                return Err(MergeError::UnsupportedDtype {
                    name: String::new(),
                    dtype: format!("{:?}", other),
                })
            }
        };
        Self::from_bytes(dtype, shape, data)
    }

    /// Zero-filled tensor.
    pub fn zeros(shape: Vec<usize>, dtype: Dtype) -> Result<Self> {
        let n: usize = shape.iter().product();
        Self::from_bytes(dtype, shape, vec![0; n * dtype.size()])
    }

    /// Element type.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Dimensions.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the payload in bytes.
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// Raw payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume into the raw payload.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Current placement.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Move to another resource.
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Decode to f32.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let out = match self.dtype {
            Dtype::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(&self.data),
            Dtype::F16 => bytemuck::pod_collect_to_vec::<u8, half::f16>(&self.data)
                .into_iter()
                .map(|h| h.to_f32())
                .collect(),
            Dtype::BF16 => bytemuck::pod_collect_to_vec::<u8, half::bf16>(&self.data)
                .into_iter()
                .map(|h| h.to_f32())
                .collect(),
            other => {
                return Err(MergeError::UnsupportedDtype {
                    name: String::new(),
                    dtype: format!("{:?}", other),
                })
            }
        };
        Ok(out)
    }

    /// Convert to `dtype`. Returns `self` untouched when already there.
    pub fn cast(self, dtype: Dtype) -> Result<Self> {
        if self.dtype == dtype {
            return Ok(self);
        }
        let device = self.device;
        let values = self.to_f32_vec()?;
        Ok(Self::from_f32(&values, self.shape, dtype)?.to_device(device))
    }

    /// Same dtype, shape and placement with new values.
    pub fn with_values(&self, values: &[f32]) -> Result<Self> {
        if values.len() != self.numel() {
            return Err(MergeError::ShapeMismatch {
                name: String::new(),
                expected: self.shape.clone(),
                actual: vec![values.len()],
            });
        }
        Ok(Self::from_f32(values, self.shape.clone(), self.dtype)?.to_device(self.device))
    }

    /// Tensor with a different leading dimension, same trailing dims.
    pub fn with_rows(&self, values: &[f32], rows: usize) -> Result<Self> {
        let mut shape = self.shape.clone();
        if let Some(first) = shape.first_mut() {
            *first = rows;
        }
        Ok(Self::from_f32(values, shape, self.dtype)?.to_device(self.device))
    }
}
