//! Precision policy used when projecting and activating tensors.
//!
//! Kernels may be stored in `f16`/`bf16` to save memory while the matmuls and
//! non-linearities run in `f32`. [`PrecisionPolicy`] records both dtypes so
//! every layer casts the same way before a matmul and after producing output.

use candle_core::{DType, Result, Tensor};

/// Storage and compute dtypes for a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
}

impl PrecisionPolicy {
    pub fn new(storage: DType, compute: DType) -> Self {
        Self { storage, compute }
    }

    /// Builds a policy from the parameter storage dtype, promoting half
    /// precision formats to `f32` for compute.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute
    }

    /// Comparison tolerance appropriate for values held in storage precision.
    pub fn epsilon(&self) -> f32 {
        match self.storage {
            DType::BF16 => 2e-2,
            DType::F16 => 5e-3,
            DType::F32 => 1e-5,
            DType::F64 => 1e-7,
            _ => 0.0,
        }
    }

    /// Casts a tensor to the compute dtype ahead of a matmul or activation.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor back to the storage dtype.
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

impl Default for PrecisionPolicy {
    fn default() -> Self {
        Self::from_parameter_dtype(DType::F32)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
