//! Kernel projections over the trailing feature axis.
//!
//! Kernels are laid out `[in_dim, out_dim]` and inputs may have any number of
//! leading axes: `(batch, seq, in_dim)` projects to `(batch, seq, out_dim)`.
//! Operands are promoted to [`PrecisionPolicy::compute`] for the matmul and the
//! result is cast back to the storage dtype.

use candle_core::{DType, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

/// Contracts the trailing axis of `input` with `kernel`.
pub fn dot(input: &Tensor, kernel: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    checks::expect_rank("linear.kernel", kernel, 2)?;
    checks::expect_dtype_in("linear.input", input, FLOAT_DTYPES)?;
    let (in_dim, out_dim) = kernel.dims2()?;
    checks::expect_last_dim("linear.input", input, in_dim)?;

    let dims = input.dims();
    let leading = &dims[..dims.len() - 1];
    let rows: usize = leading.iter().product();

    let x = policy
        .cast_for_matmul(input)?
        .contiguous()?
        .reshape((rows, in_dim))?;
    let w = policy.cast_for_matmul(kernel)?.contiguous()?;
    let y = x.matmul(&w)?;

    let mut out_dims = leading.to_vec();
    out_dims.push(out_dim);
    policy.cast_to_storage(&y.reshape(out_dims)?)
}
