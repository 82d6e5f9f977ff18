//! Lightweight validation helpers shared across layer components.
//!
//! Each helper takes a short `context` label naming the tensor being checked
//! and returns `candle_core::Result<()>` so call sites can propagate errors
//! with `?`.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected shape {:?}, got {:?}",
            expected,
            tensor.dims()
        )))
    }
}

/// Ensures a tensor has exactly `rank` axes.
pub fn expect_rank(context: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Ensures the trailing (feature) axis has size `dim`.
pub fn expect_last_dim(context: &str, tensor: &Tensor, dim: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&actual) if actual == dim => Ok(()),
        _ => Err(Error::Msg(format!(
            "{context}: expected trailing dim {dim}, got shape {:?}",
            tensor.dims()
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}
