//! Builders for per-position validity masks.
//!
//! Validity masks are `[batch, seq_len]` tensors of dtype `u8` where `1` marks
//! a real token and `0` a padded position. They are what callers pass through
//! [`AttentionMasks`](crate::core::AttentionMasks).

use candle_core::{bail, DType, Device, Result, Tensor};

/// Dtype of validity masks produced by this module.
pub const VALIDITY_DTYPE: DType = DType::U8;

/// Construct validity masks from per-batch valid lengths.
///
/// Lengths larger than `seq_len` are clamped.
pub fn mask_from_lengths(device: &Device, lengths: &[usize], seq_len: usize) -> Result<Tensor> {
    let batch = lengths.len();
    let mut data = vec![0u8; batch * seq_len];
    for (b, &valid) in lengths.iter().enumerate() {
        let valid = valid.min(seq_len);
        let row_start = b * seq_len;
        data[row_start..row_start + valid].fill(1);
    }
    Tensor::from_vec(data, (batch, seq_len), device)
}

/// Construct validity masks from boolean indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` marks a valid (attendable) position.
pub fn mask_from_booleans(device: &Device, valid: &[Vec<bool>]) -> Result<Tensor> {
    let Some(first) = valid.first() else {
        return Tensor::zeros((0, 0), VALIDITY_DTYPE, device);
    };
    let seq_len = first.len();
    if let Some(row) = valid.iter().find(|row| row.len() != seq_len) {
        bail!(
            "all validity rows must share seq_len {seq_len}, found a row of length {}",
            row.len()
        );
    }

    let data: Vec<u8> = valid
        .iter()
        .flat_map(|row| row.iter().map(|&keep| u8::from(keep)))
        .collect();
    Tensor::from_vec(data, (valid.len(), seq_len), device)
}
