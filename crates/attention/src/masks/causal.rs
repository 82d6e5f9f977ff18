//! Builders for causal (history-only) attention masks.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[q_len, k_len]`. Entries are `1.0` where attention is permitted and `0.0`
//! otherwise, so they can be multiplied into unnormalised attention weights.

use candle_core::{Device, Result, Tensor};

/// Construct a causal mask for the supplied sequence lengths.
///
/// Query `i` may attend to key `j` only when `j <= i`. Queries and keys are
/// aligned at position zero; keys beyond the last query are never visible.
pub fn build_causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let mut data = vec![0f32; q_len * k_len];
    for q in 0..q_len {
        let row_start = q * k_len;
        for k in 0..k_len.min(q + 1) {
            data[row_start + k] = 1.0;
        }
    }
    Tensor::from_vec(data, (q_len, k_len), device)
}
