//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors laid out as `[..leading, seq_len, dim]`.
//! The leading axes are typically `[batch]` for a single head slice or
//! `[batch, n_heads]` when every head is evaluated in one call. The output
//! mirrors the query layout, with the trailing dimension taken from `v`.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Per-position validity masks accompanying an attention call.
///
/// Each mask is shaped `[batch, seq_len]`; non-zero entries mark valid
/// positions. Only the key mask influences the attention weights, the query
/// mask is handed back untouched alongside the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttentionMasks<'a> {
    pub query: Option<&'a Tensor>,
    pub key: Option<&'a Tensor>,
}

impl<'a> AttentionMasks<'a> {
    /// No masking on either side.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Result of a single attention evaluation.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Attention-weighted values, `[..leading, q_len, head_dim]`.
    pub output: Tensor,
    /// Mask propagated with the output (the query mask).
    pub mask: Option<Tensor>,
}

/// Unified interface for attention kernels.
///
/// * `q`, `k` and `v` share rank and leading dimensions.
/// * `q` and `k` share the trailing dimension; `k` and `v` share `seq_len`.
/// * Key masks must be shaped `[batch, k_len]` and broadcast over any extra
///   leading axes.
/// * Reductions are performed in at least `f32`.
pub trait Attention: Send + Sync {
    /// Compute scaled dot-product attention, optionally restricted to history.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        masks: AttentionMasks<'_>,
        config: &Config,
    ) -> Result<AttentionOutput, AttentionError>;
}
