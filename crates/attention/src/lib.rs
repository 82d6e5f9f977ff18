//! Scaled dot-product attention primitives.
//!
//! The crate defines a portable API for computing
//! `softmax(Q·Kᵀ / sqrt(d))·V` over tensors laid out as
//! `[..leading, seq_len, dim]`. Inputs may be bf16, f16, f32 or f64;
//! reductions run in at least `f32` and the output matches the input dtype.
//!
//! Causal (history-only) masking is a per-call flag on [`Config`]. Padding is
//! expressed through per-position validity masks, see [`AttentionMasks`] and
//! the builders in [`masks`].

pub mod core;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionError, AttentionMasks, AttentionOutput, Config};
pub use reference::ScaledDotProductAttention;
