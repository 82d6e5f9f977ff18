//! Mask utilities shared by attention implementations.
//!
//! Two kinds of mask live here: multiplicative causal masks shaped
//! `[q_len, k_len]` with dtype [`MASK_DTYPE`], and per-position validity masks
//! shaped `[batch, seq_len]` (see [`padding`]).

pub mod causal;
pub mod padding;

use candle_core::DType;

/// Dtype shared by multiplicative masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::build_causal_mask;
pub use padding::{mask_from_booleans, mask_from_lengths, VALIDITY_DTYPE};
