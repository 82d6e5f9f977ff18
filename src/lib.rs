//! Keras-style multi-head attention layer on candle.
//!
//! A [`MultiHeadAttention`] layer projects its query, key and value inputs with
//! shared kernels, splits the joint feature axis evenly across `head_num`
//! heads, runs scaled dot-product attention per head, concatenates the head
//! outputs in order and applies an output projection.
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use multi_head_attention::{MultiHeadAttention, MultiHeadAttentionConfig, WeightStore};
//!
//! # fn main() -> multi_head_attention::Result<()> {
//! let config = MultiHeadAttentionConfig::named("encoder_attn", 4);
//! let mut layer = MultiHeadAttention::new(config, WeightStore::cpu())?;
//! let x = Tensor::zeros((2, 10, 32), DType::F32, &Device::Cpu)?;
//! let out = layer.call(&x, None)?;
//! assert_eq!(out.output.dims(), &[2, 10, 32]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod heads;
pub mod inputs;
pub mod layer;
pub mod shape;

pub use attention;
pub use layers;

pub use attention::{Attention, AttentionMasks, AttentionOutput, ScaledDotProductAttention};
pub use config::{HeadDispatch, MultiHeadAttentionConfig};
pub use error::{MultiHeadAttentionError, Result};
pub use heads::HeadContext;
pub use inputs::{AttentionInputs, InputMask};
pub use layer::{MultiHeadAttention, ProjectionWeights};
pub use layers::{
    ActivationKind, ConstraintKind, CustomObjects, InitializerKind, RegularizerKind, WeightStore,
};
pub use shape::{Dim, InputShape, TensorShape};
