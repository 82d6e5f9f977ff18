//! Error type for the multi-head attention layer.

use attention::AttentionError;
use layers::LayerError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MultiHeadAttentionError>;

#[derive(Debug, Error)]
pub enum MultiHeadAttentionError {
    /// The construction parameters are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The value feature dimension cannot be split evenly across heads.
    #[error("Invalid head number {head_num} with the given input dim {feature_dim}")]
    InvalidHeadNum { head_num: usize, feature_dim: usize },
    #[error("invalid input shape: {0}")]
    InvalidInputShape(String),
    #[error("layer `{name}` has already been built")]
    AlreadyBuilt { name: String },
    #[error("layer `{name}` must be built before it is evaluated")]
    NotBuilt { name: String },
    /// The runtime value feature dimension differs from the one used at build.
    #[error("value feature dim {actual} does not match the built feature dim {expected}")]
    FeatureDimMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}
