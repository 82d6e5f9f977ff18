//! Runtime inputs and masks of a forward call.

use attention::AttentionMasks;
use candle_core::Tensor;

use crate::shape::{InputShape, TensorShape};

/// Either one tensor used as query, key and value, or one tensor per role.
#[derive(Debug, Clone, Copy)]
pub enum AttentionInputs<'a> {
    Single(&'a Tensor),
    Triple {
        query: &'a Tensor,
        key: &'a Tensor,
        value: &'a Tensor,
    },
}

impl<'a> AttentionInputs<'a> {
    pub fn triple(query: &'a Tensor, key: &'a Tensor, value: &'a Tensor) -> Self {
        Self::Triple { query, key, value }
    }

    /// Returns `(query, key, value)`; a single tensor fills every role.
    pub fn roles(&self) -> (&'a Tensor, &'a Tensor, &'a Tensor) {
        match *self {
            AttentionInputs::Single(t) => (t, t, t),
            AttentionInputs::Triple { query, key, value } => (query, key, value),
        }
    }

    /// Concrete shape descriptor, used to build a layer lazily.
    pub fn shape(&self) -> InputShape {
        match *self {
            AttentionInputs::Single(t) => InputShape::Single(TensorShape::of(t)),
            AttentionInputs::Triple { query, key, value } => InputShape::triple(
                TensorShape::of(query),
                TensorShape::of(key),
                TensorShape::of(value),
            ),
        }
    }
}

impl<'a> From<&'a Tensor> for AttentionInputs<'a> {
    fn from(tensor: &'a Tensor) -> Self {
        Self::Single(tensor)
    }
}

impl<'a> From<[&'a Tensor; 3]> for AttentionInputs<'a> {
    fn from([query, key, value]: [&'a Tensor; 3]) -> Self {
        Self::Triple { query, key, value }
    }
}

/// Validity masks accompanying the inputs, shaped `[batch, seq_len]`.
#[derive(Debug, Clone, Copy)]
pub enum InputMask<'a> {
    /// One mask shared by every role.
    Single(&'a Tensor),
    /// One optional mask per role.
    Triple {
        query: Option<&'a Tensor>,
        key: Option<&'a Tensor>,
        value: Option<&'a Tensor>,
    },
}

impl<'a> InputMask<'a> {
    /// Mask carried by the layer output: the query-side mask.
    pub fn output_mask(&self) -> Option<&'a Tensor> {
        match *self {
            InputMask::Single(mask) => Some(mask),
            InputMask::Triple { query, .. } => query,
        }
    }

    /// Masks handed to each head's attention call.
    pub fn attention_masks(&self) -> AttentionMasks<'a> {
        match *self {
            InputMask::Single(mask) => AttentionMasks {
                query: Some(mask),
                key: Some(mask),
            },
            InputMask::Triple { query, key, .. } => AttentionMasks { query, key },
        }
    }
}

impl<'a> From<&'a Tensor> for InputMask<'a> {
    fn from(mask: &'a Tensor) -> Self {
        Self::Single(mask)
    }
}
