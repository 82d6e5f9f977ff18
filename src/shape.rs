//! Static shape descriptors used while building a layer.
//!
//! Dimensions may be unknown (`None`), typically the batch axis of a graph
//! input. Feature dimensions must be known by the time a layer is built.

use std::fmt;

use candle_core::Tensor;

use crate::error::{MultiHeadAttentionError, Result};

/// A possibly unknown dimension.
pub type Dim = Option<usize>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorShape(Vec<Dim>);

impl TensorShape {
    pub fn new(dims: Vec<Dim>) -> Self {
        Self(dims)
    }

    /// Shape whose every dimension is known.
    pub fn known(dims: &[usize]) -> Self {
        Self(dims.iter().copied().map(Some).collect())
    }

    /// Shape with an unknown leading batch axis followed by `dims`.
    pub fn batched(dims: &[usize]) -> Self {
        let mut all = Vec::with_capacity(dims.len() + 1);
        all.push(None);
        all.extend(dims.iter().copied().map(Some));
        Self(all)
    }

    /// Concrete shape of `tensor`.
    pub fn of(tensor: &Tensor) -> Self {
        Self::known(tensor.dims())
    }

    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Size of the trailing axis, if the shape has one and it is known.
    pub fn feature_dim(&self) -> Dim {
        self.0.last().copied().flatten()
    }

    /// Copy of this shape with the trailing axis replaced by `dim`.
    pub fn with_feature_dim(&self, dim: Dim) -> Self {
        let mut dims = self.0.clone();
        match dims.last_mut() {
            Some(last) => *last = dim,
            None => dims.push(dim),
        }
        Self(dims)
    }
}

impl From<Vec<Dim>> for TensorShape {
    fn from(dims: Vec<Dim>) -> Self {
        Self(dims)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, dim) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match dim {
                Some(d) => write!(f, "{d}")?,
                None => f.write_str("None")?,
            }
        }
        f.write_str(")")
    }
}

/// Shape(s) a layer is built from: one shared shape for self-attention or a
/// separate shape per query/key/value role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputShape {
    Single(TensorShape),
    Triple {
        query: TensorShape,
        key: TensorShape,
        value: TensorShape,
    },
}

impl InputShape {
    pub fn triple(query: TensorShape, key: TensorShape, value: TensorShape) -> Self {
        Self::Triple { query, key, value }
    }

    /// Builds a triple from a list, which must hold exactly three shapes.
    pub fn from_list(shapes: Vec<TensorShape>) -> Result<Self> {
        let count = shapes.len();
        match <[TensorShape; 3]>::try_from(shapes) {
            Ok([query, key, value]) => Ok(Self::Triple { query, key, value }),
            Err(_) => Err(MultiHeadAttentionError::InvalidInputShape(format!(
                "expected a list of 3 shapes (query, key, value), got {count}"
            ))),
        }
    }

    /// Returns `(query, key, value)`; a single shape fills every role.
    pub fn roles(&self) -> (&TensorShape, &TensorShape, &TensorShape) {
        match self {
            InputShape::Single(shape) => (shape, shape, shape),
            InputShape::Triple { query, key, value } => (query, key, value),
        }
    }
}

impl From<TensorShape> for InputShape {
    fn from(shape: TensorShape) -> Self {
        Self::Single(shape)
    }
}
