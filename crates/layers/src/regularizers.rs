//! Weight regularisation penalties.
//!
//! A regularizer maps a kernel to a scalar penalty that the surrounding
//! training loop adds to its loss. Layers only collect the penalties; they
//! never apply them on their own.

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::{CustomObjects, LayerError};

/// Identifies a regularisation penalty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum RegularizerKind {
    /// `l1 * sum(|w|)`
    L1 { l1: f64 },
    /// `l2 * sum(w^2)`
    L2 { l2: f64 },
    L1L2 { l1: f64, l2: f64 },
    /// User supplied regularizer looked up by name.
    Custom { name: String },
}

const DEFAULT_FACTOR: f64 = 0.01;

impl FromStr for RegularizerKind {
    type Err = Infallible;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match name {
            "l1" => RegularizerKind::L1 { l1: DEFAULT_FACTOR },
            "l2" => RegularizerKind::L2 { l2: DEFAULT_FACTOR },
            "l1_l2" => RegularizerKind::L1L2 {
                l1: DEFAULT_FACTOR,
                l2: DEFAULT_FACTOR,
            },
            other => RegularizerKind::Custom {
                name: other.to_string(),
            },
        })
    }
}

pub trait Regularizer: Send + Sync {
    fn kind(&self) -> RegularizerKind;

    /// Returns the scalar penalty contributed by `weight`.
    fn penalty(&self, weight: &Tensor) -> Result<Tensor>;
}

struct BuiltinRegularizer {
    kind: RegularizerKind,
}

fn l1_term(weight: &Tensor, factor: f64) -> Result<Tensor> {
    weight.abs()?.sum_all()?.affine(factor, 0.0)
}

fn l2_term(weight: &Tensor, factor: f64) -> Result<Tensor> {
    weight.sqr()?.sum_all()?.affine(factor, 0.0)
}

impl Regularizer for BuiltinRegularizer {
    fn kind(&self) -> RegularizerKind {
        self.kind.clone()
    }

    fn penalty(&self, weight: &Tensor) -> Result<Tensor> {
        match &self.kind {
            RegularizerKind::L1 { l1 } => l1_term(weight, *l1),
            RegularizerKind::L2 { l2 } => l2_term(weight, *l2),
            RegularizerKind::L1L2 { l1, l2 } => l1_term(weight, *l1)?.add(&l2_term(weight, *l2)?),
            RegularizerKind::Custom { name } => {
                candle_core::bail!("custom regularizer `{name}` has no built-in penalty")
            }
        }
    }
}

struct FnRegularizer<F> {
    name: String,
    func: F,
}

impl<F> Regularizer for FnRegularizer<F>
where
    F: Fn(&Tensor) -> Result<Tensor> + Send + Sync,
{
    fn kind(&self) -> RegularizerKind {
        RegularizerKind::Custom {
            name: self.name.clone(),
        }
    }

    fn penalty(&self, weight: &Tensor) -> Result<Tensor> {
        (self.func)(weight)
    }
}

pub fn builtin(kind: RegularizerKind) -> Arc<dyn Regularizer> {
    Arc::new(BuiltinRegularizer { kind })
}

/// Wraps `func` as a named regularizer that can be registered in
/// [`CustomObjects`].
pub fn custom<F>(name: impl Into<String>, func: F) -> Arc<dyn Regularizer>
where
    F: Fn(&Tensor) -> Result<Tensor> + Send + Sync + 'static,
{
    Arc::new(FnRegularizer {
        name: name.into(),
        func,
    })
}

/// Resolves `kind` to an implementation, consulting `custom` for user names.
pub fn get(
    kind: &RegularizerKind,
    custom: &CustomObjects,
) -> std::result::Result<Arc<dyn Regularizer>, LayerError> {
    match kind {
        RegularizerKind::Custom { name } => {
            custom
                .regularizer(name)
                .ok_or_else(|| LayerError::UnknownObject {
                    category: "regularizer",
                    name: name.clone(),
                })
        }
        other => Ok(builtin(other.clone())),
    }
}
