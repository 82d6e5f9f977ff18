//! Projections applied to kernels after each optimisation step.
//!
//! Norms are taken along `axis` of the `[fan_in, fan_out]` kernel (axis 0
//! constrains the incoming weight vector of every output unit).

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::{CustomObjects, LayerError};

const EPSILON: f64 = 1e-7;

/// Identifies a weight constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum ConstraintKind {
    /// Rescales vectors whose norm exceeds `max_value`.
    MaxNorm { max_value: f64, axis: usize },
    /// Zeroes negative entries.
    NonNeg,
    /// Rescales vectors to unit norm.
    UnitNorm { axis: usize },
    /// Pulls norms into `[min_value, max_value]` at the given `rate`.
    MinMaxNorm {
        min_value: f64,
        max_value: f64,
        rate: f64,
        axis: usize,
    },
    /// User supplied constraint looked up by name.
    Custom { name: String },
}

impl FromStr for ConstraintKind {
    type Err = Infallible;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match name {
            "max_norm" => ConstraintKind::MaxNorm {
                max_value: 2.0,
                axis: 0,
            },
            "non_neg" => ConstraintKind::NonNeg,
            "unit_norm" => ConstraintKind::UnitNorm { axis: 0 },
            "min_max_norm" => ConstraintKind::MinMaxNorm {
                min_value: 0.0,
                max_value: 1.0,
                rate: 1.0,
                axis: 0,
            },
            other => ConstraintKind::Custom {
                name: other.to_string(),
            },
        })
    }
}

pub trait Constraint: Send + Sync {
    fn kind(&self) -> ConstraintKind;

    /// Returns the projected kernel.
    fn apply(&self, weight: &Tensor) -> Result<Tensor>;
}

struct BuiltinConstraint {
    kind: ConstraintKind,
}

fn norms(weight: &Tensor, axis: usize) -> Result<Tensor> {
    weight.sqr()?.sum_keepdim(axis)?.sqrt()
}

/// `clip(x, min, max)` expressed with relus.
fn clip(x: &Tensor, min: f64, max: f64) -> Result<Tensor> {
    let above_min = x.affine(1.0, -min)?.relu()?;
    let above_max = x.affine(1.0, -max)?.relu()?;
    above_min.sub(&above_max)?.affine(1.0, min)
}

fn rescale(weight: &Tensor, desired: &Tensor, norms: &Tensor) -> Result<Tensor> {
    let factor = desired.div(&norms.affine(1.0, EPSILON)?)?;
    weight.broadcast_mul(&factor)
}

impl Constraint for BuiltinConstraint {
    fn kind(&self) -> ConstraintKind {
        self.kind.clone()
    }

    fn apply(&self, weight: &Tensor) -> Result<Tensor> {
        match &self.kind {
            ConstraintKind::MaxNorm { max_value, axis } => {
                let norms = norms(weight, *axis)?;
                let desired = clip(&norms, 0.0, *max_value)?;
                rescale(weight, &desired, &norms)
            }
            ConstraintKind::NonNeg => weight.relu(),
            ConstraintKind::UnitNorm { axis } => {
                let norms = norms(weight, *axis)?;
                weight.broadcast_div(&norms.affine(1.0, EPSILON)?)
            }
            ConstraintKind::MinMaxNorm {
                min_value,
                max_value,
                rate,
                axis,
            } => {
                let norms = norms(weight, *axis)?;
                let clipped = clip(&norms, *min_value, *max_value)?;
                let desired = clipped
                    .affine(*rate, 0.0)?
                    .add(&norms.affine(1.0 - *rate, 0.0)?)?;
                rescale(weight, &desired, &norms)
            }
            ConstraintKind::Custom { name } => {
                candle_core::bail!("custom constraint `{name}` has no built-in projection")
            }
        }
    }
}

struct FnConstraint<F> {
    name: String,
    func: F,
}

impl<F> Constraint for FnConstraint<F>
where
    F: Fn(&Tensor) -> Result<Tensor> + Send + Sync,
{
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Custom {
            name: self.name.clone(),
        }
    }

    fn apply(&self, weight: &Tensor) -> Result<Tensor> {
        (self.func)(weight)
    }
}

pub fn builtin(kind: ConstraintKind) -> Arc<dyn Constraint> {
    Arc::new(BuiltinConstraint { kind })
}

/// Wraps `func` as a named constraint that can be registered in
/// [`CustomObjects`].
pub fn custom<F>(name: impl Into<String>, func: F) -> Arc<dyn Constraint>
where
    F: Fn(&Tensor) -> Result<Tensor> + Send + Sync + 'static,
{
    Arc::new(FnConstraint {
        name: name.into(),
        func,
    })
}

/// Resolves `kind` to an implementation, consulting `custom` for user names.
pub fn get(
    kind: &ConstraintKind,
    custom: &CustomObjects,
) -> std::result::Result<Arc<dyn Constraint>, LayerError> {
    match kind {
        ConstraintKind::Custom { name } => {
            custom
                .constraint(name)
                .ok_or_else(|| LayerError::UnknownObject {
                    category: "constraint",
                    name: name.clone(),
                })
        }
        other => Ok(builtin(other.clone())),
    }
}
