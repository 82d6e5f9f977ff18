//! Activation catalogue applied after kernel projections.
//!
//! Activations are elementwise and preserve the input layout. Each
//! implementation promotes inputs to the compute dtype requested by
//! [`PrecisionPolicy`] before evaluating the non-linearity, then casts the
//! result back to the storage dtype.
//!
//! Built-ins are identified by [`ActivationKind`] and serialise as their plain
//! name (`"relu"`, `"tanh"`, ...). Any other name refers to a user supplied
//! function registered through [`CustomObjects`].

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::dtypes::PrecisionPolicy;
use crate::{CustomObjects, LayerError};

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActivationKind {
    /// Identity function.
    Linear,
    Relu,
    /// Exponential linear unit with `alpha = 1`.
    Elu,
    Tanh,
    Sigmoid,
    /// Piecewise linear sigmoid approximation `clip(0.2x + 0.5, 0, 1)`.
    HardSigmoid,
    Softplus,
    Softsign,
    /// GELU using the erf formulation.
    Gelu,
    /// SiLU, a.k.a. swish.
    Silu,
    /// User supplied activation looked up by name.
    Custom(String),
}

impl ActivationKind {
    pub fn name(&self) -> &str {
        match self {
            ActivationKind::Linear => "linear",
            ActivationKind::Relu => "relu",
            ActivationKind::Elu => "elu",
            ActivationKind::Tanh => "tanh",
            ActivationKind::Sigmoid => "sigmoid",
            ActivationKind::HardSigmoid => "hard_sigmoid",
            ActivationKind::Softplus => "softplus",
            ActivationKind::Softsign => "softsign",
            ActivationKind::Gelu => "gelu",
            ActivationKind::Silu => "silu",
            ActivationKind::Custom(name) => name,
        }
    }
}

impl FromStr for ActivationKind {
    type Err = Infallible;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match name {
            "linear" | "identity" => ActivationKind::Linear,
            "relu" => ActivationKind::Relu,
            "elu" => ActivationKind::Elu,
            "tanh" => ActivationKind::Tanh,
            "sigmoid" => ActivationKind::Sigmoid,
            "hard_sigmoid" => ActivationKind::HardSigmoid,
            "softplus" => ActivationKind::Softplus,
            "softsign" => ActivationKind::Softsign,
            "gelu" => ActivationKind::Gelu,
            "silu" | "swish" => ActivationKind::Silu,
            other => ActivationKind::Custom(other.to_string()),
        })
    }
}

impl From<String> for ActivationKind {
    fn from(name: String) -> Self {
        match name.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for ActivationKind {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<ActivationKind> for String {
    fn from(kind: ActivationKind) -> Self {
        kind.name().to_string()
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] used to serialise this activation.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Built-in activation backed by Candle kernels.
struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind.clone()
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if self.kind == ActivationKind::Linear {
            return policy.cast_to_storage(input);
        }
        let x = policy.cast_for_matmul(input)?;
        let y = match &self.kind {
            ActivationKind::Relu => x.relu()?,
            ActivationKind::Elu => x.elu(1.0)?,
            ActivationKind::Tanh => x.tanh()?,
            ActivationKind::Sigmoid => x.neg()?.exp()?.affine(1.0, 1.0)?.recip()?,
            ActivationKind::HardSigmoid => {
                let z = x.affine(0.2, 0.5)?;
                z.relu()?.sub(&z.affine(1.0, -1.0)?.relu()?)?
            }
            // relu(x) + log(1 + exp(-|x|)) stays finite for large inputs.
            ActivationKind::Softplus => {
                let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
                x.relu()?.add(&tail)?
            }
            ActivationKind::Softsign => x.div(&x.abs()?.affine(1.0, 1.0)?)?,
            ActivationKind::Gelu => x.gelu_erf()?,
            ActivationKind::Silu => x.silu()?,
            ActivationKind::Linear => x,
            ActivationKind::Custom(name) => {
                candle_core::bail!("custom activation `{name}` has no built-in kernel")
            }
        };
        policy.cast_to_storage(&y)
    }
}

/// Activation wrapping a user supplied function.
struct FnActivation<F> {
    name: String,
    func: F,
}

impl<F> Activation for FnActivation<F>
where
    F: Fn(&Tensor) -> Result<Tensor> + Send + Sync,
{
    fn kind(&self) -> ActivationKind {
        ActivationKind::Custom(self.name.clone())
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let x = policy.cast_for_matmul(input)?;
        policy.cast_to_storage(&(self.func)(&x)?)
    }
}

/// Returns a shared built-in activation implementation.
///
/// `ActivationKind::Custom` kinds have no built-in kernel; resolve them with
/// [`get`] instead.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

/// Wraps `func` as a named activation that can be registered in
/// [`CustomObjects`].
pub fn custom<F>(name: impl Into<String>, func: F) -> Arc<dyn Activation>
where
    F: Fn(&Tensor) -> Result<Tensor> + Send + Sync + 'static,
{
    Arc::new(FnActivation {
        name: name.into(),
        func,
    })
}

/// Resolves `kind` to an implementation, consulting `custom` for user names.
pub fn get(
    kind: &ActivationKind,
    custom: &CustomObjects,
) -> std::result::Result<Arc<dyn Activation>, LayerError> {
    match kind {
        ActivationKind::Custom(name) => {
            custom
                .activation(name)
                .ok_or_else(|| LayerError::UnknownObject {
                    category: "activation",
                    name: name.clone(),
                })
        }
        other => Ok(builtin(other.clone())),
    }
}
