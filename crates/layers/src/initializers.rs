//! Kernel initialisation strategies.
//!
//! Kernels are laid out `[fan_in, fan_out]`. The variance-scaling families
//! (Glorot, He, LeCun) sample in `f32` before casting to the requested dtype.
//! Their normal variants draw from a normal truncated at two standard
//! deviations, with the standard deviation widened so the truncated
//! distribution keeps the target variance.

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::{CustomObjects, LayerError};

/// Standard deviation of a unit normal truncated to `[-2, 2]`.
const TRUNCATED_STDDEV: f64 = 0.879_625_661_034_239_8;

/// Redraw rounds before any remaining outlier is clamped to the bound.
const TRUNCATION_ROUNDS: usize = 16;

/// Samples `N(0, std^2)` restricted to `[-2 std, 2 std]` by redrawing outliers.
fn truncated_normal(std: f64, shape: (usize, usize), device: &Device) -> Result<Tensor> {
    let bound = 2.0 * std;
    let mut values = Tensor::randn(0f32, std as f32, shape, device)?;
    for _ in 0..TRUNCATION_ROUNDS {
        let outside = values.abs()?.gt(bound)?;
        if outside.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()? == 0 {
            return Ok(values);
        }
        let redraw = Tensor::randn(0f32, std as f32, shape, device)?;
        values = outside.where_cond(&redraw, &values)?;
    }
    values.clamp(-bound, bound)
}

/// Identifies an initialisation strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum InitializerKind {
    Zeros,
    Ones,
    Constant { value: f64 },
    RandomNormal { mean: f64, stddev: f64 },
    RandomUniform { minval: f64, maxval: f64 },
    /// Normal with `stddev = sqrt(2 / (fan_in + fan_out))`.
    GlorotNormal,
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform,
    /// Normal with `stddev = sqrt(2 / fan_in)`.
    HeNormal,
    /// Uniform in `±sqrt(6 / fan_in)`.
    HeUniform,
    /// Normal with `stddev = sqrt(1 / fan_in)`.
    LecunNormal,
    /// Uniform in `±sqrt(3 / fan_in)`.
    LecunUniform,
    /// User supplied initializer looked up by name.
    Custom { name: String },
}

impl Default for InitializerKind {
    fn default() -> Self {
        InitializerKind::GlorotNormal
    }
}

impl FromStr for InitializerKind {
    type Err = Infallible;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match name {
            "zeros" => InitializerKind::Zeros,
            "ones" => InitializerKind::Ones,
            "constant" => InitializerKind::Constant { value: 0.0 },
            "random_normal" => InitializerKind::RandomNormal {
                mean: 0.0,
                stddev: 0.05,
            },
            "random_uniform" => InitializerKind::RandomUniform {
                minval: -0.05,
                maxval: 0.05,
            },
            "glorot_normal" => InitializerKind::GlorotNormal,
            "glorot_uniform" => InitializerKind::GlorotUniform,
            "he_normal" => InitializerKind::HeNormal,
            "he_uniform" => InitializerKind::HeUniform,
            "lecun_normal" => InitializerKind::LecunNormal,
            "lecun_uniform" => InitializerKind::LecunUniform,
            other => InitializerKind::Custom {
                name: other.to_string(),
            },
        })
    }
}

/// Produces the initial value of a kernel.
pub trait Initializer: Send + Sync {
    fn kind(&self) -> InitializerKind;

    /// Samples a `shape = (fan_in, fan_out)` kernel on `device` with `dtype`.
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor>;
}

struct BuiltinInitializer {
    kind: InitializerKind,
}

impl Initializer for BuiltinInitializer {
    fn kind(&self) -> InitializerKind {
        self.kind.clone()
    }

    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (fan_in, fan_out) = (shape.0 as f64, shape.1 as f64);
        let normal = |variance: f64| truncated_normal(variance.sqrt() / TRUNCATED_STDDEV, shape, device);
        let uniform = |limit: f64| Tensor::rand(-limit as f32, limit as f32, shape, device);

        let weight_f32 = match &self.kind {
            InitializerKind::Zeros => Tensor::zeros(shape, DType::F32, device)?,
            InitializerKind::Ones => Tensor::ones(shape, DType::F32, device)?,
            InitializerKind::Constant { value } => Tensor::full(*value as f32, shape, device)?,
            InitializerKind::RandomNormal { mean, stddev } => {
                Tensor::randn(*mean as f32, *stddev as f32, shape, device)?
            }
            InitializerKind::RandomUniform { minval, maxval } => {
                Tensor::rand(*minval as f32, *maxval as f32, shape, device)?
            }
            InitializerKind::GlorotNormal => normal(2.0 / (fan_in + fan_out))?,
            InitializerKind::GlorotUniform => uniform((6.0 / (fan_in + fan_out)).sqrt())?,
            InitializerKind::HeNormal => normal(2.0 / fan_in)?,
            InitializerKind::HeUniform => uniform((6.0 / fan_in).sqrt())?,
            InitializerKind::LecunNormal => normal(1.0 / fan_in)?,
            InitializerKind::LecunUniform => uniform((3.0 / fan_in).sqrt())?,
            InitializerKind::Custom { name } => {
                candle_core::bail!("custom initializer `{name}` has no built-in sampler")
            }
        };
        if dtype == DType::F32 {
            Ok(weight_f32)
        } else {
            weight_f32.to_dtype(dtype)
        }
    }
}

struct FnInitializer<F> {
    name: String,
    func: F,
}

impl<F> Initializer for FnInitializer<F>
where
    F: Fn((usize, usize), &Device, DType) -> Result<Tensor> + Send + Sync,
{
    fn kind(&self) -> InitializerKind {
        InitializerKind::Custom {
            name: self.name.clone(),
        }
    }

    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        (self.func)(shape, device, dtype)
    }
}

pub fn builtin(kind: InitializerKind) -> Arc<dyn Initializer> {
    Arc::new(BuiltinInitializer { kind })
}

/// Wraps `func` as a named initializer that can be registered in
/// [`CustomObjects`].
pub fn custom<F>(name: impl Into<String>, func: F) -> Arc<dyn Initializer>
where
    F: Fn((usize, usize), &Device, DType) -> Result<Tensor> + Send + Sync + 'static,
{
    Arc::new(FnInitializer {
        name: name.into(),
        func,
    })
}

/// Resolves `kind` to an implementation, consulting `custom` for user names.
pub fn get(
    kind: &InitializerKind,
    custom: &CustomObjects,
) -> std::result::Result<Arc<dyn Initializer>, LayerError> {
    match kind {
        InitializerKind::Custom { name } => {
            custom
                .initializer(name)
                .ok_or_else(|| LayerError::UnknownObject {
                    category: "initializer",
                    name: name.clone(),
                })
        }
        other => Ok(builtin(other.clone())),
    }
}
