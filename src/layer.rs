//! The multi-head attention layer.
//!
//! Inputs are projected once with shared kernels, split into `head_num`
//! contiguous slices of the joint feature axis, attended per head, merged back
//! in head order and projected with `Wo`. The activation, when configured, is
//! applied after every projection.

use std::fmt;
use std::sync::Arc;

use attention::{Attention, AttentionOutput, Config as AttentionConfig, ScaledDotProductAttention};
use candle_core::{Tensor, Var, D};
use layers::{
    activations, constraints, initializers, linear, regularizers, Activation, Constraint,
    CustomObjects, Initializer, PrecisionPolicy, Regularizer, WeightStore,
};
use serde_json::{Map, Value};

use crate::config::{HeadDispatch, MultiHeadAttentionConfig};
use crate::error::{MultiHeadAttentionError, Result};
use crate::heads::{plan_heads, HeadContext};
use crate::inputs::{AttentionInputs, InputMask};
use crate::shape::{InputShape, TensorShape};

/// The four projection kernels of a built layer.
#[derive(Debug, Clone)]
pub struct ProjectionWeights {
    /// `[query_dim, feature_dim]`
    pub wq: Var,
    /// `[key_dim, feature_dim]`
    pub wk: Var,
    /// `[value_dim, feature_dim]`
    pub wv: Var,
    /// `[feature_dim, feature_dim]`
    pub wo: Var,
}

impl ProjectionWeights {
    /// Kernels in `Wq, Wk, Wv, Wo` order.
    pub fn iter(&self) -> impl Iterator<Item = &Var> {
        [&self.wq, &self.wk, &self.wv, &self.wo].into_iter()
    }
}

#[derive(Debug)]
struct Built {
    query_dim: usize,
    key_dim: usize,
    feature_dim: usize,
    head_dim: usize,
    heads: Vec<HeadContext>,
    weights: ProjectionWeights,
}

pub struct MultiHeadAttention {
    config: MultiHeadAttentionConfig,
    store: WeightStore,
    custom_objects: CustomObjects,
    activation: Option<Arc<dyn Activation>>,
    initializer: Arc<dyn Initializer>,
    regularizer: Option<Arc<dyn Regularizer>>,
    constraint: Option<Arc<dyn Constraint>>,
    attention: Arc<dyn Attention>,
    built: Option<Built>,
}

impl fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("built", &self.built)
            .finish_non_exhaustive()
    }
}

impl MultiHeadAttention {
    /// Creates an unbuilt layer whose weights will live in `store`.
    pub fn new(config: MultiHeadAttentionConfig, store: WeightStore) -> Result<Self> {
        Self::with_custom_objects(config, store, CustomObjects::default())
    }

    /// Like [`new`](Self::new), resolving custom strategy names in `custom_objects`.
    pub fn with_custom_objects(
        config: MultiHeadAttentionConfig,
        store: WeightStore,
        custom_objects: CustomObjects,
    ) -> Result<Self> {
        config.validate()?;

        let activation = config
            .activation
            .as_ref()
            .map(|kind| activations::get(kind, &custom_objects))
            .transpose()?;
        let initializer = initializers::get(&config.kernel_initializer, &custom_objects)?;
        let regularizer = config
            .kernel_regularizer
            .as_ref()
            .map(|kind| regularizers::get(kind, &custom_objects))
            .transpose()?;
        let constraint = config
            .kernel_constraint
            .as_ref()
            .map(|kind| constraints::get(kind, &custom_objects))
            .transpose()?;

        Ok(Self {
            config,
            store,
            custom_objects,
            activation,
            initializer,
            regularizer,
            constraint,
            attention: Arc::new(ScaledDotProductAttention::new()),
            built: None,
        })
    }

    /// Replaces the per-head attention kernel.
    pub fn with_attention(mut self, attention: Arc<dyn Attention>) -> Self {
        self.attention = attention;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &MultiHeadAttentionConfig {
        &self.config
    }

    pub fn store(&self) -> &WeightStore {
        &self.store
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    /// Head contexts in head order; empty until the layer is built.
    pub fn heads(&self) -> &[HeadContext] {
        self.built.as_ref().map(|b| b.heads.as_slice()).unwrap_or(&[])
    }

    pub fn weights(&self) -> Option<&ProjectionWeights> {
        self.built.as_ref().map(|b| &b.weights)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.weights()
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Allocates `Wq`, `Wk`, `Wv` and `Wo` for `input_shape`.
    pub fn build(&mut self, input_shape: impl Into<InputShape>) -> Result<()> {
        if self.built.is_some() {
            return Err(MultiHeadAttentionError::AlreadyBuilt {
                name: self.config.name.clone(),
            });
        }

        let input_shape = input_shape.into();
        let (query, key, value) = input_shape.roles();
        let query_dim = known_feature_dim("query", query)?;
        let key_dim = known_feature_dim("key", key)?;
        let feature_dim = known_feature_dim("value", value)?;

        let head_num = self.config.head_num;
        if feature_dim % head_num != 0 {
            return Err(MultiHeadAttentionError::InvalidHeadNum {
                head_num,
                feature_dim,
            });
        }
        let head_dim = feature_dim / head_num;

        let name = &self.config.name;
        let init = self.initializer.as_ref();
        let weights = ProjectionWeights {
            wq: self.store.add_weight(&format!("{name}_Wq"), (query_dim, feature_dim), init)?,
            wk: self.store.add_weight(&format!("{name}_Wk"), (key_dim, feature_dim), init)?,
            wv: self.store.add_weight(&format!("{name}_Wv"), (feature_dim, feature_dim), init)?,
            wo: self.store.add_weight(&format!("{name}_Wo"), (feature_dim, feature_dim), init)?,
        };
        let heads = plan_heads(name, head_num, head_dim);

        log::debug!(
            "{name}: built query={query} key={key} value={value} heads={head_num} head_dim={head_dim}"
        );

        self.built = Some(Built {
            query_dim,
            key_dim,
            feature_dim,
            head_dim,
            heads,
            weights,
        });
        Ok(())
    }

    /// Output shape for `input_shape`: the query's leading dims followed by
    /// the value feature dim.
    pub fn compute_output_shape(&self, input_shape: &InputShape) -> Result<TensorShape> {
        let (query, _, value) = input_shape.roles();
        if query.rank() == 0 {
            return Err(MultiHeadAttentionError::InvalidInputShape(
                "query shape must have at least one axis".into(),
            ));
        }
        Ok(query.with_feature_dim(value.feature_dim()))
    }

    /// Mask carried by the output: the query mask, or the single shared mask.
    pub fn compute_mask(&self, mask: Option<InputMask<'_>>) -> Option<Tensor> {
        mask.and_then(|m| m.output_mask()).cloned()
    }

    pub fn forward<'a>(&self, inputs: impl Into<AttentionInputs<'a>>) -> Result<Tensor> {
        Ok(self.forward_with_mask(inputs, None)?.output)
    }

    /// Runs the layer and returns the output with its propagated mask.
    pub fn forward_with_mask<'a>(
        &self,
        inputs: impl Into<AttentionInputs<'a>>,
        mask: Option<InputMask<'_>>,
    ) -> Result<AttentionOutput> {
        let built = self.built.as_ref().ok_or_else(|| MultiHeadAttentionError::NotBuilt {
            name: self.config.name.clone(),
        })?;
        let (query, key, value) = inputs.into().roles();
        check_input("query", query, built.query_dim)?;
        check_input("key", key, built.key_dim)?;
        match value.dims() {
            [_, _, dim] if *dim == built.feature_dim => {}
            [_, _, dim] => {
                return Err(MultiHeadAttentionError::FeatureDimMismatch {
                    expected: built.feature_dim,
                    actual: *dim,
                })
            }
            dims => return Err(rank_error("value", dims)),
        }

        let policy = self.store.policy();
        let w = &built.weights;
        let q = self.project(query, &w.wq, &policy)?;
        let k = self.project(key, &w.wk, &policy)?;
        let v = self.project(value, &w.wv, &policy)?;

        let masks = mask.map(|m| m.attention_masks()).unwrap_or_default();
        let attention_config = AttentionConfig {
            history_only: self.config.history_only,
        };

        let merged = match self.config.head_dispatch {
            HeadDispatch::PerHead => {
                let mut outputs = Vec::with_capacity(built.heads.len());
                for head in &built.heads {
                    log::trace!("{}: dispatch [{}, {})", head.name, head.begin, head.end);
                    let slice = |t: &Tensor| t.narrow(D::Minus1, head.begin, head.width());
                    let out = self.attention.attend(
                        &slice(&q)?,
                        &slice(&k)?,
                        &slice(&v)?,
                        masks,
                        &attention_config,
                    )?;
                    outputs.push(out.output);
                }
                Tensor::cat(&outputs, D::Minus1)?
            }
            HeadDispatch::Batched => {
                log::trace!("{}: dispatch {} heads batched", self.config.name, built.heads.len());
                let heads = self.config.head_num;
                let out = self.attention.attend(
                    &split_heads(&q, heads, built.head_dim)?,
                    &split_heads(&k, heads, built.head_dim)?,
                    &split_heads(&v, heads, built.head_dim)?,
                    masks,
                    &attention_config,
                )?;
                merge_heads(&out.output, built.feature_dim)?
            }
        };

        let output = self.project(&merged, &w.wo, &policy)?;
        Ok(AttentionOutput {
            output,
            mask: self.compute_mask(mask),
        })
    }

    /// Builds from the concrete input shapes on first use, then runs forward.
    pub fn call<'a>(
        &mut self,
        inputs: impl Into<AttentionInputs<'a>>,
        mask: Option<InputMask<'_>>,
    ) -> Result<AttentionOutput> {
        let inputs = inputs.into();
        if !self.is_built() {
            self.build(inputs.shape())?;
        }
        self.forward_with_mask(inputs, mask)
    }

    /// Sum of the kernel regularizer penalties over the four kernels; zero
    /// when no regularizer is configured.
    pub fn regularization_loss(&self) -> Result<Tensor> {
        let built = self.built.as_ref().ok_or_else(|| MultiHeadAttentionError::NotBuilt {
            name: self.config.name.clone(),
        })?;
        let Some(regularizer) = &self.regularizer else {
            return Ok(Tensor::zeros((), self.store.dtype(), self.store.device())?);
        };

        let mut total: Option<Tensor> = None;
        for var in built.weights.iter() {
            let penalty = regularizer.penalty(var.as_tensor())?;
            total = Some(match total {
                Some(acc) => acc.add(&penalty)?,
                None => penalty,
            });
        }
        match total {
            Some(total) => Ok(total),
            None => Ok(Tensor::zeros((), self.store.dtype(), self.store.device())?),
        }
    }

    /// Projects every kernel through the configured constraint, in place.
    pub fn apply_constraints(&self) -> Result<()> {
        let Some(constraint) = &self.constraint else {
            return Ok(());
        };
        for var in self.trainable_vars() {
            let constrained = constraint.apply(var.as_tensor())?;
            var.set(&constrained)?;
        }
        Ok(())
    }

    /// Flat mapping of the construction parameters.
    pub fn get_config(&self) -> Result<Map<String, Value>> {
        self.config.to_map()
    }

    /// Rebuilds an equivalent, unbuilt layer from [`get_config`](Self::get_config) output.
    pub fn from_config(
        map: Map<String, Value>,
        store: WeightStore,
        custom_objects: CustomObjects,
    ) -> Result<Self> {
        let config = MultiHeadAttentionConfig::from_map(map)?;
        Self::with_custom_objects(config, store, custom_objects)
    }

    /// Registry this layer resolved its strategies from.
    pub fn custom_objects(&self) -> &CustomObjects {
        &self.custom_objects
    }

    fn project(&self, input: &Tensor, kernel: &Var, policy: &PrecisionPolicy) -> Result<Tensor> {
        let projected = linear::dot(input, kernel.as_tensor(), policy)?;
        match &self.activation {
            Some(activation) => Ok(activation.forward(&projected, policy)?),
            None => Ok(projected),
        }
    }
}

fn known_feature_dim(role: &str, shape: &TensorShape) -> Result<usize> {
    if shape.rank() != 3 {
        return Err(MultiHeadAttentionError::InvalidInputShape(format!(
            "{role} shape must be (batch, seq_len, feature_dim), got {shape}"
        )));
    }
    match shape.feature_dim() {
        Some(0) | None => Err(MultiHeadAttentionError::InvalidInputShape(format!(
            "{role} feature dim must be known and non-zero, got {shape}"
        ))),
        Some(dim) => Ok(dim),
    }
}

fn rank_error(role: &str, dims: &[usize]) -> MultiHeadAttentionError {
    MultiHeadAttentionError::InvalidInputShape(format!(
        "{role} must be [batch, seq_len, feature_dim], got {dims:?}"
    ))
}

fn check_input(role: &str, tensor: &Tensor, feature_dim: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, dim] if *dim == feature_dim => Ok(()),
        [_, _, dim] => Err(MultiHeadAttentionError::InvalidInputShape(format!(
            "{role} feature dim {dim} does not match the built dim {feature_dim}"
        ))),
        dims => Err(rank_error(role, dims)),
    }
}

/// `[batch, seq, heads * head_dim]` to `[batch, heads, seq, head_dim]`.
fn split_heads(tensor: &Tensor, heads: usize, head_dim: usize) -> Result<Tensor> {
    let (batch, seq, _) = tensor.dims3()?;
    Ok(tensor
        .reshape((batch, seq, heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?)
}

/// Inverse of [`split_heads`].
fn merge_heads(tensor: &Tensor, feature_dim: usize) -> Result<Tensor> {
    let (batch, _, seq, _) = tensor.dims4()?;
    Ok(tensor
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, seq, feature_dim))?)
}
