//! Reference scaled dot-product attention kernel.
//!
//! Weights are computed as `exp(s - max(s))` with `s = Q·Kᵀ / sqrt(d)`, where
//! the max runs over visible keys only (future keys under causal masking and
//! padded keys are hidden). Hidden entries are zeroed and the weights are
//! normalised with a small epsilon in the denominator. A query whose every key
//! is masked therefore produces a zero row instead of NaNs.

use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};

use crate::core::{Attention, AttentionError, AttentionMasks, AttentionOutput, Config};
use crate::masks::build_causal_mask;

/// Added to the softmax denominator to keep fully masked rows finite.
const EPSILON: f64 = 1e-7;

/// Subtracted from the scores of hidden keys.
const HIDDEN_PENALTY: f64 = 1e9;

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ScaledDotProductAttention {
    first_call: OnceLock<()>,
}

impl ScaledDotProductAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shape bookkeeping shared by the three operands.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Layout {
    leading: Vec<usize>,
    q_len: usize,
    k_len: usize,
    dim: usize,
    v_dim: usize,
}

impl Layout {
    fn infer(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self, AttentionError> {
        let rank = q.rank();
        if rank < 3 {
            return Err(AttentionError::shape(format!(
                "q must have shape [..leading, seq_len, dim] with at least one leading axis, got {:?}",
                q.dims()
            )));
        }
        if k.rank() != rank || v.rank() != rank {
            return Err(AttentionError::shape(format!(
                "q, k, v must share rank: got {:?}, {:?}, {:?}",
                q.dims(),
                k.dims(),
                v.dims()
            )));
        }

        let (q_dims, k_dims, v_dims) = (q.dims(), k.dims(), v.dims());
        let leading = &q_dims[..rank - 2];
        if &k_dims[..rank - 2] != leading || &v_dims[..rank - 2] != leading {
            return Err(AttentionError::shape(format!(
                "leading dims mismatch: q {:?}, k {:?}, v {:?}",
                q_dims, k_dims, v_dims
            )));
        }

        let (q_len, dim) = (q_dims[rank - 2], q_dims[rank - 1]);
        let (k_len, k_dim) = (k_dims[rank - 2], k_dims[rank - 1]);
        let (v_len, v_dim) = (v_dims[rank - 2], v_dims[rank - 1]);
        if k_dim != dim {
            return Err(AttentionError::shape(format!(
                "k trailing dim {k_dim} does not match q trailing dim {dim}"
            )));
        }
        if v_len != k_len {
            return Err(AttentionError::shape(format!(
                "v seq_len {v_len} does not match k seq_len {k_len}"
            )));
        }

        Ok(Self {
            leading: leading.to_vec(),
            q_len,
            k_len,
            dim,
            v_dim,
        })
    }

    fn batch(&self) -> usize {
        self.leading[0]
    }

    fn merged(&self) -> usize {
        self.leading.iter().product()
    }

    fn output_dims(&self) -> Vec<usize> {
        let mut dims = self.leading.clone();
        dims.push(self.q_len);
        dims.push(self.v_dim);
        dims
    }
}

fn work_dtype(dtype: DType) -> Result<DType, AttentionError> {
    match dtype {
        DType::F16 | DType::BF16 | DType::F32 => Ok(DType::F32),
        DType::F64 => Ok(DType::F64),
        other => Err(AttentionError::UnsupportedDType {
            requested: format!("{other:?}"),
        }),
    }
}

/// Expands a `[batch, k_len]` validity mask to `[merged, 1, k_len]` weights.
fn key_weights(mask: &Tensor, layout: &Layout, dtype: DType) -> Result<Tensor, AttentionError> {
    let batch = layout.batch();
    match mask.dims() {
        [mb, mk] if *mb == batch && *mk == layout.k_len => {}
        dims => {
            return Err(AttentionError::shape(format!(
                "key mask must have shape [{batch}, {}], got {dims:?}",
                layout.k_len
            )))
        }
    }

    let mask = mask.to_dtype(dtype)?;
    let keep = mask.ne(&mask.zeros_like()?)?.to_dtype(dtype)?;
    let rest = layout.merged() / batch;
    let keep = keep
        .reshape((batch, 1, layout.k_len))?
        .broadcast_as((batch, rest, layout.k_len))?
        .reshape((layout.merged(), 1, layout.k_len))?;
    Ok(keep)
}

impl Attention for ScaledDotProductAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        masks: AttentionMasks<'_>,
        config: &Config,
    ) -> Result<AttentionOutput, AttentionError> {
        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        let work = work_dtype(dtype)?;
        let layout = Layout::infer(q, k, v)?;

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init device={:?} dtype={:?} history_only={}",
                device.location(),
                dtype,
                config.history_only
            );
        }

        let merged = layout.merged();
        let q3 = q
            .to_dtype(work)?
            .contiguous()?
            .reshape((merged, layout.q_len, layout.dim))?;
        let k3 = k
            .to_dtype(work)?
            .contiguous()?
            .reshape((merged, layout.k_len, layout.dim))?;
        let v3 = v
            .to_dtype(work)?
            .contiguous()?
            .reshape((merged, layout.k_len, layout.v_dim))?;

        let scale = 1.0 / (layout.dim as f64).sqrt();
        let scores = q3.matmul(&k3.t()?.contiguous()?)?.affine(scale, 0.0)?;

        let mut keep: Option<Tensor> = None;
        if config.history_only {
            let causal = build_causal_mask(device, layout.q_len, layout.k_len)?.to_dtype(work)?;
            keep = Some(causal.unsqueeze(0)?);
        }
        if let Some(mask) = masks.key {
            if !device.same_device(mask.device()) {
                return Err(AttentionError::shape(
                    "key mask must reside on the same device as q",
                ));
            }
            let valid = key_weights(mask, &layout, work)?;
            keep = Some(match keep {
                Some(causal) => causal.broadcast_mul(&valid)?,
                None => valid,
            });
        }

        // Hidden keys are pushed far below every visible score before the row
        // max is taken, so they can neither win the max nor carry weight.
        let weights = match &keep {
            Some(keep) => {
                let masked = scores.broadcast_add(&keep.affine(HIDDEN_PENALTY, -HIDDEN_PENALTY)?)?;
                masked
                    .broadcast_sub(&masked.max_keepdim(D::Minus1)?)?
                    .exp()?
                    .broadcast_mul(keep)?
            }
            None => scores
                .broadcast_sub(&scores.max_keepdim(D::Minus1)?)?
                .exp()?,
        };

        let denom = weights.sum_keepdim(D::Minus1)?.affine(1.0, EPSILON)?;
        let probs = weights.broadcast_div(&denom)?;
        let output = probs
            .matmul(&v3)?
            .reshape(layout.output_dims())?
            .to_dtype(dtype)?;

        Ok(AttentionOutput {
            output,
            mask: masks.query.cloned(),
        })
    }
}
