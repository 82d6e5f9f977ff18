use std::sync::{Arc, Mutex};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use multi_head_attention::attention::masks::mask_from_lengths;
use multi_head_attention::attention::{AttentionError, Config};
use multi_head_attention::layers::{activations, CustomObjects, LayerError};
use multi_head_attention::{
    ActivationKind, Attention, AttentionMasks, AttentionOutput, ConstraintKind, HeadDispatch,
    InitializerKind, InputMask, InputShape, MultiHeadAttention, MultiHeadAttentionConfig,
    MultiHeadAttentionError, RegularizerKind, TensorShape, WeightStore,
};

fn uniform() -> InitializerKind {
    InitializerKind::RandomUniform {
        minval: -0.5,
        maxval: 0.5,
    }
}

fn random(shape: (usize, usize, usize)) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, shape, &Device::Cpu)?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

fn scenario_three_shape() -> InputShape {
    InputShape::triple(
        TensorShape::batched(&[2, 3]),
        TensorShape::batched(&[4, 5]),
        TensorShape::batched(&[4, 6]),
    )
}

/// Copies every kernel of `from` into `to`; both must be built for the same shapes.
fn copy_weights(from: &MultiHeadAttention, to: &MultiHeadAttention) -> Result<()> {
    for (src, dst) in from.trainable_vars().iter().zip(to.trainable_vars()) {
        dst.set(src.as_tensor())?;
    }
    Ok(())
}

#[test]
fn embedding_sized_self_attention_keeps_shape() -> Result<()> {
    let shape = InputShape::from(TensorShape::batched(&[512, 768]));
    let mut layer = MultiHeadAttention::new(MultiHeadAttentionConfig::named("mha", 12), WeightStore::cpu())?;
    assert_eq!(layer.compute_output_shape(&shape)?, TensorShape::batched(&[512, 768]));

    layer.build(shape)?;
    assert_eq!(layer.heads().len(), 12);
    assert!(layer.heads().iter().all(|h| h.width() == 64));

    let out = layer.forward(&random((2, 8, 768))?)?;
    assert_eq!(out.dims(), &[2, 8, 768]);
    Ok(())
}

#[test]
fn indivisible_feature_dim_fails_at_build() -> Result<()> {
    let mut layer = MultiHeadAttention::new(MultiHeadAttentionConfig::named("mha", 2), WeightStore::cpu())?;
    let err = layer.build(TensorShape::batched(&[2, 3])).unwrap_err();
    assert!(matches!(
        err,
        MultiHeadAttentionError::InvalidHeadNum {
            head_num: 2,
            feature_dim: 3
        }
    ));
    assert_eq!(err.to_string(), "Invalid head number 2 with the given input dim 3");
    assert!(!layer.is_built());
    assert!(layer.store().names()?.is_empty());
    Ok(())
}

#[test]
fn triple_input_uses_value_feature_dim() -> Result<()> {
    let mut layer = MultiHeadAttention::new(MultiHeadAttentionConfig::named("mha", 3), WeightStore::cpu())?;
    assert_eq!(
        layer.compute_output_shape(&scenario_three_shape())?,
        TensorShape::batched(&[2, 6])
    );

    let (q, k, v) = (random((2, 2, 3))?, random((2, 4, 5))?, random((2, 4, 6))?);
    let out = layer.call([&q, &k, &v], None)?;
    assert!(layer.is_built());
    assert_eq!(out.output.dims(), &[2, 2, 6]);
    assert!(out.mask.is_none());
    Ok(())
}

#[test]
fn build_succeeds_exactly_when_heads_divide_features() -> Result<()> {
    for head_num in 1..=6 {
        for feature_dim in 1..=12 {
            let config = MultiHeadAttentionConfig::named(format!("mha_{head_num}_{feature_dim}"), head_num);
            let mut layer = MultiHeadAttention::new(config, WeightStore::cpu())?;
            let result = layer.build(TensorShape::batched(&[4, feature_dim]));
            if feature_dim % head_num == 0 {
                result?;
                assert_eq!(layer.heads().len(), head_num);
            } else {
                assert!(matches!(result, Err(MultiHeadAttentionError::InvalidHeadNum { .. })));
            }
        }
    }
    Ok(())
}

#[test]
fn zero_heads_are_rejected_at_construction() {
    let err = MultiHeadAttention::new(MultiHeadAttentionConfig::named("mha", 0), WeightStore::cpu())
        .unwrap_err();
    assert!(matches!(err, MultiHeadAttentionError::InvalidConfig(_)));
}

#[test]
fn single_input_matches_repeated_triple() -> Result<()> {
    let config = MultiHeadAttentionConfig::named("mha", 2).with_kernel_initializer(uniform());
    let mut layer = MultiHeadAttention::new(config, WeightStore::cpu())?;
    layer.build(TensorShape::batched(&[5, 8]))?;

    let x = random((3, 5, 8))?;
    let single = layer.forward(&x)?;
    let triple = layer.forward([&x, &x, &x])?;
    assert_eq!(max_abs_diff(&single, &triple)?, 0.0);

    let again = layer.forward(&x)?;
    assert_eq!(single.to_vec3::<f32>()?, again.to_vec3::<f32>()?);
    Ok(())
}

#[test]
fn output_mask_is_the_query_mask() -> Result<()> {
    let mut layer = MultiHeadAttention::new(MultiHeadAttentionConfig::named("mha", 2), WeightStore::cpu())?;
    let device = Device::Cpu;
    let x = random((2, 3, 4))?;
    let query_mask = Tensor::new(&[[1u8, 1, 0], [1, 0, 0]], &device)?;
    let key_mask = Tensor::new(&[[1u8, 1, 1], [1, 1, 0]], &device)?;

    let shared = layer.call(&x, Some(InputMask::from(&query_mask)))?;
    let mask = shared.mask.expect("single mask is propagated");
    assert_eq!(mask.to_vec2::<u8>()?, query_mask.to_vec2::<u8>()?);

    let triple = layer.forward_with_mask(
        [&x, &x, &x],
        Some(InputMask::Triple {
            query: Some(&query_mask),
            key: Some(&key_mask),
            value: None,
        }),
    )?;
    let mask = triple.mask.expect("query mask is propagated");
    assert_eq!(mask.to_vec2::<u8>()?, query_mask.to_vec2::<u8>()?);

    let keys_only = layer.forward_with_mask(
        [&x, &x, &x],
        Some(InputMask::Triple {
            query: None,
            key: Some(&key_mask),
            value: None,
        }),
    )?;
    assert!(keys_only.mask.is_none());
    assert!(layer.compute_mask(None).is_none());
    Ok(())
}

#[test]
fn masked_keys_are_ignored() -> Result<()> {
    let config = MultiHeadAttentionConfig::named("mha", 2).with_kernel_initializer(uniform());
    let mut layer = MultiHeadAttention::new(config, WeightStore::cpu())?;
    layer.build(TensorShape::batched(&[5, 4]))?;

    let q = random((1, 4, 4))?;
    let kv = random((1, 5, 4))?;
    let key_mask = Tensor::new(&[[1f32, 1., 1., 0., 0.]], &Device::Cpu)?;
    let masked = layer.forward_with_mask(
        [&q, &kv, &kv],
        Some(InputMask::Triple {
            query: None,
            key: Some(&key_mask),
            value: None,
        }),
    )?;

    let valid = kv.narrow(1, 0, 3)?;
    let truncated = layer.forward([&q, &valid, &valid])?;
    assert!(max_abs_diff(&masked.output, &truncated)? < 1e-4);
    Ok(())
}

#[test]
fn history_only_ignores_future_positions() -> Result<()> {
    let config = MultiHeadAttentionConfig::named("mha", 2)
        .with_kernel_initializer(uniform())
        .with_history_only(true);
    let mut layer = MultiHeadAttention::new(config, WeightStore::cpu())?;
    layer.build(TensorShape::batched(&[4, 6]))?;

    let x = random((1, 4, 6))?;
    let tail = random((1, 1, 6))?;
    let changed = Tensor::cat(&[&x.narrow(1, 0, 3)?, &tail], 1)?;

    let a = layer.forward(&x)?.narrow(1, 0, 3)?;
    let b = layer.forward(&changed)?.narrow(1, 0, 3)?;
    assert!(max_abs_diff(&a, &b)? < 1e-4);
    Ok(())
}

/// Single-head layer whose kernels are all the identity, so scores are raw dot products.
fn identity_layer(name: &str, history_only: bool) -> Result<MultiHeadAttention> {
    let config = MultiHeadAttentionConfig::named(name, 1)
        .without_activation()
        .with_history_only(history_only);
    let mut layer = MultiHeadAttention::new(config, WeightStore::cpu())?;
    layer.build(TensorShape::batched(&[2, 2]))?;
    let identity = Tensor::eye(2, DType::F32, &Device::Cpu)?;
    for var in layer.trainable_vars() {
        var.set(&identity)?;
    }
    Ok(layer)
}

#[test]
fn dominant_future_token_does_not_leak_into_history() -> Result<()> {
    let layer = identity_layer("causal", true)?;
    let device = Device::Cpu;
    let quiet = Tensor::new(&[[[10f32, 0.], [0., 0.]]], &device)?;
    // Scaled score of the second token against the first is ~84.9.
    let loud = Tensor::new(&[[[10f32, 0.], [12., 0.]]], &device)?;

    let a = layer.forward(&quiet)?.narrow(1, 0, 1)?;
    let b = layer.forward(&loud)?.narrow(1, 0, 1)?;
    assert!(max_abs_diff(&a, &b)? < 1e-4);
    let first = b.flatten_all()?.to_vec1::<f32>()?;
    assert!((first[0] - 10.0).abs() < 1e-4 && first[1].abs() < 1e-4, "{first:?}");
    Ok(())
}

#[test]
fn dominant_padded_key_does_not_leak_into_valid_keys() -> Result<()> {
    let layer = identity_layer("padded", false)?;
    let device = Device::Cpu;
    let q = Tensor::new(&[[[10f32, 0.], [0., 10.]]], &device)?;
    let kv = Tensor::new(&[[[1f32, 1.], [12., 0.]]], &device)?;
    let key_mask = mask_from_lengths(&device, &[1], 2)?;

    let out = layer.forward_with_mask(
        [&q, &kv, &kv],
        Some(InputMask::Triple {
            query: None,
            key: Some(&key_mask),
            value: None,
        }),
    )?;
    // Only the first key is valid, so each query returns it unchanged.
    for row in &out.output.to_vec3::<f32>()?[0] {
        assert!((row[0] - 1.0).abs() < 1e-4 && (row[1] - 1.0).abs() < 1e-4, "{row:?}");
    }
    Ok(())
}

#[test]
fn batched_dispatch_matches_per_head() -> Result<()> {
    let base = MultiHeadAttentionConfig::named("mha", 4)
        .with_kernel_initializer(uniform())
        .with_history_only(true);
    let mut per_head = MultiHeadAttention::new(base.clone(), WeightStore::cpu())?;
    let mut batched = MultiHeadAttention::new(
        base.with_head_dispatch(HeadDispatch::Batched),
        WeightStore::cpu(),
    )?;
    let shape = TensorShape::batched(&[6, 8]);
    per_head.build(shape.clone())?;
    batched.build(shape)?;
    copy_weights(&per_head, &batched)?;

    let x = random((2, 6, 8))?;
    let mask = mask_from_lengths(&Device::Cpu, &[6, 4], 6)?;
    let a = per_head.forward_with_mask(&x, Some(InputMask::from(&mask)))?;
    let b = batched.forward_with_mask(&x, Some(InputMask::from(&mask)))?;
    assert!(max_abs_diff(&a.output, &b.output)? < 1e-5);
    Ok(())
}

/// Returns its value slice untouched and records every call.
#[derive(Default)]
struct PassThrough {
    calls: Mutex<Vec<Vec<usize>>>,
}

impl Attention for PassThrough {
    fn attend(
        &self,
        _q: &Tensor,
        _k: &Tensor,
        v: &Tensor,
        masks: AttentionMasks<'_>,
        _config: &Config,
    ) -> std::result::Result<AttentionOutput, AttentionError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(v.dims().to_vec());
        }
        Ok(AttentionOutput {
            output: v.clone(),
            mask: masks.query.cloned(),
        })
    }
}

#[test]
fn heads_are_concatenated_in_order() -> Result<()> {
    for dispatch in [HeadDispatch::PerHead, HeadDispatch::Batched] {
        let config = MultiHeadAttentionConfig::named("mha", 3)
            .without_activation()
            .with_head_dispatch(dispatch);
        let kernel = Arc::new(PassThrough::default());
        let mut layer =
            MultiHeadAttention::new(config, WeightStore::cpu())?.with_attention(kernel.clone());
        layer.build(TensorShape::batched(&[4, 6]))?;

        let identity = Tensor::eye(6, DType::F32, &Device::Cpu)?;
        for var in layer.trainable_vars() {
            var.set(&identity)?;
        }

        let x = random((2, 4, 6))?;
        let out = layer.forward(&x)?;
        assert_eq!(out.to_vec3::<f32>()?, x.to_vec3::<f32>()?);

        let calls = kernel.calls.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        match dispatch {
            HeadDispatch::PerHead => assert_eq!(*calls, vec![vec![2, 4, 2]; 3]),
            HeadDispatch::Batched => assert_eq!(*calls, vec![vec![2, 3, 4, 2]]),
        }
    }
    Ok(())
}

#[test]
fn head_contexts_are_named_after_the_layer() -> Result<()> {
    let mut layer = MultiHeadAttention::new(MultiHeadAttentionConfig::named("Multi-Head", 3), WeightStore::cpu())?;
    assert!(layer.heads().is_empty());
    layer.build(TensorShape::batched(&[2, 9]))?;
    let names: Vec<_> = layer.heads().iter().map(|h| h.name.as_str()).collect();
    assert_eq!(names, ["Multi-Head-Att-1", "Multi-Head-Att-2", "Multi-Head-Att-3"]);
    let bounds: Vec<_> = layer.heads().iter().map(|h| (h.begin, h.end)).collect();
    assert_eq!(bounds, [(0, 3), (3, 6), (6, 9)]);
    Ok(())
}

#[test]
fn regularization_sums_over_all_kernels() -> Result<()> {
    let config = MultiHeadAttentionConfig::named("mha", 3)
        .with_kernel_initializer(InitializerKind::Ones)
        .with_kernel_regularizer(RegularizerKind::L2 { l2: 0.01 });
    let mut layer = MultiHeadAttention::new(config, WeightStore::cpu())?;
    assert!(matches!(
        layer.regularization_loss(),
        Err(MultiHeadAttentionError::NotBuilt { .. })
    ));

    layer.build(scenario_three_shape())?;
    // (3 + 5 + 6 + 6) * 6 unit entries
    let loss = layer.regularization_loss()?.to_scalar::<f32>()?;
    assert!((loss - 1.2).abs() < 1e-5, "loss {loss}");

    let mut plain = MultiHeadAttention::new(MultiHeadAttentionConfig::named("plain", 3), WeightStore::cpu())?;
    plain.build(scenario_three_shape())?;
    assert_eq!(plain.regularization_loss()?.to_scalar::<f32>()?, 0.0);
    Ok(())
}

#[test]
fn constraints_project_kernels_in_place() -> Result<()> {
    let config = MultiHeadAttentionConfig::named("mha", 2)
        .with_kernel_initializer(InitializerKind::RandomUniform {
            minval: -1.0,
            maxval: 1.0,
        })
        .with_kernel_constraint(ConstraintKind::NonNeg);
    let mut layer = MultiHeadAttention::new(config, WeightStore::cpu())?;
    layer.build(TensorShape::batched(&[3, 4]))?;
    layer.apply_constraints()?;

    for var in layer.trainable_vars() {
        let min = var.as_tensor().flatten_all()?.min(0)?.to_scalar::<f32>()?;
        assert!(min >= 0.0);
    }
    Ok(())
}

#[test]
fn layers_sharing_a_store_get_unique_weight_names() -> Result<()> {
    let store = WeightStore::cpu();
    let mut first = MultiHeadAttention::new(MultiHeadAttentionConfig::new(2), store.clone())?;
    let mut second = MultiHeadAttention::new(MultiHeadAttentionConfig::new(2), store.clone())?;
    assert_ne!(first.name(), second.name());
    first.build(TensorShape::batched(&[3, 4]))?;
    second.build(TensorShape::batched(&[3, 4]))?;
    assert_eq!(store.names()?.len(), 8);
    assert_eq!(store.all_vars().len(), 8);

    let mut clash = MultiHeadAttention::new(
        MultiHeadAttentionConfig::named(first.name(), 2),
        store.clone(),
    )?;
    let err = clash.build(TensorShape::batched(&[3, 4])).unwrap_err();
    assert!(matches!(
        err,
        MultiHeadAttentionError::Layer(LayerError::DuplicateWeight { .. })
    ));
    Ok(())
}

#[test]
fn lifecycle_errors() -> Result<()> {
    let mut layer = MultiHeadAttention::new(MultiHeadAttentionConfig::named("mha", 2), WeightStore::cpu())?;
    let x = random((1, 3, 4))?;
    assert!(matches!(
        layer.forward(&x),
        Err(MultiHeadAttentionError::NotBuilt { .. })
    ));

    layer.call(&x, None)?;
    assert!(matches!(
        layer.build(TensorShape::batched(&[3, 4])),
        Err(MultiHeadAttentionError::AlreadyBuilt { .. })
    ));
    // A later call reuses the existing weights.
    layer.call(&x, None)?;

    let wide = random((1, 3, 8))?;
    assert!(matches!(
        layer.call(&wide, None),
        Err(MultiHeadAttentionError::InvalidInputShape(_))
    ));
    Ok(())
}

#[test]
fn custom_activation_resolves_through_registry() -> Result<()> {
    let config = MultiHeadAttentionConfig::named("mha", 2).with_activation("double");
    assert_eq!(config.activation, Some(ActivationKind::Custom("double".into())));

    let err = MultiHeadAttention::new(config.clone(), WeightStore::cpu()).unwrap_err();
    assert!(matches!(
        err,
        MultiHeadAttentionError::Layer(LayerError::UnknownObject { .. })
    ));

    let custom = CustomObjects::new().with_activation(activations::custom("double", |t| t.affine(2.0, 0.0)))?;
    let mut doubled = MultiHeadAttention::with_custom_objects(config, WeightStore::cpu(), custom)?;
    let mut linear = MultiHeadAttention::new(
        MultiHeadAttentionConfig::named("mha", 2).without_activation(),
        WeightStore::cpu(),
    )?;
    doubled.build(TensorShape::batched(&[3, 4]))?;
    linear.build(TensorShape::batched(&[3, 4]))?;
    copy_weights(&doubled, &linear)?;

    let x = random((1, 3, 4))?;
    assert_eq!(doubled.forward(&x)?.dims(), linear.forward(&x)?.dims());
    assert!(max_abs_diff(&doubled.forward(&x)?, &linear.forward(&x)?)? > 0.0);
    Ok(())
}
