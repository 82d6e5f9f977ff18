//! Construction-time configuration of [`MultiHeadAttention`](crate::MultiHeadAttention).
//!
//! The configuration is plain data: strategies are stored as identifiers and
//! resolved once when the layer is constructed. It serialises to a flat JSON
//! object, which is enough to rebuild an equivalent, not yet built layer.

use std::sync::atomic::{AtomicUsize, Ordering};

use layers::{ActivationKind, ConstraintKind, InitializerKind, RegularizerKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MultiHeadAttentionError, Result};

const DEFAULT_NAME: &str = "multi_head_attention";

static AUTO_NAMES: AtomicUsize = AtomicUsize::new(0);

fn next_layer_name() -> String {
    match AUTO_NAMES.fetch_add(1, Ordering::Relaxed) {
        0 => DEFAULT_NAME.to_string(),
        n => format!("{DEFAULT_NAME}_{n}"),
    }
}

fn default_activation() -> Option<ActivationKind> {
    Some(ActivationKind::Relu)
}

/// How per-head attention calls are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadDispatch {
    /// One attention call per head on a slice of the joint feature axis.
    #[default]
    PerHead,
    /// A single call over an added head axis, `[batch, heads, seq, head_dim]`.
    Batched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiHeadAttentionConfig {
    /// Layer name; prefixes weight and head identifiers.
    pub name: String,
    pub head_num: usize,
    /// Applied after every projection; `None` disables it.
    #[serde(default = "default_activation")]
    pub activation: Option<ActivationKind>,
    #[serde(default)]
    pub kernel_initializer: InitializerKind,
    #[serde(default)]
    pub kernel_regularizer: Option<RegularizerKind>,
    #[serde(default)]
    pub kernel_constraint: Option<ConstraintKind>,
    /// Causal masking inside every head.
    #[serde(default)]
    pub history_only: bool,
    #[serde(default)]
    pub head_dispatch: HeadDispatch,
}

impl MultiHeadAttentionConfig {
    /// Default configuration with a generated, process-unique name.
    pub fn new(head_num: usize) -> Self {
        Self::named(next_layer_name(), head_num)
    }

    pub fn named(name: impl Into<String>, head_num: usize) -> Self {
        Self {
            name: name.into(),
            head_num,
            activation: default_activation(),
            kernel_initializer: InitializerKind::default(),
            kernel_regularizer: None,
            kernel_constraint: None,
            history_only: false,
            head_dispatch: HeadDispatch::default(),
        }
    }

    pub fn with_activation(mut self, activation: impl Into<ActivationKind>) -> Self {
        self.activation = Some(activation.into());
        self
    }

    pub fn without_activation(mut self) -> Self {
        self.activation = None;
        self
    }

    pub fn with_kernel_initializer(mut self, initializer: InitializerKind) -> Self {
        self.kernel_initializer = initializer;
        self
    }

    pub fn with_kernel_regularizer(mut self, regularizer: RegularizerKind) -> Self {
        self.kernel_regularizer = Some(regularizer);
        self
    }

    pub fn with_kernel_constraint(mut self, constraint: ConstraintKind) -> Self {
        self.kernel_constraint = Some(constraint);
        self
    }

    pub fn with_history_only(mut self, history_only: bool) -> Self {
        self.history_only = history_only;
        self
    }

    pub fn with_head_dispatch(mut self, dispatch: HeadDispatch) -> Self {
        self.head_dispatch = dispatch;
        self
    }

    /// Checks the invariants that do not depend on input shapes.
    pub fn validate(&self) -> Result<()> {
        if self.head_num == 0 {
            return Err(MultiHeadAttentionError::InvalidConfig(
                "head_num must be greater than zero".into(),
            ));
        }
        if self.name.is_empty() {
            return Err(MultiHeadAttentionError::InvalidConfig(
                "layer name must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Flat `name -> value` mapping of every construction parameter.
    pub fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(MultiHeadAttentionError::InvalidConfig(format!(
                "configuration serialised to a non-object value: {other}"
            ))),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        let config: Self = serde_json::from_value(Value::Object(map))?;
        config.validate()?;
        Ok(config)
    }
}
