//! Named user strategies consulted when a `Custom { name }` identifier is
//! resolved.
//!
//! Built-in strategies never go through the registry. Registering an object
//! under a built-in name has no effect on how that name resolves.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::activations::{Activation, ActivationKind};
use crate::constraints::{Constraint, ConstraintKind};
use crate::initializers::{Initializer, InitializerKind};
use crate::regularizers::{Regularizer, RegularizerKind};
use crate::LayerError;

/// Registry of custom activations, initializers, regularizers and constraints.
#[derive(Clone, Default)]
pub struct CustomObjects {
    activations: HashMap<String, Arc<dyn Activation>>,
    initializers: HashMap<String, Arc<dyn Initializer>>,
    regularizers: HashMap<String, Arc<dyn Regularizer>>,
    constraints: HashMap<String, Arc<dyn Constraint>>,
}

impl CustomObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom activation under its name.
    ///
    /// Names that resolve to a built-in (including aliases such as `swish`)
    /// are rejected, since lookups for them never reach the registry.
    pub fn with_activation(mut self, activation: Arc<dyn Activation>) -> Result<Self, LayerError> {
        let name = match activation.kind() {
            ActivationKind::Custom(name) => name,
            other => return Err(reserved("activation", other.name())),
        };
        if resolves_to_builtin::<ActivationKind>(&name, |k| matches!(k, ActivationKind::Custom(_))) {
            return Err(reserved("activation", name));
        }
        self.activations.insert(name, activation);
        Ok(self)
    }

    pub fn with_initializer(mut self, initializer: Arc<dyn Initializer>) -> Result<Self, LayerError> {
        let name = match initializer.kind() {
            InitializerKind::Custom { name } => name,
            other => return Err(reserved("initializer", format!("{other:?}"))),
        };
        if resolves_to_builtin::<InitializerKind>(&name, |k| matches!(k, InitializerKind::Custom { .. })) {
            return Err(reserved("initializer", name));
        }
        self.initializers.insert(name, initializer);
        Ok(self)
    }

    pub fn with_regularizer(mut self, regularizer: Arc<dyn Regularizer>) -> Result<Self, LayerError> {
        let name = match regularizer.kind() {
            RegularizerKind::Custom { name } => name,
            other => return Err(reserved("regularizer", format!("{other:?}"))),
        };
        if resolves_to_builtin::<RegularizerKind>(&name, |k| matches!(k, RegularizerKind::Custom { .. })) {
            return Err(reserved("regularizer", name));
        }
        self.regularizers.insert(name, regularizer);
        Ok(self)
    }

    pub fn with_constraint(mut self, constraint: Arc<dyn Constraint>) -> Result<Self, LayerError> {
        let name = match constraint.kind() {
            ConstraintKind::Custom { name } => name,
            other => return Err(reserved("constraint", format!("{other:?}"))),
        };
        if resolves_to_builtin::<ConstraintKind>(&name, |k| matches!(k, ConstraintKind::Custom { .. })) {
            return Err(reserved("constraint", name));
        }
        self.constraints.insert(name, constraint);
        Ok(self)
    }

    pub fn activation(&self, name: &str) -> Option<Arc<dyn Activation>> {
        self.activations.get(name).cloned()
    }

    pub fn initializer(&self, name: &str) -> Option<Arc<dyn Initializer>> {
        self.initializers.get(name).cloned()
    }

    pub fn regularizer(&self, name: &str) -> Option<Arc<dyn Regularizer>> {
        self.regularizers.get(name).cloned()
    }

    pub fn constraint(&self, name: &str) -> Option<Arc<dyn Constraint>> {
        self.constraints.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
            && self.initializers.is_empty()
            && self.regularizers.is_empty()
            && self.constraints.is_empty()
    }
}

fn reserved(category: &'static str, name: impl Into<String>) -> LayerError {
    LayerError::ReservedName {
        category,
        name: name.into(),
    }
}

fn resolves_to_builtin<K>(name: &str, is_custom: fn(&K) -> bool) -> bool
where
    K: FromStr<Err = Infallible>,
{
    match name.parse::<K>() {
        Ok(kind) => !is_custom(&kind),
        Err(never) => match never {},
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<&String> {
    let mut names: Vec<&String> = map.keys().collect();
    names.sort();
    names
}

impl fmt::Debug for CustomObjects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomObjects")
            .field("activations", &sorted_keys(&self.activations))
            .field("initializers", &sorted_keys(&self.initializers))
            .field("regularizers", &sorted_keys(&self.regularizers))
            .field("constraints", &sorted_keys(&self.constraints))
            .finish()
    }
}
