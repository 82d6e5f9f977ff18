//! Building blocks shared by attention layers.
//!
//! The crate hosts the strategy catalogues a layer is configured with
//! (activations, kernel initializers, regularizers and constraints), the
//! registry used to resolve user supplied strategies by name, precision
//! helpers, and the [`WeightStore`](weights::WeightStore) that owns named,
//! trainable kernels.

pub mod activations;
pub mod checks;
pub mod constraints;
pub mod dtypes;
pub mod initializers;
pub mod linear;
pub mod registry;
pub mod regularizers;
pub mod weights;

use thiserror::Error;

pub use activations::{Activation, ActivationKind};
pub use constraints::{Constraint, ConstraintKind};
pub use dtypes::PrecisionPolicy;
pub use initializers::{Initializer, InitializerKind};
pub use registry::CustomObjects;
pub use regularizers::{Regularizer, RegularizerKind};
pub use weights::WeightStore;

/// Errors raised while resolving strategies or managing weights.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A custom strategy was requested by name but never registered.
    #[error("unknown {category} `{name}`; register it in CustomObjects")]
    UnknownObject { category: &'static str, name: String },
    /// A custom strategy was registered under a name that resolves to a built-in.
    #[error("{category} name `{name}` is reserved for a built-in")]
    ReservedName { category: &'static str, name: String },
    /// A weight with the same name already lives in the store.
    #[error("weight `{name}` already exists in the store")]
    DuplicateWeight { name: String },
    /// The weight store mutex was poisoned by a panicking writer.
    #[error("weight store lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
