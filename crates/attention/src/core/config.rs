//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures per-call knobs that callers can toggle
//! without swapping implementations.

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Config {
    /// Restrict each query position to keys at or before its own index.
    ///
    /// When `false` every query may attend to the full key sequence.
    pub history_only: bool,
}

impl Config {
    /// Configuration with causal masking switched on.
    pub fn causal() -> Self {
        Self { history_only: true }
    }
}
