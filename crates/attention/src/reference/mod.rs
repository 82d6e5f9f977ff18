//! Portable, exact implementation of scaled dot-product attention.
//!
//! This path favours clarity over absolute performance and serves as the
//! baseline every other attention kernel is validated against.

pub mod scaled_dot;

pub use scaled_dot::ScaledDotProductAttention;
