//! Domain layer types and invariants.

pub mod fence;
pub mod protocol;
pub mod strategy;
