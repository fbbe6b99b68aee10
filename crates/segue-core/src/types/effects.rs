//! Effects configuration applied uniformly by every decode pipeline.

use serde::{Deserialize, Serialize};

/// One entry of the effects list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectSpec {
    /// Constant gain in decibels.
    Gain { decibels: f32 },
    /// First-difference high frequency emphasis.
    NoiseSharpening { strength: f32 },
}

impl EffectSpec {
    /// Returns true if the effect leaves samples untouched.
    pub fn is_identity(&self) -> bool {
        match self {
            Self::Gain { decibels } => decibels.abs() < f32::EPSILON,
            Self::NoiseSharpening { strength } => strength.abs() < f32::EPSILON,
        }
    }
}
