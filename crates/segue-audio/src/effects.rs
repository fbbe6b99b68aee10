//! Effects applied to decoded audio before analysis.

use segue_core::EffectSpec;

use crate::buffering::decibels_to_gain;

#[derive(Debug, Clone)]
enum Stage {
    Gain(f32),
    NoiseSharpening { strength: f32, previous: Vec<f32> },
}

/// Ordered chain built from the effects configuration.
#[derive(Debug, Clone, Default)]
pub struct EffectChain {
    stages: Vec<Stage>,
}

impl EffectChain {
    pub fn new(specs: &[EffectSpec]) -> Self {
        let stages = specs
            .iter()
            .filter(|spec| !spec.is_identity())
            .map(|spec| match *spec {
                EffectSpec::Gain { decibels } => Stage::Gain(decibels_to_gain(decibels)),
                EffectSpec::NoiseSharpening { strength } => Stage::NoiseSharpening {
                    strength: strength.clamp(0.0, 2.0),
                    previous: Vec::new(),
                },
            })
            .collect();
        Self { stages }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Process planar audio in place.
    pub fn process(&mut self, planes: &mut [&mut [f32]]) {
        for stage in &mut self.stages {
            match stage {
                Stage::Gain(gain) => {
                    for plane in planes.iter_mut() {
                        plane.iter_mut().for_each(|s| *s *= *gain);
                    }
                }
                Stage::NoiseSharpening { strength, previous } => {
                    previous.resize(planes.len(), 0.0);
                    for (plane, last) in planes.iter_mut().zip(previous.iter_mut()) {
                        for sample in plane.iter_mut() {
                            let x = *sample;
                            *sample = (x + *strength * (x - *last)).clamp(-1.0, 1.0);
                            *last = x;
                        }
                    }
                }
            }
        }
    }

    /// Forget filter history, used after seeks.
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            if let Stage::NoiseSharpening { previous, .. } = stage {
                previous.clear();
            }
        }
    }
}
