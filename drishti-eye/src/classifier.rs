//! Confidence to operator state mapping.

use drishti_core::{Detection, SystemState, ThresholdConfig};

/// Maps detector confidences to a [`SystemState`].
///
/// Both thresholds are inclusive lower bounds of their band. The classifier
/// holds no mutable state and has no side effects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyClassifier {
    thresholds: ThresholdConfig,
}

impl SafetyClassifier {
    pub fn new(thresholds: ThresholdConfig) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> ThresholdConfig {
        self.thresholds
    }

    /// `(state, max_confidence)`; an empty list is `(SAFE_MODE, 0.0)`.
    pub fn classify(&self, detections: &[Detection]) -> (SystemState, f32) {
        let max_confidence = detections
            .iter()
            .map(|d| d.confidence)
            .filter(|c| !c.is_nan())
            .fold(None, |acc: Option<f32>, c| Some(acc.map_or(c, |m| m.max(c))));

        match max_confidence {
            None => (SystemState::SafeMode, 0.0),
            Some(max) => (self.band(max), max),
        }
    }

    fn band(&self, confidence: f32) -> SystemState {
        if confidence >= self.thresholds.confirmed_threat {
            SystemState::ConfirmedThreat
        } else if confidence >= self.thresholds.potential_anomaly {
            SystemState::PotentialAnomaly
        } else {
            SystemState::SafeMode
        }
    }
}

impl Default for SafetyClassifier {
    fn default() -> Self {
        Self::new(ThresholdConfig::default())
    }
}
