//! Single-call inference path: validity gate, enhancer, bridge, detector,
//! classifier.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::bridge::NormalizationBridge;
use crate::classifier::SafetyClassifier;
use crate::models::{Detector, Enhancer};
use drishti_core::{
    DrishtiConfig, Frame, InferenceResult, SafeModeCause, SendEnhanced, SystemState,
};

/// Wraps the two opaque models behind one `infer(frame)` call.
///
/// Every failure is folded into a `SAFE_MODE` result with an error string.
/// Panics are not caught here; the scheduler owns that boundary.
pub struct InferenceGate {
    bridge: NormalizationBridge,
    classifier: SafetyClassifier,
    enhancer: Arc<dyn Enhancer>,
    detector: Arc<dyn Detector>,
    send_enhanced: SendEnhanced,
}

impl InferenceGate {
    pub fn new(
        bridge: NormalizationBridge,
        classifier: SafetyClassifier,
        enhancer: Arc<dyn Enhancer>,
        detector: Arc<dyn Detector>,
    ) -> Self {
        Self {
            bridge,
            classifier,
            enhancer,
            detector,
            send_enhanced: SendEnhanced::OnAnomaly,
        }
    }

    pub fn from_config(
        config: &DrishtiConfig,
        enhancer: Arc<dyn Enhancer>,
        detector: Arc<dyn Detector>,
    ) -> Self {
        Self::new(
            NormalizationBridge::from_config(&config.models),
            SafetyClassifier::new(config.thresholds),
            enhancer,
            detector,
        )
        .with_send_enhanced(config.models.send_enhanced)
    }

    pub fn with_send_enhanced(mut self, policy: SendEnhanced) -> Self {
        self.send_enhanced = policy;
        self
    }

    pub fn infer(&self, frame: &Frame) -> InferenceResult {
        let input = match self.bridge.to_enhancer_domain(frame.pixels.as_ref()) {
            Ok(tensor) => tensor,
            Err(rejection) => {
                debug!("Frame {} rejected: {}", frame.id, rejection);
                return InferenceResult::safe_mode(SafeModeCause::InvalidFrame(rejection.reason));
            }
        };

        let enhanced = match self.enhancer.enhance(&input) {
            Ok(tensor) => tensor,
            Err(e) => {
                warn!("Enhancer '{}' failed on frame {}: {}", self.enhancer.name(), frame.id, e);
                return InferenceResult::safe_mode(SafeModeCause::InferenceFailure(e.to_string()));
            }
        };

        let detector_input = self.bridge.to_detector_domain(&enhanced);
        let detections = match self.detector.detect(&detector_input) {
            Ok(detections) => detections,
            Err(e) => {
                warn!("Detector '{}' failed on frame {}: {}", self.detector.name(), frame.id, e);
                return InferenceResult::safe_mode(SafeModeCause::InferenceFailure(e.to_string()));
            }
        };

        let (state, max_confidence) = self.classifier.classify(&detections);
        let result = InferenceResult::classified(state, max_confidence, detections);

        if !self.attach_enhanced(state) {
            return result;
        }
        match self.bridge.to_display(&enhanced) {
            Ok(display) => result.with_enhanced(display),
            Err(e) => {
                warn!("Could not build enhanced image for frame {}: {}", frame.id, e);
                result
            }
        }
    }

    fn attach_enhanced(&self, state: SystemState) -> bool {
        match self.send_enhanced {
            SendEnhanced::Never => false,
            SendEnhanced::OnAnomaly => state >= SystemState::PotentialAnomaly,
            SendEnhanced::Always => true,
        }
    }
}
